//! Inference engine: image to LaTeX through the loaded model.
//!
//! The engine owns everything around the network: decoding the image,
//! building the fixed instruction prompt, dispatching on the tokenizer
//! calling convention, the sampled decode loop, and timing. It never mutates
//! the handle's configuration.

use crate::core::config::GenerationSettings;
use crate::core::errors::InferenceError;
use crate::pipeline::loader::{ModelHandle, TokenizerKind, VlModel, VlProcessor};
use crate::vl::model::Qwen2Vl;
use crate::vl::processing::{ImageInputs, preprocess_image};
use image::RgbImage;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::debug;

/// The fixed instruction sent with every image.
pub const INSTRUCTION: &str = "Write the LaTeX representation for this image.";

/// Sampling parameters for one generation call. Transient, constructed per
/// request from the current settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationRequest {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub min_p: f32,
}

impl From<GenerationSettings> for GenerationRequest {
    fn from(settings: GenerationSettings) -> Self {
        Self {
            max_new_tokens: settings.max_new_tokens,
            temperature: settings.temperature,
            min_p: settings.min_p,
        }
    }
}

/// The outcome of one generation: the LaTeX text, how many tokens were
/// generated, and wall-clock time. Serialized verbatim into cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub latex: String,
    pub tokens: u32,
    pub time_ms: u64,
}

/// Wraps the instruction in the chat template the model family expects.
fn build_prompt(instruction: &str) -> String {
    format!(
        "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n<|im_start|>user\n<|vision_start|><|image_pad|><|vision_end|>{instruction}<|im_end|>\n<|im_start|>assistant\n"
    )
}

fn encode_prompt(tokenizer: &Tokenizer, prompt: &str) -> Result<Vec<u32>, InferenceError> {
    let encoding = tokenizer
        .encode(prompt, false)
        .map_err(|e| InferenceError::generation(format!("tokenizer encode failed: {e}")))?;
    Ok(encoding.get_ids().to_vec())
}

/// Tokenizes the prompt and preprocesses the image for the given calling
/// convention, returning the expanded prompt ids and the image tensors.
fn prepare_inputs(
    handle: &ModelHandle,
    model: &Qwen2Vl,
    image: &RgbImage,
) -> Result<(Vec<u32>, ImageInputs), InferenceError> {
    match &handle.tokenizer {
        TokenizerKind::Direct(tokenizer) => {
            // Bare tokenizer: the model family's default image pipeline.
            let image_cfg = crate::vl::config::ImageProcessorConfig::default();
            let inputs = preprocess_image(image, &image_cfg, model.device(), model.dtype())?;
            let ids = encode_prompt(tokenizer, &build_prompt(INSTRUCTION))?;
            let ids = model.expand_image_tokens(&ids, inputs.token_count(model.spatial_merge_size()));
            Ok((ids, inputs))
        }
        TokenizerKind::Processor(VlProcessor {
            tokenizer,
            image_cfg,
        }) => {
            // Checkpoint-specific processor: its image configuration governs
            // preprocessing, the embedded tokenizer handles text.
            let inputs = preprocess_image(image, image_cfg, model.device(), model.dtype())?;
            let ids = encode_prompt(tokenizer, &build_prompt(INSTRUCTION))?;
            let ids = model.expand_image_tokens(&ids, inputs.token_count(model.spatial_merge_size()));
            Ok((ids, inputs))
        }
        #[cfg(test)]
        TokenizerKind::Stub => Err(InferenceError::generation("stub tokenizer cannot prepare inputs")),
    }
}

/// Produces LaTeX for one image.
///
/// Blocking and device-bound; request-context callers must offload. The
/// handle's generation session is held for the full decode, so concurrent
/// callers on the same handle serialize here.
pub fn generate(
    handle: &ModelHandle,
    image_bytes: &[u8],
    request: &GenerationRequest,
) -> Result<GenerationResult, InferenceError> {
    let started = Instant::now();

    let decoded = image::load_from_memory(image_bytes)
        .map_err(InferenceError::BadImage)?
        .to_rgb8();

    let model = match &handle.model {
        VlModel::Qwen2Vl(model) => model,
        #[cfg(test)]
        VlModel::Stub => {
            return Err(InferenceError::generation("stub model cannot generate"));
        }
    };
    let tokenizer = handle
        .tokenizer
        .tokenizer()
        .ok_or_else(|| InferenceError::generation("handle carries no tokenizer"))?;

    let (input_ids, image_inputs) = prepare_inputs(handle, model, &decoded)?;
    let input_len = input_ids.len();

    let _session = handle.lock_session();
    let (mut logits, rope_delta) = model.prefill(&image_inputs, &input_ids)?;

    let mut generated: Vec<u32> = Vec::new();
    let mut tokens_used = 0u32;
    let mut pos = input_len as i64 + rope_delta;

    for _ in 0..request.max_new_tokens {
        let token = select_next_token(&logits, request.temperature, request.min_p)?;
        tokens_used += 1;
        if model.is_stop_token(token) {
            break;
        }
        generated.push(token);
        logits = model.step(token, pos)?;
        pos += 1;
    }

    let text = tokenizer
        .decode(&generated, true)
        .map_err(|e| InferenceError::generation(format!("tokenizer decode failed: {e}")))?;

    let time_ms = started.elapsed().as_millis() as u64;
    debug!(
        input_tokens = input_len,
        generated_tokens = tokens_used,
        time_ms,
        "generation finished"
    );

    Ok(GenerationResult {
        latex: text.trim().to_string(),
        tokens: tokens_used,
        time_ms,
    })
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &val) in logits.iter().enumerate() {
        if !val.is_nan() && val > best_val {
            best_val = val;
            best_idx = idx;
        }
    }
    best_idx as u32
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let mut max = f32::NEG_INFINITY;
    for &val in logits {
        if val.is_finite() && val > max {
            max = val;
        }
    }
    let mut exps = Vec::with_capacity(logits.len());
    let mut sum = 0.0f32;
    for &val in logits {
        let exp = if val.is_finite() { (val - max).exp() } else { 0.0 };
        exps.push(exp);
        sum += exp;
    }
    if sum == 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

/// Samples the next token: temperature scaling followed by a min-p filter.
///
/// Candidates with probability below `min_p * p_max` are excluded before
/// categorical sampling. Temperature zero degenerates to greedy argmax.
fn select_next_token(logits: &[f32], temperature: f32, min_p: f32) -> Result<u32, InferenceError> {
    if logits.is_empty() {
        return Err(InferenceError::generation("model produced empty logits"));
    }
    if temperature <= 0.0 {
        return Ok(argmax(logits));
    }

    let scaled: Vec<f32> = logits.iter().map(|&v| v / temperature).collect();
    let mut probs = softmax(&scaled);

    let p_max = probs.iter().copied().fold(0.0f32, f32::max);
    if p_max == 0.0 {
        return Ok(argmax(logits));
    }
    let threshold = min_p * p_max;
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }

    match WeightedIndex::new(&probs) {
        Ok(dist) => Ok(dist.sample(&mut thread_rng()) as u32),
        Err(_) => Ok(argmax(logits)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_instruction_and_vision_markers() {
        let prompt = build_prompt(INSTRUCTION);
        assert!(prompt.contains(INSTRUCTION));
        assert!(prompt.contains("<|vision_start|><|image_pad|><|vision_end|>"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let logits = vec![0.1, 3.0, -1.0, 2.9];
        for _ in 0..16 {
            assert_eq!(select_next_token(&logits, 0.0, 0.1).unwrap(), 1);
        }
    }

    #[test]
    fn min_p_one_selects_the_mode() {
        // With min_p = 1.0 only tokens tied with the maximum survive.
        let logits = vec![0.0, 5.0, 1.0];
        for _ in 0..16 {
            assert_eq!(select_next_token(&logits, 0.7, 1.0).unwrap(), 1);
        }
    }

    #[test]
    fn min_p_filters_improbable_tokens() {
        // Token 0 dominates; token 2 is far below the threshold, so it must
        // never be sampled.
        let logits = vec![10.0, 9.5, -10.0];
        for _ in 0..64 {
            let token = select_next_token(&logits, 1.0, 0.2).unwrap();
            assert_ne!(token, 2);
        }
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn argmax_ignores_nan() {
        assert_eq!(argmax(&[f32::NAN, 1.0, 0.5]), 1);
    }

    #[test]
    fn garbage_bytes_are_bad_image() {
        let handle = ModelHandle::stub();
        let request = GenerationRequest::from(GenerationSettings::default());
        let err = generate(&handle, b"definitely not an image", &request).unwrap_err();
        assert!(matches!(err, InferenceError::BadImage(_)));
    }

    #[test]
    fn generation_result_round_trips_through_json() {
        let result = GenerationResult {
            latex: "e^{i\\pi} + 1 = 0".to_string(),
            tokens: 12,
            time_ms: 500,
        };
        let raw = serde_json::to_string(&result).unwrap();
        let back: GenerationResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, result);
    }
}
