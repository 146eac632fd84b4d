//! The Qwen2-VL model facade: weight loading plus a single-image
//! prefill/step generation API.
//!
//! The model deliberately does not own sampling or tokenization — the
//! inference engine drives the decode loop and owns both. `prefill` returns
//! the logits of the last prompt position together with the rope delta the
//! engine needs to position subsequent steps.

use crate::core::errors::{InferenceError, LoadError};
use crate::vl::config::{GenerationConfig, Qwen2VlConfig};
use crate::vl::processing::ImageInputs;
use crate::vl::text::TextModel;
use crate::vl::vision::VisionModel;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear_no_bias};
use std::path::Path;

/// A loaded Qwen2-VL checkpoint ready for inference.
///
/// Candle modules carry no dropout or gradient state, so a constructed model
/// is in inference mode by definition.
pub struct Qwen2Vl {
    device: Device,
    dtype: DType,
    cfg: Qwen2VlConfig,
    text: TextModel,
    vision: VisionModel,
    lm_head: Linear,
    stop_token_ids: Vec<u32>,
}

impl Qwen2Vl {
    /// Loads a checkpoint from `model_dir` using the given weight files.
    ///
    /// `identifier` is only used to contextualize errors.
    pub fn load(
        model_dir: &Path,
        weight_files: &[std::path::PathBuf],
        identifier: &str,
        device: Device,
        dtype: DType,
    ) -> Result<Self, LoadError> {
        let cfg = Qwen2VlConfig::from_path(model_dir.join("config.json"))?;
        let head_dim = cfg.head_dim()?;
        if cfg.rope_scaling.mrope_section.iter().sum::<usize>() * 2 != head_dim {
            return Err(LoadError::unsupported(
                identifier,
                format!(
                    "rope_scaling.mrope_section {:?} does not cover head_dim {head_dim}",
                    cfg.rope_scaling.mrope_section
                ),
            ));
        }

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(weight_files, dtype, &device)
                .map_err(|e| LoadError::from_candle(identifier, "mmap safetensors", e))?
        };

        let text = TextModel::load(&cfg, head_dim, vb.pp("model"))
            .map_err(|e| LoadError::from_candle(identifier, "load text model", e))?;
        let vision = VisionModel::load(&cfg.vision_config, vb.pp("visual"))
            .map_err(|e| LoadError::from_candle(identifier, "load vision tower", e))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(text.token_embedding_weight(), None)
        } else {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))
                .map_err(|e| LoadError::from_candle(identifier, "load lm_head", e))?
        };

        let mut stop_token_ids = vec![cfg.eos_token_id];
        stop_token_ids.extend(
            GenerationConfig::from_path_or_default(model_dir.join("generation_config.json"))
                .stop_token_ids(),
        );
        if let Some(pad) = cfg.pad_token_id {
            stop_token_ids.push(pad);
        }
        stop_token_ids.sort_unstable();
        stop_token_ids.dedup();

        Ok(Self {
            device,
            dtype,
            cfg,
            text,
            vision,
            lm_head,
            stop_token_ids,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn image_token_id(&self) -> u32 {
        self.cfg.image_token_id
    }

    pub fn spatial_merge_size(&self) -> usize {
        self.cfg.vision_config.spatial_merge_size
    }

    /// True when the token terminates generation (EOS or pad).
    pub fn is_stop_token(&self, token: u32) -> bool {
        self.stop_token_ids.contains(&token)
    }

    /// EOS id, also used as the pad token during generation.
    pub fn eos_token_id(&self) -> u32 {
        self.cfg.eos_token_id
    }

    /// Replaces every occurrence of the image placeholder with `count`
    /// copies, so the prompt's token layout matches the vision embeddings.
    pub fn expand_image_tokens(&self, input_ids: &[u32], count: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(input_ids.len() + count);
        for &id in input_ids {
            if id == self.cfg.image_token_id {
                out.extend(std::iter::repeat_n(id, count));
            } else {
                out.push(id);
            }
        }
        out
    }

    /// Runs the vision tower and the prompt prefill, returning the logits of
    /// the final prompt position and the rope delta for subsequent steps.
    ///
    /// Callers must hold the owning handle's generation lock: this resets
    /// the KV caches.
    pub fn prefill(
        &self,
        image: &ImageInputs,
        input_ids: &[u32],
    ) -> Result<(Vec<f32>, i64), InferenceError> {
        let seq_len = input_ids.len();
        if seq_len == 0 {
            return Err(InferenceError::generation("empty prompt after tokenization"));
        }

        let image_token_count = image.token_count(self.spatial_merge_size());
        let placeholders = input_ids
            .iter()
            .filter(|&&id| id == self.cfg.image_token_id)
            .count();
        if placeholders != image_token_count {
            return Err(InferenceError::generation(format!(
                "prompt carries {placeholders} image tokens but the image produced {image_token_count}"
            )));
        }

        self.text.reset_session();

        let image_embeds = self
            .vision
            .forward(&image.pixel_values, image.grid)
            .map_err(|e| InferenceError::from_candle("vision forward", e))?;

        // Token embeddings with the image span replaced by vision output.
        let input_ids_t = Tensor::new(input_ids.to_vec(), &self.device)
            .and_then(|t| t.reshape((1, seq_len)))
            .map_err(|e| InferenceError::from_candle("build input_ids tensor", e))?;
        let mut inputs_embeds = self
            .text
            .embed(&input_ids_t)
            .map_err(|e| InferenceError::from_candle("embed prompt", e))?;

        if let Some(first_pos) = input_ids.iter().position(|&id| id == self.cfg.image_token_id) {
            let image_end = first_pos + image_token_count;
            let mut parts: Vec<Tensor> = Vec::with_capacity(3);
            if first_pos > 0 {
                parts.push(
                    inputs_embeds
                        .narrow(1, 0, first_pos)
                        .map_err(|e| InferenceError::from_candle("narrow prompt prefix", e))?,
                );
            }
            parts.push(
                image_embeds
                    .unsqueeze(0)
                    .and_then(|t| t.to_dtype(inputs_embeds.dtype()))
                    .map_err(|e| InferenceError::from_candle("insert image embeddings", e))?,
            );
            if image_end < seq_len {
                parts.push(
                    inputs_embeds
                        .narrow(1, image_end, seq_len - image_end)
                        .map_err(|e| InferenceError::from_candle("narrow prompt suffix", e))?,
                );
            }
            let refs: Vec<&Tensor> = parts.iter().collect();
            inputs_embeds = Tensor::cat(&refs, 1)
                .map_err(|e| InferenceError::from_candle("splice image embeddings", e))?;
        }

        let (position_ids, rope_delta) = self.rope_index(input_ids, image.grid)?;

        let hidden = self
            .text
            .forward(&inputs_embeds, &position_ids, true)
            .map_err(|e| InferenceError::from_candle("prefill forward", e))?;
        let logits = self.last_position_logits(&hidden, seq_len)?;
        Ok((logits, rope_delta))
    }

    /// Advances the decode by one token at absolute rope position `pos`.
    pub fn step(&self, token: u32, pos: i64) -> Result<Vec<f32>, InferenceError> {
        let token_t = Tensor::new(vec![token], &self.device)
            .and_then(|t| t.reshape((1, 1)))
            .map_err(|e| InferenceError::from_candle("build step token tensor", e))?;
        let embeds = self
            .text
            .embed(&token_t)
            .map_err(|e| InferenceError::from_candle("embed step token", e))?;

        let pos_t = Tensor::new(vec![pos, pos, pos], &self.device)
            .and_then(|t| t.reshape((3, 1, 1)))
            .map_err(|e| InferenceError::from_candle("build step position tensor", e))?;

        let hidden = self
            .text
            .forward(&embeds, &pos_t, false)
            .map_err(|e| InferenceError::from_candle("decode step forward", e))?;
        self.last_position_logits(&hidden, 1)
    }

    fn last_position_logits(
        &self,
        hidden: &Tensor,
        seq_len: usize,
    ) -> Result<Vec<f32>, InferenceError> {
        let last = hidden
            .i((0, seq_len - 1, ..))
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| InferenceError::from_candle("select last hidden state", e))?;
        self.lm_head
            .forward(&last)
            .and_then(|t| t.squeeze(0))
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_device(&Device::Cpu))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| InferenceError::from_candle("project logits", e))
    }

    /// Computes multi-axis position ids for a prompt containing one image
    /// span: text positions advance all three axes together, image patches
    /// spread over the height/width axes.
    fn rope_index(
        &self,
        input_ids: &[u32],
        grid: (usize, usize, usize),
    ) -> Result<(Tensor, i64), InferenceError> {
        let merge = self.spatial_merge_size();
        if merge == 0 {
            return Err(InferenceError::generation("spatial_merge_size must be > 0"));
        }
        let (t, h, w) = grid;
        let (llm_t, llm_h, llm_w) = (t as i64, (h / merge) as i64, (w / merge) as i64);

        let mut positions: Vec<[i64; 3]> = Vec::with_capacity(input_ids.len());
        let mut current_max: i64 = -1;

        let image_start = input_ids.iter().position(|&id| id == self.cfg.image_token_id);
        let (text_prefix, image_len) = match image_start {
            Some(start) => (start, (llm_t * llm_h * llm_w) as usize),
            None => (input_ids.len(), 0),
        };

        for i in 0..text_prefix {
            let p = i as i64;
            positions.push([p, p, p]);
            current_max = p;
        }

        if image_len > 0 {
            let base = current_max + 1;
            for tt in 0..llm_t {
                for hh in 0..llm_h {
                    for ww in 0..llm_w {
                        let pos = [base + tt, base + hh, base + ww];
                        current_max = current_max.max(pos[0]).max(pos[1]).max(pos[2]);
                        positions.push(pos);
                    }
                }
            }
        }

        let suffix_start = text_prefix + image_len;
        let base = current_max + 1;
        for (offset, _) in input_ids.iter().enumerate().skip(suffix_start) {
            let p = base + (offset - suffix_start) as i64;
            positions.push([p, p, p]);
            current_max = p;
        }

        if positions.len() != input_ids.len() {
            return Err(InferenceError::generation(format!(
                "rope position count mismatch: got {}, expected {}",
                positions.len(),
                input_ids.len()
            )));
        }

        let len = input_ids.len();
        let mut pos_ids: Vec<i64> = vec![0; 3 * len];
        for (i, v) in positions.iter().enumerate() {
            pos_ids[i] = v[0];
            pos_ids[len + i] = v[1];
            pos_ids[2 * len + i] = v[2];
        }
        let rope_delta = (current_max + 1) - len as i64;

        let position_ids = Tensor::from_vec(pos_ids, (3usize, 1usize, len), &self.device)
            .map_err(|e| InferenceError::from_candle("build position_ids tensor", e))?;
        Ok((position_ids, rope_delta))
    }
}
