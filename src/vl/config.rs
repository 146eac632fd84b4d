//! Serde types for the Qwen2-VL checkpoint configuration files.
//!
//! A checkpoint directory carries `config.json` (text + vision architecture),
//! optionally `preprocessor_config.json` (image processing parameters) and
//! `generation_config.json` (extra stop tokens).

use crate::core::errors::LoadError;
use serde::Deserialize;
use std::path::Path;

fn default_vision_hidden_act() -> String {
    "quick_gelu".to_string()
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, LoadError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        LoadError::not_found(path, format!("cannot read configuration: {e}"))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        LoadError::unsupported_with(path.display().to_string(), "malformed JSON configuration", e)
    })
}

/// Multi-axis RoPE layout: how the head dimension is split across the
/// temporal/height/width position axes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RopeScaling {
    #[serde(default)]
    pub mrope_section: Vec<usize>,
}

/// Vision tower architecture parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub depth: usize,
    pub embed_dim: usize,
    /// Output width expected by the language model.
    pub hidden_size: usize,
    #[serde(default = "default_vision_hidden_act")]
    pub hidden_act: String,
    pub mlp_ratio: f64,
    pub num_heads: usize,
    #[serde(alias = "in_chans", alias = "in_channels")]
    pub in_channels: usize,
    pub patch_size: usize,
    pub spatial_merge_size: usize,
    pub temporal_patch_size: usize,
}

impl VisionConfig {
    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio).round() as usize
    }
}

/// Full model configuration (`config.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct Qwen2VlConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    pub vision_start_token_id: u32,
    pub vision_end_token_id: u32,
    pub image_token_id: u32,
    pub video_token_id: u32,
    #[serde(default)]
    pub rope_scaling: RopeScaling,
    pub vision_config: VisionConfig,
}

impl Qwen2VlConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        read_json(path.as_ref())
    }

    pub fn head_dim(&self) -> Result<usize, LoadError> {
        if self.num_attention_heads == 0
            || !self.hidden_size.is_multiple_of(self.num_attention_heads)
        {
            return Err(LoadError::unsupported(
                "config.json",
                format!(
                    "hidden_size {} not divisible by num_attention_heads {}",
                    self.hidden_size, self.num_attention_heads
                ),
            ));
        }
        Ok(self.hidden_size / self.num_attention_heads)
    }
}

/// Image processor parameters (`preprocessor_config.json`).
///
/// The defaults mirror the Qwen2-VL reference processor so a checkpoint that
/// ships only a tokenizer still preprocesses correctly.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageProcessorConfig {
    #[serde(default = "ImageProcessorConfig::default_min_pixels")]
    pub min_pixels: u32,
    #[serde(default = "ImageProcessorConfig::default_max_pixels")]
    pub max_pixels: u32,
    #[serde(default = "ImageProcessorConfig::default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "ImageProcessorConfig::default_temporal_patch_size")]
    pub temporal_patch_size: usize,
    #[serde(default = "ImageProcessorConfig::default_merge_size")]
    pub merge_size: usize,
    #[serde(default = "ImageProcessorConfig::default_image_mean")]
    pub image_mean: Vec<f32>,
    #[serde(default = "ImageProcessorConfig::default_image_std")]
    pub image_std: Vec<f32>,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
}

impl ImageProcessorConfig {
    fn default_min_pixels() -> u32 {
        56 * 56
    }

    fn default_max_pixels() -> u32 {
        28 * 28 * 1280
    }

    fn default_patch_size() -> usize {
        14
    }

    fn default_temporal_patch_size() -> usize {
        2
    }

    fn default_merge_size() -> usize {
        2
    }

    fn default_image_mean() -> Vec<f32> {
        vec![0.481_454_66, 0.457_827_5, 0.408_210_73]
    }

    fn default_image_std() -> Vec<f32> {
        vec![0.268_629_54, 0.261_302_58, 0.275_777_11]
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.image_mean.len() != 3 || self.image_std.len() != 3 {
            return Err(LoadError::unsupported(
                "preprocessor_config.json",
                format!(
                    "image_mean/image_std must have length 3, got {}/{}",
                    self.image_mean.len(),
                    self.image_std.len()
                ),
            ));
        }
        if self.image_std.contains(&0.0) {
            return Err(LoadError::unsupported(
                "preprocessor_config.json",
                "image_std values must be non-zero",
            ));
        }
        if self.patch_size == 0 || self.merge_size == 0 || self.temporal_patch_size == 0 {
            return Err(LoadError::unsupported(
                "preprocessor_config.json",
                "patch_size/merge_size/temporal_patch_size must be > 0",
            ));
        }
        if self.min_pixels == 0 || self.max_pixels == 0 || self.min_pixels > self.max_pixels {
            return Err(LoadError::unsupported(
                "preprocessor_config.json",
                format!(
                    "invalid pixel bounds: min {} max {}",
                    self.min_pixels, self.max_pixels
                ),
            ));
        }
        if self.rescale_factor <= 0.0 {
            return Err(LoadError::unsupported(
                "preprocessor_config.json",
                "rescale_factor must be > 0",
            ));
        }
        Ok(())
    }
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self {
            min_pixels: Self::default_min_pixels(),
            max_pixels: Self::default_max_pixels(),
            patch_size: Self::default_patch_size(),
            temporal_patch_size: Self::default_temporal_patch_size(),
            merge_size: Self::default_merge_size(),
            image_mean: Self::default_image_mean(),
            image_std: Self::default_image_std(),
            rescale_factor: default_rescale_factor(),
        }
    }
}

/// Optional `generation_config.json`: extra EOS/pad token ids to honor as
/// stop conditions.
#[derive(Debug, Default, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multi(Vec<u32>),
}

impl GenerationConfig {
    /// Loads the file when present; a missing or malformed file yields the
    /// defaults since the main config already carries a usable EOS id.
    pub fn from_path_or_default(path: impl AsRef<Path>) -> Self {
        std::fs::read_to_string(path.as_ref())
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }

    /// All stop-token ids contributed by this file.
    pub fn stop_token_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        match &self.eos_token_id {
            Some(EosTokenId::Single(id)) => ids.push(*id),
            Some(EosTokenId::Multi(many)) => ids.extend(many.iter().copied()),
            None => {}
        }
        if let Some(pad) = self.pad_token_id {
            ids.push(pad);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_image_processor_validates() {
        ImageProcessorConfig::default().validate().unwrap();
    }

    #[test]
    fn image_processor_rejects_zero_std() {
        let config = ImageProcessorConfig {
            image_std: vec![0.0, 0.26, 0.27],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn generation_config_collects_all_stop_ids() {
        let config: GenerationConfig =
            serde_json::from_str(r#"{"eos_token_id": [151645, 151643], "pad_token_id": 151643}"#)
                .unwrap();
        let ids = config.stop_token_ids();
        assert_eq!(ids, vec![151645, 151643, 151643]);
    }

    #[test]
    fn missing_generation_config_is_default() {
        let config = GenerationConfig::from_path_or_default("/nonexistent/generation_config.json");
        assert!(config.stop_token_ids().is_empty());
    }

    #[test]
    fn model_config_parses_minimal_json() {
        let raw = r#"{
            "vocab_size": 152064,
            "hidden_size": 3584,
            "intermediate_size": 18944,
            "num_hidden_layers": 28,
            "num_attention_heads": 28,
            "num_key_value_heads": 4,
            "rms_norm_eps": 1e-6,
            "rope_theta": 1000000.0,
            "max_position_embeddings": 32768,
            "eos_token_id": 151645,
            "vision_start_token_id": 151652,
            "vision_end_token_id": 151653,
            "image_token_id": 151655,
            "video_token_id": 151656,
            "rope_scaling": {"mrope_section": [16, 24, 24]},
            "vision_config": {
                "depth": 32,
                "embed_dim": 1280,
                "hidden_size": 3584,
                "mlp_ratio": 4.0,
                "num_heads": 16,
                "in_chans": 3,
                "patch_size": 14,
                "spatial_merge_size": 2,
                "temporal_patch_size": 2
            }
        }"#;
        let config: Qwen2VlConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.head_dim().unwrap(), 128);
        assert_eq!(config.vision_config.mlp_hidden_dim(), 5120);
    }
}
