//! Runtime configuration for the inference core.
//!
//! Configuration is environment-driven with defaults matching the reference
//! deployment: the base checkpoint directory, the adapter artifacts directory
//! written by the training pipeline, the durable cache location, and the
//! generation sampling defaults.

use crate::core::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Well-known identifier of the base checkpoint.
pub const BASE_MODEL_ID: &str = "Qwen2-VL-7B-Instruct";

/// Display name reported for the base checkpoint.
pub const BASE_MODEL_NAME: &str = "Qwen2-VL 7B (Base)";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::bad_env_var(name, format!("cannot parse '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Sampling parameters applied to every generation request.
///
/// Out-of-range values are rejected by [`GenerationSettings::validate`], not
/// clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Upper bound on the number of newly generated tokens. Accepted range
    /// is `[1, 1024]`.
    pub max_new_tokens: usize,
    /// Sampling temperature in `[0.0, 2.0]`. Zero degenerates to greedy
    /// decoding.
    pub temperature: f32,
    /// Minimum-probability threshold in `[0.0, 1.0]`: candidates whose
    /// probability falls below `min_p * p_max` are excluded from sampling.
    pub min_p: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.7,
            min_p: 0.1,
        }
    }
}

impl GenerationSettings {
    /// Validates every field against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_new_tokens < 1 || self.max_new_tokens > 1024 {
            return Err(ConfigError::invalid_value(
                "max_new_tokens",
                self.max_new_tokens,
                "expected 1..=1024",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) || !self.temperature.is_finite() {
            return Err(ConfigError::invalid_value(
                "temperature",
                self.temperature,
                "expected 0.0..=2.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_p) || !self.min_p.is_finite() {
            return Err(ConfigError::invalid_value(
                "min_p",
                self.min_p,
                "expected 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration assembled from `SNAPTEX_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding the base checkpoint (config.json, tokenizer.json,
    /// *.safetensors).
    pub model_dir: PathBuf,
    /// Directory the training pipeline writes adapter artifacts into, one
    /// subdirectory per completed job.
    pub artifacts_dir: PathBuf,
    /// Directory for durable inference-cache entries.
    pub cache_dir: PathBuf,
    /// Optional device override ("cpu", "cuda", "cuda:N"). When absent the
    /// device selector probes the hardware.
    pub device: Option<String>,
    /// Optional precision override ("int4", "f16", "f32").
    pub precision: Option<String>,
    /// Budget for blocking model loads before the service reports a timeout.
    pub load_timeout: Duration,
    /// Initial generation settings.
    pub generation: GenerationSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models/base"),
            artifacts_dir: PathBuf::from("./models/training/outputs"),
            cache_dir: PathBuf::from("./cache"),
            device: None,
            precision: None,
            load_timeout: Duration::from_secs(300),
            generation: GenerationSettings::default(),
        }
    }
}

impl AppConfig {
    /// Builds a configuration from the environment, falling back to defaults
    /// for anything unset and validating the generation bounds.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let generation = GenerationSettings {
            max_new_tokens: parse_env("SNAPTEX_MAX_NEW_TOKENS")?
                .unwrap_or(defaults.generation.max_new_tokens),
            temperature: parse_env("SNAPTEX_TEMPERATURE")?
                .unwrap_or(defaults.generation.temperature),
            min_p: parse_env("SNAPTEX_MIN_P")?.unwrap_or(defaults.generation.min_p),
        };
        generation.validate()?;

        let load_timeout = parse_env::<u64>("SNAPTEX_LOAD_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.load_timeout);

        Ok(Self {
            model_dir: PathBuf::from(env_or(
                "SNAPTEX_MODEL_DIR",
                defaults.model_dir.to_str().unwrap_or("./models/base"),
            )),
            artifacts_dir: PathBuf::from(env_or(
                "SNAPTEX_ARTIFACTS_DIR",
                defaults
                    .artifacts_dir
                    .to_str()
                    .unwrap_or("./models/training/outputs"),
            )),
            cache_dir: PathBuf::from(env_or(
                "SNAPTEX_CACHE_DIR",
                defaults.cache_dir.to_str().unwrap_or("./cache"),
            )),
            device: std::env::var("SNAPTEX_DEVICE").ok(),
            precision: std::env::var("SNAPTEX_PRECISION").ok(),
            load_timeout,
            generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        GenerationSettings::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let settings = GenerationSettings {
            temperature: 2.5,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "temperature"));
    }

    #[test]
    fn rejects_zero_max_new_tokens() {
        let settings = GenerationSettings {
            max_new_tokens: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn accepts_boundary_values() {
        let settings = GenerationSettings {
            max_new_tokens: 1024,
            temperature: 0.0,
            min_p: 1.0,
        };
        settings.validate().unwrap();
    }

    #[test]
    fn rejects_non_finite_sampling_values() {
        let settings = GenerationSettings {
            temperature: f32::NAN,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
