//! Model loading: resolving an identifier into an inference-ready handle.
//!
//! A checkpoint directory must contain `config.json`, `tokenizer.json`, and
//! at least one `.safetensors` weight file. `preprocessor_config.json` is
//! optional and decides the tokenizer calling convention the engine uses.

use crate::core::device::{DeviceProfile, Precision};
use crate::core::errors::LoadError;
use crate::vl::config::ImageProcessorConfig;
use crate::vl::model::Qwen2Vl;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::info;

/// What a load request refers to: the base checkpoint or adapter artifacts
/// produced by a training job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// The base checkpoint directory.
    Base { dir: PathBuf },
    /// A fine-tuned adapter exported by the training pipeline.
    Adapter { dir: PathBuf },
}

impl ModelSource {
    /// Directory the weights live in.
    pub fn dir(&self) -> &Path {
        match self {
            Self::Base { dir } | Self::Adapter { dir } => dir,
        }
    }

    /// Identifier used in logs and error context.
    pub fn identifier(&self) -> String {
        match self {
            Self::Base { .. } => crate::core::config::BASE_MODEL_ID.to_string(),
            Self::Adapter { dir } => dir.display().to_string(),
        }
    }
}

/// Tokenizer calling convention, resolved once at load time.
///
/// Some checkpoints ship a bare `tokenizer.json`; others add a
/// `preprocessor_config.json` describing the image pipeline. The engine
/// dispatches on this variant explicitly instead of probing at call time.
pub enum TokenizerKind {
    /// Bare tokenizer; image preprocessing uses the model family defaults.
    Direct(Tokenizer),
    /// Tokenizer paired with checkpoint-specific image processing.
    Processor(VlProcessor),
    #[cfg(test)]
    Stub,
}

impl TokenizerKind {
    /// The wrapped tokenizer, independent of convention.
    pub fn tokenizer(&self) -> Option<&Tokenizer> {
        match self {
            Self::Direct(tokenizer) => Some(tokenizer),
            Self::Processor(processor) => Some(&processor.tokenizer),
            #[cfg(test)]
            Self::Stub => None,
        }
    }

    /// Image-processing parameters for this checkpoint.
    pub fn image_config(&self) -> ImageProcessorConfig {
        match self {
            Self::Direct(_) => ImageProcessorConfig::default(),
            Self::Processor(processor) => processor.image_cfg.clone(),
            #[cfg(test)]
            Self::Stub => ImageProcessorConfig::default(),
        }
    }
}

/// A tokenizer with its checkpoint-specific image-processor configuration.
pub struct VlProcessor {
    pub tokenizer: Tokenizer,
    pub image_cfg: ImageProcessorConfig,
}

/// The loaded network, behind an enum so lifecycle tests can substitute a
/// stub without touching real weights.
pub enum VlModel {
    Qwen2Vl(Qwen2Vl),
    #[cfg(test)]
    Stub,
}

/// An exclusively-owned (model, tokenizer) pair, ready for inference.
///
/// The registry hands out `Arc<ModelHandle>` clones; generation serializes on
/// [`ModelHandle::lock_session`] because decoding mutates the KV caches.
pub struct ModelHandle {
    pub(crate) model: VlModel,
    pub(crate) tokenizer: TokenizerKind,
    pub(crate) precision: Precision,
    session: Mutex<()>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("precision", &self.precision)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    /// Acquires the exclusive generation session for this handle.
    pub fn lock_session(&self) -> std::sync::MutexGuard<'_, ()> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Precision the weights were loaded at.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    #[cfg(test)]
    pub(crate) fn stub() -> Self {
        Self {
            model: VlModel::Stub,
            tokenizer: TokenizerKind::Stub,
            precision: Precision::Float32,
            session: Mutex::new(()),
        }
    }
}

/// Collects the `.safetensors` files of a checkpoint directory, sorted for
/// deterministic shard ordering.
pub fn collect_weight_files(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| LoadError::not_found(dir, format!("cannot read directory: {e}")))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == "safetensors")
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(LoadError::not_found(dir, "no .safetensors weight files"));
    }
    Ok(files)
}

/// Resolves `source` into a fully loaded, inference-ready [`ModelHandle`].
///
/// Blocking and potentially slow (seconds to minutes); callers in a request
/// context must offload and bound the wait.
pub fn load(source: &ModelSource, profile: &DeviceProfile) -> Result<ModelHandle, LoadError> {
    let identifier = source.identifier();
    let dir = source.dir();
    let started = Instant::now();

    if !dir.is_dir() {
        return Err(LoadError::not_found(dir, "directory does not exist"));
    }
    let weight_files = collect_weight_files(dir)?;

    if profile.precision == Precision::Int4 {
        return Err(LoadError::unsupported(
            &identifier,
            "4-bit quantized loading requires a pre-quantized checkpoint, which this backend does not support",
        ));
    }
    let dtype = profile.precision.dtype(&profile.device);

    let tokenizer_path = dir.join("tokenizer.json");
    if !tokenizer_path.is_file() {
        return Err(LoadError::not_found(dir, "missing tokenizer.json"));
    }
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
        LoadError::unsupported(&identifier, format!("failed to parse tokenizer.json: {e}"))
    })?;

    let preprocessor_path = dir.join("preprocessor_config.json");
    let tokenizer = if preprocessor_path.is_file() {
        let image_cfg = ImageProcessorConfig::from_path(&preprocessor_path)?;
        TokenizerKind::Processor(VlProcessor {
            tokenizer,
            image_cfg,
        })
    } else {
        TokenizerKind::Direct(tokenizer)
    };

    info!(
        identifier = %identifier,
        weights = weight_files.len(),
        precision = %profile.precision,
        "loading model"
    );

    let model = Qwen2Vl::load(dir, &weight_files, &identifier, profile.device.clone(), dtype)?;

    info!(
        identifier = %identifier,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "model loaded"
    );

    Ok(ModelHandle {
        model: VlModel::Qwen2Vl(model),
        tokenizer,
        precision: profile.precision,
        session: Mutex::new(()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::DeviceProfile;
    use candle_core::Device;

    fn cpu_profile(precision: Precision) -> DeviceProfile {
        DeviceProfile {
            device: Device::Cpu,
            precision,
        }
    }

    #[test]
    fn load_rejects_missing_directory() {
        let source = ModelSource::Adapter {
            dir: PathBuf::from("/definitely/not/here"),
        };
        let err = load(&source, &cpu_profile(Precision::Float32)).unwrap_err();
        assert!(matches!(err, LoadError::NotFound { .. }));
    }

    #[test]
    fn load_rejects_directory_without_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("training_config.json"), "{}").unwrap();
        let source = ModelSource::Adapter {
            dir: dir.path().to_path_buf(),
        };
        let err = load(&source, &cpu_profile(Precision::Float32)).unwrap_err();
        assert!(matches!(err, LoadError::NotFound { .. }));
    }

    #[test]
    fn load_rejects_int4_for_plain_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();
        let source = ModelSource::Adapter {
            dir: dir.path().to_path_buf(),
        };
        let err = load(&source, &cpu_profile(Precision::Int4)).unwrap_err();
        assert!(matches!(err, LoadError::Unsupported { .. }));
    }

    #[test]
    fn collect_weight_files_sorts_shards() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "model-00002-of-00002.safetensors",
            "model-00001-of-00002.safetensors",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        let files = collect_weight_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
    }

    #[test]
    fn base_source_reports_well_known_identifier() {
        let source = ModelSource::Base {
            dir: PathBuf::from("/models/base"),
        };
        assert_eq!(source.identifier(), crate::core::config::BASE_MODEL_ID);
    }
}
