//! Error types for the SnapTeX inference core.
//!
//! This module defines the error taxonomy used throughout the crate: model
//! loading errors, inference errors, cache errors, and configuration errors.
//! It also provides utility constructors for creating these errors with
//! appropriate context, and conversions from the underlying candle/image/io
//! error types at the crate boundary.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while resolving and loading a model checkpoint or adapter.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The identifier did not resolve to loadable artifacts: the directory is
    /// missing, or it contains no recognizable weight file.
    #[error("model artifacts not found at '{path}': {reason}")]
    NotFound {
        /// Path that failed to resolve.
        path: PathBuf,
        /// Why the path was rejected.
        reason: String,
    },

    /// The artifacts exist but cannot be loaded: malformed configuration,
    /// unexpected tensor layout, or a precision the backend cannot realize.
    #[error("unsupported model artifacts for '{identifier}': {context}")]
    Unsupported {
        /// Identifier (base name or adapter path) being loaded.
        identifier: String,
        /// What was unsupported.
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Loading ran out of device or host memory.
    #[error("resource exhausted while loading '{identifier}': {context}")]
    ResourceExhausted {
        /// Identifier being loaded.
        identifier: String,
        /// The operation that exhausted resources.
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl LoadError {
    /// Creates a `NotFound` error for a path with a reason.
    pub fn not_found(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::NotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `Unsupported` error without an underlying source.
    pub fn unsupported(identifier: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Unsupported {
            identifier: identifier.into(),
            context: context.into(),
            source: None,
        }
    }

    /// Creates an `Unsupported` error wrapping an underlying failure.
    pub fn unsupported_with(
        identifier: impl Into<String>,
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unsupported {
            identifier: identifier.into(),
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Converts a candle error raised during weight loading.
    ///
    /// Allocation failures map to `ResourceExhausted`, everything else to
    /// `Unsupported` with the failing operation as context.
    pub fn from_candle(
        identifier: impl Into<String>,
        context: impl Into<String>,
        err: candle_core::Error,
    ) -> Self {
        let identifier = identifier.into();
        let context = context.into();
        let message = err.to_string();
        if message.contains("out of memory") || message.contains("alloc") {
            Self::ResourceExhausted {
                identifier,
                context,
                source: Some(Box::new(err)),
            }
        } else {
            Self::Unsupported {
                identifier,
                context,
                source: Some(Box::new(err)),
            }
        }
    }
}

/// Errors raised while producing LaTeX from an image.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// The submitted bytes could not be decoded into an image.
    #[error("image decode failed")]
    BadImage(#[source] image::ImageError),

    /// No model could be made available for the request.
    #[error("model unavailable: {reason}")]
    ModelUnavailable {
        /// Why no model is available (load failure, missing artifacts, ...).
        reason: String,
    },

    /// The operation exceeded its time budget.
    #[error("inference timed out after {waited_ms} ms")]
    Timeout {
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// Tokenization or the generation loop itself failed.
    #[error("generation failed: {context}")]
    GenerationFailed {
        /// The operation that failed.
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl InferenceError {
    /// Creates a `GenerationFailed` error without an underlying source.
    pub fn generation(context: impl Into<String>) -> Self {
        Self::GenerationFailed {
            context: context.into(),
            source: None,
        }
    }

    /// Creates a `GenerationFailed` error wrapping an underlying failure.
    pub fn generation_with(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::GenerationFailed {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Converts a candle error raised inside the generation loop.
    pub fn from_candle(context: impl Into<String>, err: candle_core::Error) -> Self {
        Self::GenerationFailed {
            context: context.into(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<LoadError> for InferenceError {
    fn from(err: LoadError) -> Self {
        Self::ModelUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Errors raised by the durable inference cache.
///
/// Persistence failures are deliberately non-fatal: callers log them and fall
/// back to cache-miss behavior.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Writing a cache entry to durable storage failed.
    #[error("failed to persist cache entry '{path}'")]
    PersistFailed {
        /// Target file that could not be written.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// Creates a `PersistFailed` error for the given entry path.
    pub fn persist_failed(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::PersistFailed {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Errors raised while reading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration field holds a value outside its accepted range.
    #[error("invalid value for '{field}': {value} ({expected})")]
    InvalidValue {
        /// Field that failed validation.
        field: String,
        /// The rejected value, rendered for display.
        value: String,
        /// Description of the accepted range.
        expected: String,
    },

    /// An environment variable could not be parsed.
    #[error("environment variable '{name}' is malformed: {reason}")]
    BadEnvVar {
        /// Variable name.
        name: String,
        /// Why parsing failed.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an `InvalidValue` error with field context.
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }

    /// Creates a `BadEnvVar` error for the given variable.
    pub fn bad_env_var(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadEnvVar {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_into_inference_error_is_model_unavailable() {
        let err: InferenceError = LoadError::not_found("/missing", "no such directory").into();
        match err {
            InferenceError::ModelUnavailable { reason } => {
                assert!(reason.contains("/missing"));
            }
            other => panic!("expected ModelUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn candle_loader_errors_default_to_unsupported() {
        let candle_err = candle_core::Error::Msg("shape mismatch in lm_head".to_string());
        let err = LoadError::from_candle("Qwen2-VL-7B-Instruct", "load lm_head", candle_err);
        assert!(matches!(err, LoadError::Unsupported { .. }));
    }
}
