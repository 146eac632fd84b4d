//! # SnapTeX
//!
//! The model-lifecycle and inference-caching core of an image-to-LaTeX
//! service: a candle-based Qwen2-VL model behind a process-wide registry,
//! with durable content-addressed memoization of inference results and
//! support for switching between the base checkpoint and fine-tuned
//! adapters produced by an external training pipeline.
//!
//! ## Components
//!
//! - **Device selection**: accelerated backends load at half precision,
//!   CPU falls back to full precision
//! - **Model loading**: checkpoint directories (config, tokenizer, weights)
//!   resolved into inference-ready handles
//! - **Lifecycle management**: one active model at a time, atomic switches
//!   between base and adapters, adapter discovery from the artifacts
//!   directory
//! - **Inference**: fixed-instruction prompting, sampled decoding with
//!   temperature and min-p, token and latency accounting
//! - **Caching**: file-per-fingerprint results keyed by image content and
//!   generation parameters
//!
//! ## Modules
//!
//! * [`core`] - errors, configuration, device selection, fingerprints
//! * [`vl`] - the Qwen2-VL network (vision tower, text decoder, processing)
//! * [`pipeline`] - loader, registry, engine, and cache
//! * [`service`] - the async facade an HTTP layer consumes
//! * [`eval`] - scoring predictions against ground-truth pairs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snaptex::core::AppConfig;
//! use snaptex::service::SnapTexService;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::from_env()?;
//! let service = SnapTexService::new(&config)?;
//!
//! let image = std::fs::read("formula.png")?;
//! let result = service.infer(image).await?;
//! println!("{} ({} tokens, {} ms)", result.latex, result.tokens, result.time_ms);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod eval;
pub mod pipeline;
pub mod service;
pub mod vl;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        AppConfig, CacheError, ConfigError, GenerationSettings, InferenceError, LoadError,
    };
    pub use crate::pipeline::{
        AdapterDescriptor, GenerationRequest, GenerationResult, InferenceCache, ModelInfo,
        ModelKind, ModelRegistry,
    };
    pub use crate::service::{LatexGenerator, ServiceError, SnapTexService};
}
