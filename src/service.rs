//! Async service facade over the inference pipeline.
//!
//! This is the surface an HTTP layer consumes. Every blocking pipeline
//! operation — model loads, switches, generation, filesystem scans — runs on
//! a worker thread with a bounded wait, so a stuck load can never hang
//! request handling. A timed-out operation is abandoned by the caller but
//! runs to completion in the background, leaving the registry consistent for
//! later requests.

use crate::core::config::{AppConfig, GenerationSettings};
use crate::core::device::select_device;
use crate::core::errors::{ConfigError, InferenceError, LoadError};
use crate::eval::{BatchReport, EvalPair, evaluate_pairs};
use crate::pipeline::cache::InferenceCache;
use crate::pipeline::engine::{self, GenerationRequest, GenerationResult};
use crate::pipeline::registry::{AdapterDescriptor, ModelInfo, ModelRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::spawn_blocking;
use tracing::info;

/// Target of a model switch request.
pub const SWITCH_TARGET_BASE: &str = "base";

/// Errors surfaced by the service facade. The HTTP layer maps kinds to
/// status codes (`Timeout` → 504, `ResourceExhausted` → 503, `BadImage` →
/// 400, the rest → 500).
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// The generation seam: anything that can turn image bytes into a
/// [`GenerationResult`]. The production implementation pulls the active
/// handle from the registry; tests substitute doubles.
pub trait LatexGenerator: Send + Sync {
    fn generate(
        &self,
        image: &[u8],
        request: &GenerationRequest,
    ) -> Result<GenerationResult, InferenceError>;
}

struct VlmGenerator {
    registry: Arc<ModelRegistry>,
}

impl LatexGenerator for VlmGenerator {
    fn generate(
        &self,
        image: &[u8],
        request: &GenerationRequest,
    ) -> Result<GenerationResult, InferenceError> {
        // Pin the handle for the whole generation so a concurrent switch
        // cannot free the weights underneath us.
        let handle = self.registry.ensure_loaded()?;
        engine::generate(&handle, image, request)
    }
}

/// The service core: one shared model, a durable result cache, and mutable
/// generation settings. Constructed once at process start and shared by
/// reference with request handlers.
pub struct SnapTexService {
    registry: Arc<ModelRegistry>,
    cache: InferenceCache,
    generator: Arc<dyn LatexGenerator>,
    settings: RwLock<GenerationSettings>,
    load_timeout: Duration,
}

impl SnapTexService {
    /// Builds the service from configuration: selects the device, prepares
    /// the registry, and opens the cache. No model is loaded yet — the first
    /// inference triggers that lazily.
    pub fn new(config: &AppConfig) -> Result<Self, ConfigError> {
        config.generation.validate()?;
        let profile = select_device(config)?;
        let registry = Arc::new(ModelRegistry::new(config, profile));
        let generator: Arc<dyn LatexGenerator> = Arc::new(VlmGenerator {
            registry: Arc::clone(&registry),
        });
        Ok(Self {
            registry,
            cache: InferenceCache::open(&config.cache_dir),
            generator,
            settings: RwLock::new(config.generation),
            load_timeout: config.load_timeout,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_parts(
        registry: Arc<ModelRegistry>,
        cache: InferenceCache,
        generator: Arc<dyn LatexGenerator>,
        settings: GenerationSettings,
        load_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            generator,
            settings: RwLock::new(settings),
            load_timeout,
        }
    }

    async fn offload<T, F>(&self, op: F) -> Result<Result<T, ServiceError>, Duration>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    {
        let budget = self.load_timeout;
        match tokio::time::timeout(budget, spawn_blocking(op)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_err)) => Ok(Err(ServiceError::Inference(InferenceError::generation(
                format!("worker task failed: {join_err}"),
            )))),
            Err(_) => Err(budget),
        }
    }

    /// Generates LaTeX for the image, serving byte-identical repeats from
    /// the durable cache.
    pub async fn infer(&self, image: Vec<u8>) -> Result<GenerationResult, ServiceError> {
        let request = GenerationRequest::from(*self.settings.read().await);
        let cache = self.cache.clone();
        let generator = Arc::clone(&self.generator);

        match self
            .offload(move || {
                cache
                    .get_or_compute(&image, &request, || generator.generate(&image, &request))
                    .map_err(ServiceError::from)
            })
            .await
        {
            Ok(result) => result,
            Err(budget) => Err(ServiceError::Inference(InferenceError::Timeout {
                waited_ms: budget.as_millis() as u64,
            })),
        }
    }

    /// Reports the currently active model without triggering a load.
    pub async fn current_model(&self) -> Result<ModelInfo, ServiceError> {
        let registry = Arc::clone(&self.registry);
        match self.offload(move || Ok(registry.current_model_info())).await {
            Ok(result) => result,
            Err(budget) => Err(ServiceError::Timeout(budget)),
        }
    }

    /// Lists the adapters currently present in the artifacts directory.
    pub async fn list_adapters(&self) -> Result<Vec<AdapterDescriptor>, ServiceError> {
        let registry = Arc::clone(&self.registry);
        match self.offload(move || Ok(registry.discover_adapters())).await {
            Ok(result) => result,
            Err(budget) => Err(ServiceError::Timeout(budget)),
        }
    }

    /// Switches to the adapter at `target`, or back to the base checkpoint
    /// when `target` is `"base"`. Returns the refreshed model info.
    pub async fn switch_model(&self, target: &str) -> Result<ModelInfo, ServiceError> {
        let registry = Arc::clone(&self.registry);
        let target = target.to_string();
        info!(target = %target, "model switch requested");

        match self
            .offload(move || {
                if target == SWITCH_TARGET_BASE {
                    registry.revert_to_base().map_err(ServiceError::from)
                } else {
                    registry
                        .activate_adapter(Path::new(&target))
                        .map_err(ServiceError::from)
                }
            })
            .await
        {
            Ok(result) => result,
            Err(budget) => Err(ServiceError::Timeout(budget)),
        }
    }

    /// Current generation settings.
    pub async fn generation_settings(&self) -> GenerationSettings {
        *self.settings.read().await
    }

    /// Replaces the generation settings after validating every bound.
    /// Rejected values leave the previous settings untouched.
    pub async fn update_generation_settings(
        &self,
        settings: GenerationSettings,
    ) -> Result<GenerationSettings, ServiceError> {
        settings.validate()?;
        *self.settings.write().await = settings;
        Ok(settings)
    }

    /// Evaluates the model against ground-truth pairs, using the current
    /// generation settings.
    pub async fn evaluate(&self, pairs: Vec<EvalPair>) -> Result<BatchReport, ServiceError> {
        let request = GenerationRequest::from(*self.settings.read().await);
        let generator = Arc::clone(&self.generator);
        match self
            .offload(move || Ok(evaluate_pairs(generator.as_ref(), &pairs, &request)))
            .await
        {
            Ok(result) => result,
            Err(budget) => Err(ServiceError::Timeout(budget)),
        }
    }
}
