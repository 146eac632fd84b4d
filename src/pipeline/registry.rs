//! Model registry: the process-wide lifecycle manager for the active model.
//!
//! The registry owns at most one active (model, tokenizer) handle at a time,
//! behind a single exclusive lock. Switching between the base checkpoint and
//! fine-tuned adapters loads the replacement fully before swapping, so a
//! failed switch always leaves the previous handle active. Adapter discovery
//! re-scans the artifacts directory on every call, making freshly completed
//! training jobs visible without a restart.

use crate::core::config::{AppConfig, BASE_MODEL_ID, BASE_MODEL_NAME};
use crate::core::device::DeviceProfile;
use crate::core::errors::LoadError;
use crate::pipeline::loader::{self, ModelHandle, ModelSource};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{info, warn};

/// Marker file a completed training job writes next to its weights.
pub const ADAPTER_CONFIG_MARKER: &str = "training_config.json";

/// A fine-tuned adapter discovered on disk. Immutable once constructed;
/// re-derived on every discovery call.
#[derive(Debug, Clone)]
pub struct AdapterDescriptor {
    /// Training job identifier (the artifact subdirectory name).
    pub job_id: String,
    /// Location of the adapter artifacts.
    pub path: PathBuf,
    /// Training hyperparameters recorded by the job.
    pub config: serde_json::Value,
    /// Creation time of the artifact directory.
    pub created_at: SystemTime,
}

impl AdapterDescriptor {
    /// Display name derived from the artifact directory.
    pub fn name(&self) -> &str {
        &self.job_id
    }
}

/// Which checkpoint the active handle came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ModelOrigin {
    Base,
    Adapter(PathBuf),
}

/// Identity of the currently active model, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// `"base"` or `"adapter"`.
    pub kind: ModelKind,
    /// Checkpoint identifier or adapter path.
    pub path: String,
    /// Human-readable name.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Base,
    Adapter,
}

struct RegistryState {
    handle: Option<Arc<ModelHandle>>,
    origin: ModelOrigin,
}

type LoaderFn = dyn Fn(&ModelSource, &DeviceProfile) -> Result<ModelHandle, LoadError> + Send + Sync;

/// Process-wide owner of the active model. Constructed once and shared by
/// reference; never a hidden global.
pub struct ModelRegistry {
    base_dir: PathBuf,
    artifacts_dir: PathBuf,
    profile: DeviceProfile,
    loader: Box<LoaderFn>,
    state: Mutex<RegistryState>,
}

impl ModelRegistry {
    /// Creates a registry over the configured checkpoint directories.
    pub fn new(config: &AppConfig, profile: DeviceProfile) -> Self {
        Self {
            base_dir: config.model_dir.clone(),
            artifacts_dir: config.artifacts_dir.clone(),
            profile,
            loader: Box::new(loader::load),
            state: Mutex::new(RegistryState {
                handle: None,
                origin: ModelOrigin::Base,
            }),
        }
    }

    /// Replaces the loader, so lifecycle tests can run without real weights.
    #[cfg(test)]
    pub(crate) fn with_loader(
        config: &AppConfig,
        profile: DeviceProfile,
        loader: impl Fn(&ModelSource, &DeviceProfile) -> Result<ModelHandle, LoadError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            base_dir: config.model_dir.clone(),
            artifacts_dir: config.artifacts_dir.clone(),
            profile,
            loader: Box::new(loader),
            state: Mutex::new(RegistryState {
                handle: None,
                origin: ModelOrigin::Base,
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the active handle, loading the base checkpoint on first use.
    /// Idempotent: an already-loaded handle is returned without reloading.
    pub fn ensure_loaded(&self) -> Result<Arc<ModelHandle>, LoadError> {
        let mut state = self.lock_state();
        if let Some(handle) = &state.handle {
            return Ok(Arc::clone(handle));
        }

        info!(model = BASE_MODEL_ID, "loading base model");
        let source = ModelSource::Base {
            dir: self.base_dir.clone(),
        };
        let handle = Arc::new((self.loader)(&source, &self.profile)?);
        state.handle = Some(Arc::clone(&handle));
        state.origin = ModelOrigin::Base;
        Ok(handle)
    }

    /// Activates the adapter at `path`, atomically replacing the active
    /// handle. On failure the previous state is left untouched.
    pub fn activate_adapter(&self, path: &Path) -> Result<ModelInfo, LoadError> {
        let mut state = self.lock_state();

        info!(adapter = %path.display(), "activating adapter");
        let source = ModelSource::Adapter {
            dir: path.to_path_buf(),
        };
        let handle = Arc::new((self.loader)(&source, &self.profile)?);

        // Swap only after the load fully succeeded; the previous weights are
        // released once the last in-flight generation drops its reference.
        state.handle = Some(handle);
        state.origin = ModelOrigin::Adapter(path.to_path_buf());
        Ok(Self::info_for(&state.origin))
    }

    /// Reloads the base checkpoint unconditionally — even when base is
    /// already active — so no adapter state can leak, and clears the adapter
    /// origin. On failure the previous state is left untouched.
    pub fn revert_to_base(&self) -> Result<ModelInfo, LoadError> {
        let mut state = self.lock_state();

        info!(model = BASE_MODEL_ID, "reverting to base model");
        let source = ModelSource::Base {
            dir: self.base_dir.clone(),
        };
        let handle = Arc::new((self.loader)(&source, &self.profile)?);

        state.handle = Some(handle);
        state.origin = ModelOrigin::Base;
        Ok(Self::info_for(&state.origin))
    }

    /// Reports the identity of the active model. Pure read: nothing is
    /// loaded, and an unloaded registry reports the base identity.
    pub fn current_model_info(&self) -> ModelInfo {
        let state = self.lock_state();
        Self::info_for(&state.origin)
    }

    fn info_for(origin: &ModelOrigin) -> ModelInfo {
        match origin {
            ModelOrigin::Base => ModelInfo {
                kind: ModelKind::Base,
                path: BASE_MODEL_ID.to_string(),
                name: BASE_MODEL_NAME.to_string(),
            },
            ModelOrigin::Adapter(path) => ModelInfo {
                kind: ModelKind::Adapter,
                path: path.display().to_string(),
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string()),
            },
        }
    }

    /// Scans the artifacts directory for completed training jobs.
    ///
    /// A subdirectory qualifies only when it carries the configuration
    /// marker and at least one weight file; malformed entries are skipped
    /// with a warning. Results are ordered newest-first.
    pub fn discover_adapters(&self) -> Vec<AdapterDescriptor> {
        let entries = match std::fs::read_dir(&self.artifacts_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut adapters = Vec::new();
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let marker = path.join(ADAPTER_CONFIG_MARKER);
            if !marker.is_file() {
                continue;
            }
            let has_weights = std::fs::read_dir(&path)
                .map(|mut dir| {
                    dir.any(|f| {
                        f.as_ref().is_ok_and(|f| {
                            f.path().extension().is_some_and(|ext| ext == "safetensors")
                        })
                    })
                })
                .unwrap_or(false);
            if !has_weights {
                continue;
            }

            let config = match std::fs::read_to_string(&marker)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
            {
                Ok(config) => config,
                Err(reason) => {
                    warn!(adapter = %path.display(), reason = %reason, "skipping adapter with unreadable config");
                    continue;
                }
            };

            let created_at = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.created().or_else(|_| meta.modified()).ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);

            adapters.push(AdapterDescriptor {
                job_id: entry.file_name().to_string_lossy().to_string(),
                path,
                config,
                created_at,
            });
        }

        adapters.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        adapters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::Precision;
    use candle_core::Device;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cpu_profile() -> DeviceProfile {
        DeviceProfile {
            device: Device::Cpu,
            precision: Precision::Float32,
        }
    }

    fn config_with(artifacts_dir: &Path) -> AppConfig {
        AppConfig {
            artifacts_dir: artifacts_dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn write_adapter(dir: &Path, job_id: &str, config_json: &str, with_weights: bool) -> PathBuf {
        let path = dir.join(job_id);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(ADAPTER_CONFIG_MARKER), config_json).unwrap();
        if with_weights {
            std::fs::write(path.join("adapter_model.safetensors"), b"").unwrap();
        }
        path
    }

    #[test]
    fn ensure_loaded_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = ModelRegistry::with_loader(
            &AppConfig::default(),
            cpu_profile(),
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ModelHandle::stub())
            },
        );

        let first = registry.ensure_loaded().unwrap();
        let second = registry.ensure_loaded().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unloaded_registry_reports_base_identity() {
        let registry =
            ModelRegistry::with_loader(&AppConfig::default(), cpu_profile(), |_, _| {
                Ok(ModelHandle::stub())
            });
        let info = registry.current_model_info();
        assert_eq!(info.kind, ModelKind::Base);
        assert_eq!(info.path, BASE_MODEL_ID);
    }

    #[test]
    fn failed_activation_leaves_state_unchanged() {
        let registry =
            ModelRegistry::with_loader(&AppConfig::default(), cpu_profile(), |source, _| {
                match source {
                    ModelSource::Base { .. } => Ok(ModelHandle::stub()),
                    ModelSource::Adapter { dir } => {
                        Err(LoadError::not_found(dir, "directory does not exist"))
                    }
                }
            });

        registry.ensure_loaded().unwrap();
        let before = registry.current_model_info();
        let err = registry
            .activate_adapter(Path::new("/missing/adapter"))
            .unwrap_err();
        assert!(matches!(err, LoadError::NotFound { .. }));
        assert_eq!(registry.current_model_info(), before);
    }

    #[test]
    fn activation_then_failed_switch_keeps_prior_adapter() {
        let registry =
            ModelRegistry::with_loader(&AppConfig::default(), cpu_profile(), |source, _| {
                match source {
                    ModelSource::Adapter { dir } if dir.ends_with("bad") => {
                        Err(LoadError::not_found(dir, "no weight files"))
                    }
                    _ => Ok(ModelHandle::stub()),
                }
            });

        let info = registry.activate_adapter(Path::new("/artifacts/job-7")).unwrap();
        assert_eq!(info.kind, ModelKind::Adapter);
        assert_eq!(info.name, "job-7");

        registry.activate_adapter(Path::new("/artifacts/bad")).unwrap_err();
        let current = registry.current_model_info();
        assert_eq!(current.kind, ModelKind::Adapter);
        assert_eq!(current.name, "job-7");
    }

    #[test]
    fn revert_to_base_clears_adapter_origin() {
        let registry =
            ModelRegistry::with_loader(&AppConfig::default(), cpu_profile(), |_, _| {
                Ok(ModelHandle::stub())
            });

        registry.activate_adapter(Path::new("/artifacts/job-3")).unwrap();
        assert_eq!(registry.current_model_info().kind, ModelKind::Adapter);

        let info = registry.revert_to_base().unwrap();
        assert_eq!(info.kind, ModelKind::Base);
        assert_eq!(registry.current_model_info().kind, ModelKind::Base);
    }

    #[test]
    fn revert_to_base_reloads_even_when_base_active() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = ModelRegistry::with_loader(
            &AppConfig::default(),
            cpu_profile(),
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ModelHandle::stub())
            },
        );

        registry.ensure_loaded().unwrap();
        registry.revert_to_base().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn discovery_requires_marker_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(dir.path(), "complete", r#"{"max_steps": 100}"#, true);
        write_adapter(dir.path(), "no-weights", r#"{"max_steps": 100}"#, false);
        // Weights but no marker.
        let unmarked = dir.path().join("no-marker");
        std::fs::create_dir_all(&unmarked).unwrap();
        std::fs::write(unmarked.join("adapter_model.safetensors"), b"").unwrap();

        let registry = ModelRegistry::with_loader(
            &config_with(dir.path()),
            cpu_profile(),
            |_, _| Ok(ModelHandle::stub()),
        );
        let adapters = registry.discover_adapters();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].job_id, "complete");
        assert_eq!(adapters[0].config["max_steps"], 100);
    }

    #[test]
    fn discovery_with_only_config_marker_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(dir.path(), "job-1", r#"{"max_steps": 30}"#, false);

        let registry = ModelRegistry::with_loader(
            &config_with(dir.path()),
            cpu_profile(),
            |_, _| Ok(ModelHandle::stub()),
        );
        assert!(registry.discover_adapters().is_empty());
    }

    #[test]
    fn discovery_skips_malformed_configs() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(dir.path(), "good", r#"{"max_steps": 100}"#, true);
        write_adapter(dir.path(), "broken", "not json at all", true);

        let registry = ModelRegistry::with_loader(
            &config_with(dir.path()),
            cpu_profile(),
            |_, _| Ok(ModelHandle::stub()),
        );
        let adapters = registry.discover_adapters();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].job_id, "good");
    }

    #[test]
    fn discovery_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(dir.path(), "older", "{}", true);
        std::thread::sleep(std::time::Duration::from_millis(30));
        write_adapter(dir.path(), "newer", "{}", true);

        let registry = ModelRegistry::with_loader(
            &config_with(dir.path()),
            cpu_profile(),
            |_, _| Ok(ModelHandle::stub()),
        );
        let adapters = registry.discover_adapters();
        assert_eq!(adapters.len(), 2);
        assert_eq!(adapters[0].job_id, "newer");
        assert_eq!(adapters[1].job_id, "older");
    }

    #[test]
    fn discovery_of_missing_directory_is_empty() {
        let config = config_with(Path::new("/nonexistent/artifacts"));
        let registry = ModelRegistry::with_loader(&config, cpu_profile(), |_, _| {
            Ok(ModelHandle::stub())
        });
        assert!(registry.discover_adapters().is_empty());
    }
}
