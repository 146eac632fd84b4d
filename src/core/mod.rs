//! Core infrastructure: errors, configuration, device selection, and content
//! fingerprints.

pub mod config;
pub mod device;
pub mod errors;
pub mod fingerprint;

pub use config::{AppConfig, GenerationSettings};
pub use device::{DeviceProfile, Precision, parse_device, select_device};
pub use errors::{CacheError, ConfigError, InferenceError, LoadError};
pub use fingerprint::{Fingerprint, fingerprint};
