//! The inference pipeline: model loading, lifecycle management, generation,
//! and result caching.

pub mod cache;
pub mod engine;
pub mod loader;
pub mod registry;

pub use cache::InferenceCache;
pub use engine::{GenerationRequest, GenerationResult, INSTRUCTION};
pub use loader::{ModelHandle, ModelSource, TokenizerKind, load};
pub use registry::{AdapterDescriptor, ModelInfo, ModelKind, ModelRegistry};
