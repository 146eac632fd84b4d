//! Candle implementation of the Qwen2-VL vision-language model.
//!
//! - [`config`] - serde types for the checkpoint's JSON configuration files
//! - [`processing`] - image preprocessing (smart resize, patch extraction)
//! - [`attention`] - shared attention and rotary-embedding primitives
//! - [`vision`] - the vision tower
//! - [`text`] - the text decoder with per-layer KV caches
//! - [`model`] - the [`model::Qwen2Vl`] facade with its prefill/step API

pub mod attention;
pub mod config;
pub mod model;
pub mod processing;
pub mod text;
pub mod vision;

pub use config::{ImageProcessorConfig, Qwen2VlConfig};
pub use model::Qwen2Vl;
pub use processing::{ImageInputs, preprocess_image};
