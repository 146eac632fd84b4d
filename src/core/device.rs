//! Compute backend selection.
//!
//! The device selector decides, once per process, where the model runs and at
//! which precision it is loaded: accelerated backends (CUDA, Metal) load at
//! half precision, general-purpose compute falls back to full-precision F32 —
//! slower, but functionally complete. Probing has no side effects and is
//! cheap enough to repeat.

use crate::core::config::AppConfig;
use crate::core::errors::ConfigError;
use candle_core::{DType, Device};
use tracing::info;

/// Numeric precision a checkpoint is loaded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// 4-bit quantized weights. Only meaningful for pre-quantized
    /// checkpoints; the loader rejects it for plain safetensors.
    Int4,
    /// Half precision (BF16 where the device supports it, F16 otherwise).
    Float16,
    /// Full precision.
    Float32,
}

impl Precision {
    /// Parses a configuration override string.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.to_lowercase().as_str() {
            "int4" | "q4" => Ok(Self::Int4),
            "f16" | "fp16" | "bf16" | "half" => Ok(Self::Float16),
            "f32" | "fp32" | "full" => Ok(Self::Float32),
            _ => Err(ConfigError::invalid_value(
                "precision",
                raw,
                "expected one of int4, f16, f32",
            )),
        }
    }

    /// Maps the precision onto the dtype used for weight loading on the
    /// given device. BF16 is preferred on accelerators that support it.
    pub fn dtype(self, device: &Device) -> DType {
        match self {
            // Pre-quantized checkpoints dequantize into half precision.
            Self::Int4 | Self::Float16 => {
                if device.is_cuda() || device.is_metal() {
                    DType::BF16
                } else {
                    DType::F32
                }
            }
            Self::Float32 => DType::F32,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int4 => write!(f, "int4"),
            Self::Float16 => write!(f, "f16"),
            Self::Float32 => write!(f, "f32"),
        }
    }
}

/// The resolved compute backend: which device to run on and which precision
/// to load weights at.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Target candle device.
    pub device: Device,
    /// Weight-loading precision consistent with the device.
    pub precision: Precision,
}

impl DeviceProfile {
    /// Returns true when the profile runs on accelerated hardware.
    pub fn is_accelerated(&self) -> bool {
        self.device.is_cuda() || self.device.is_metal()
    }
}

/// Parses a device string and creates a candle [`Device`].
///
/// Supported formats: `"cpu"`, `"cuda"` / `"gpu"`, `"cuda:N"`.
pub fn parse_device(device_str: &str) -> Result<Device, ConfigError> {
    let device_str = device_str.to_lowercase();
    match device_str.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Device::new_cuda(0).map_err(|e| {
            ConfigError::invalid_value("device", &device_str, format!("CUDA unavailable: {e}"))
        }),
        s if s.starts_with("cuda:") => {
            let ordinal: usize = s
                .strip_prefix("cuda:")
                .unwrap_or_default()
                .parse()
                .map_err(|_| {
                    ConfigError::invalid_value("device", s, "expected 'cuda:N' with numeric N")
                })?;
            Device::new_cuda(ordinal).map_err(|e| {
                ConfigError::invalid_value(
                    "device",
                    s,
                    format!("CUDA device {ordinal} unavailable: {e}"),
                )
            })
        }
        _ => Err(ConfigError::invalid_value(
            "device",
            &device_str,
            "expected 'cpu', 'cuda', or 'cuda:N'",
        )),
    }
}

/// Selects the compute backend for this process.
///
/// Explicit `device`/`precision` overrides in the configuration win;
/// otherwise CUDA is probed and preferred at half precision, with a
/// full-precision CPU fallback.
pub fn select_device(config: &AppConfig) -> Result<DeviceProfile, ConfigError> {
    let device = match config.device.as_deref() {
        Some(explicit) => parse_device(explicit)?,
        None => match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(_) => Device::Cpu,
        },
    };

    let precision = match config.precision.as_deref() {
        Some(raw) => Precision::parse(raw)?,
        None => {
            if device.is_cuda() || device.is_metal() {
                Precision::Float16
            } else {
                Precision::Float32
            }
        }
    };

    if !(device.is_cuda() || device.is_metal()) {
        info!("no accelerator available, using CPU at {precision} (this will be slow)");
    } else {
        info!("selected accelerated device at {precision}");
    }

    Ok(DeviceProfile { device, precision })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_accepts_cpu() {
        let device = parse_device("cpu").unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn parse_device_rejects_unknown_strings() {
        assert!(parse_device("tpu").is_err());
    }

    #[test]
    fn precision_parse_round_trips_known_names() {
        assert_eq!(Precision::parse("f32").unwrap(), Precision::Float32);
        assert_eq!(Precision::parse("bf16").unwrap(), Precision::Float16);
        assert_eq!(Precision::parse("int4").unwrap(), Precision::Int4);
        assert!(Precision::parse("f64").is_err());
    }

    #[test]
    fn cpu_profile_is_full_precision() {
        let config = AppConfig {
            device: Some("cpu".to_string()),
            ..Default::default()
        };
        let profile = select_device(&config).unwrap();
        assert!(!profile.is_accelerated());
        assert_eq!(profile.precision, Precision::Float32);
        assert_eq!(profile.precision.dtype(&profile.device), DType::F32);
    }

    #[test]
    fn select_device_is_idempotent() {
        let config = AppConfig {
            device: Some("cpu".to_string()),
            ..Default::default()
        };
        let first = select_device(&config).unwrap();
        let second = select_device(&config).unwrap();
        assert_eq!(first.precision, second.precision);
    }
}
