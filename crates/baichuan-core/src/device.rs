//! Device selection and dtype policy.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device};
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl DeviceKind {
    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, DeviceKind::Cuda)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cuda => write!(f, "cuda"),
            DeviceKind::Metal => write!(f, "metal"),
            DeviceKind::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(DeviceKind::Cuda),
            "metal" | "mps" => Ok(DeviceKind::Metal),
            "cpu" => Ok(DeviceKind::Cpu),
            other => Err(Error::InvalidConfig(format!("Unknown device: {other}"))),
        }
    }
}

/// What the selected device handles well.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    pub supports_f16: bool,
    pub supports_bf16: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device: Device,
    pub kind: DeviceKind,
    pub capabilities: DeviceCapabilities,
}

impl DeviceProfile {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
            capabilities: DeviceCapabilities::default(),
        }
    }

    /// Dtype to load weights in, given the checkpoint's `torch_dtype`.
    ///
    /// CPU always computes in F32. Half precision is kept where the device
    /// supports it, otherwise F32.
    pub fn select_dtype(&self, requested: Option<&str>) -> DType {
        let requested_name = requested.map(|r| r.trim().to_ascii_lowercase());
        let dtype = match requested_name.as_deref().unwrap_or("") {
            _ if self.kind.is_cpu() => DType::F32,
            "bfloat16" | "bf16" if self.capabilities.supports_bf16 => DType::BF16,
            "bfloat16" | "bf16" if self.capabilities.supports_f16 => DType::F16,
            "float16" | "fp16" | "f16" | "half" if self.capabilities.supports_f16 => DType::F16,
            "float32" | "fp32" | "f32" | "float" => DType::F32,
            "" if self.capabilities.supports_bf16 => DType::BF16,
            "" if self.capabilities.supports_f16 => DType::F16,
            _ => DType::F32,
        };

        debug!(
            "Selected dtype {:?} for device {} (requested: {:?})",
            dtype, self.kind, requested
        );

        dtype
    }
}

pub struct DeviceSelector;

impl DeviceSelector {
    fn try_metal() -> Option<DeviceProfile> {
        let device = std::panic::catch_unwind(|| Device::new_metal(0)).ok()?.ok()?;
        device.is_metal().then(|| DeviceProfile {
            device,
            kind: DeviceKind::Metal,
            capabilities: DeviceCapabilities {
                supports_f16: true,
                supports_bf16: false,
            },
        })
    }

    fn try_cuda() -> Option<DeviceProfile> {
        let device = std::panic::catch_unwind(|| Device::cuda_if_available(0))
            .ok()?
            .ok()?;
        device.is_cuda().then(|| DeviceProfile {
            device,
            kind: DeviceKind::Cuda,
            capabilities: DeviceCapabilities {
                supports_f16: true,
                supports_bf16: true,
            },
        })
    }

    pub fn detect() -> Result<DeviceProfile> {
        if let Some(profile) = Self::try_cuda() {
            info!("Using CUDA device for inference");
            return Ok(profile);
        }
        if let Some(profile) = Self::try_metal() {
            info!("Using Metal device for inference");
            return Ok(profile);
        }
        info!("Falling back to CPU for inference");
        Ok(DeviceProfile::cpu())
    }

    /// Honor `preference` when that device is present, otherwise detect.
    pub fn detect_with_preference(preference: Option<&str>) -> Result<DeviceProfile> {
        let Some(preference) = preference.filter(|p| !p.trim().is_empty()) else {
            return Self::detect();
        };
        let profile = match preference.parse::<DeviceKind>()? {
            DeviceKind::Cpu => Some(DeviceProfile::cpu()),
            DeviceKind::Cuda => Self::try_cuda(),
            DeviceKind::Metal => Self::try_metal(),
        };
        match profile {
            Some(profile) => Ok(profile),
            None => {
                tracing::warn!("Requested device {preference} is unavailable, detecting");
                Self::detect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_with_cpu_preference_returns_cpu() {
        let profile = DeviceSelector::detect_with_preference(Some("cpu")).unwrap();
        assert_eq!(profile.kind, DeviceKind::Cpu);
        assert!(profile.device.is_cpu());
    }

    #[test]
    fn test_unknown_preference_is_rejected() {
        assert!(DeviceSelector::detect_with_preference(Some("tpu")).is_err());
    }

    #[test]
    fn test_cpu_always_f32() {
        let cpu = DeviceProfile::cpu();
        assert_eq!(cpu.select_dtype(None), DType::F32);
        assert_eq!(cpu.select_dtype(Some("bfloat16")), DType::F32);
        assert_eq!(cpu.select_dtype(Some("float16")), DType::F32);
    }

    #[test]
    fn test_cuda_dtype_selection() {
        let cuda = DeviceProfile {
            device: Device::Cpu,
            kind: DeviceKind::Cuda,
            capabilities: DeviceCapabilities {
                supports_f16: true,
                supports_bf16: true,
            },
        };
        assert_eq!(cuda.select_dtype(None), DType::BF16);
        assert_eq!(cuda.select_dtype(Some("float16")), DType::F16);
        assert_eq!(cuda.select_dtype(Some("bfloat16")), DType::BF16);
        assert_eq!(cuda.select_dtype(Some("float32")), DType::F32);
    }

    #[test]
    fn test_metal_falls_back_from_bf16() {
        let metal = DeviceProfile {
            device: Device::Cpu,
            kind: DeviceKind::Metal,
            capabilities: DeviceCapabilities {
                supports_f16: true,
                supports_bf16: false,
            },
        };
        assert_eq!(metal.select_dtype(Some("bf16")), DType::F16);
        assert_eq!(metal.select_dtype(None), DType::F16);
    }

    #[test]
    fn test_device_kind_parsing() {
        assert_eq!("MPS".parse::<DeviceKind>().unwrap(), DeviceKind::Metal);
        assert_eq!(DeviceKind::Cuda.to_string(), "cuda");
    }
}
