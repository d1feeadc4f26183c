//! # Compute Device Selection
//!
//! Chooses where the Whisper-backed ASR and LID models live. The choice also
//! fixes their weight dtype: F16 is only used on CUDA or Metal, so a CPU
//! deployment always runs F32 whatever `use_half` says.
//!
//! ## Resolution:
//! - `auto`: first working accelerator (CUDA, then Metal), else CPU
//! - `cuda` / `metal`: that accelerator, or CPU with a warning
//! - `cpu`: always CPU

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Result of `auto` resolution, computed once per process.
static AUTO_DEVICE: OnceLock<Device> = OnceLock::new();

/// Value of `models.device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Accelerator {
    Cuda,
    Metal,
}

impl Accelerator {
    fn name(self) -> &'static str {
        match self {
            Accelerator::Cuda => "CUDA",
            Accelerator::Metal => "Metal",
        }
    }

    /// Open ordinal 0, or `None` when the backend is missing or not compiled in.
    fn open(self) -> Option<Device> {
        let opened = match self {
            Accelerator::Cuda => Device::new_cuda(0),
            Accelerator::Metal => Device::new_metal(0),
        };
        match opened {
            Ok(device) => Some(device),
            Err(e) => {
                debug!(backend = self.name(), error = %e, "Accelerator unavailable");
                None
            }
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    pub fn get_device(preference: DevicePreference) -> Device {
        let requested = match preference {
            DevicePreference::Auto => return Self::get_best_device(),
            DevicePreference::Cpu => return Device::Cpu,
            DevicePreference::Cuda => Accelerator::Cuda,
            DevicePreference::Metal => Accelerator::Metal,
        };
        requested.open().unwrap_or_else(|| {
            warn!(
                backend = requested.name(),
                "Requested accelerator unavailable, models will run on CPU in F32"
            );
            Device::Cpu
        })
    }

    pub fn get_best_device() -> Device {
        AUTO_DEVICE
            .get_or_init(|| {
                let found = [Accelerator::Cuda, Accelerator::Metal]
                    .into_iter()
                    .find_map(|accelerator| {
                        accelerator.open().map(|device| (accelerator, device))
                    });
                match found {
                    Some((accelerator, device)) => {
                        info!(
                            backend = accelerator.name(),
                            "Whisper models will run on the accelerator"
                        );
                        device
                    }
                    None => {
                        info!("No accelerator found, Whisper models will run on CPU in F32");
                        Device::Cpu
                    }
                }
            })
            .clone()
    }

    pub fn get_device_info(device: &Device) -> String {
        match device {
            Device::Cpu => "CPU".to_string(),
            Device::Cuda(_) => "CUDA GPU".to_string(),
            Device::Metal(_) => "Metal GPU (Apple Silicon)".to_string(),
        }
    }

    /// Device block of the `/healthz` payload.
    pub fn summarize(preference: DevicePreference, device: &Device) -> DeviceSummary {
        DeviceSummary {
            preference,
            current_device: Self::get_device_info(device),
            half_precision_available: !device.is_cpu(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub preference: DevicePreference,
    pub current_device: String,
    /// False on CPU: the Whisper slots then report full precision.
    pub half_precision_available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_summary_has_no_half() {
        let device = DeviceManager::get_device(DevicePreference::Cpu);
        assert!(device.is_cpu());

        let summary = DeviceManager::summarize(DevicePreference::Cpu, &device);
        assert_eq!(summary.current_device, "CPU");
        assert!(!summary.half_precision_available);
    }

    #[test]
    fn test_preference_deserializes_lowercase() {
        let pref: DevicePreference = serde_json::from_str("\"cuda\"").unwrap();
        assert_eq!(pref, DevicePreference::Cuda);
    }
}
