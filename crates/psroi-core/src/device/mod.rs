pub mod launch;

pub use launch::{get_launch_config, set_launch_config, LaunchConfig, LaunchGeometry};

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

/// Locality tag carried by every tensor.
///
/// Operators require all of their inputs to agree on the device. Kernels are
/// only compiled for the host; tensors tagged with an accelerator are
/// rejected with `TensorError::UnsupportedDevice` once the agreement check
/// has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum Device {
    #[default]
    Cpu,
    Gpu(usize),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    pub fn id(&self) -> usize {
        match self {
            Device::Cpu => 0,
            Device::Gpu(id) => *id,
        }
    }

    /// Parse a device string (e.g., "cpu", "gpu:0", "gpu:1")
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, String> {
        let s = s.trim().to_lowercase();

        if s == "cpu" {
            return Ok(Device::Cpu);
        }

        if s == "gpu" {
            return Ok(Device::Gpu(0));
        }
        if let Some(id_str) = s.strip_prefix("gpu:") {
            return match id_str.parse::<usize>() {
                Ok(id) => Ok(Device::Gpu(id)),
                Err(_) => Err(format!("Invalid GPU ID: {}", id_str)),
            };
        }

        Err(format!("Invalid device string: {s}"))
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu:{}", id),
        }
    }
}
