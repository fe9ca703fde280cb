use serde::{Deserialize, Serialize};

use super::{command::RenderCommandDevice, swapchain::RenderSwapchainDevice};

/// Number of swapchain images and frame slots. Not configurable.
pub const FRAME_COUNT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Dx12,
    Vulkan,
}

impl DeviceType {
    /// Whether the backend was compiled into this build. A compiled backend
    /// can still fail at runtime with `BackendUnavailable`.
    pub const fn is_compiled(self) -> bool {
        match self {
            DeviceType::Dx12 => cfg!(windows),
            DeviceType::Vulkan => cfg!(feature = "vulkan"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Dx12 => "Direct3D 12",
            DeviceType::Vulkan => "Vulkan",
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        const CpuValidation = 0x1;
        const GpuValidation = 0x2;
    }
}

/// Everything the frame-pacing layer needs from a native backend.
pub trait RenderBackend: RenderCommandDevice + RenderSwapchainDevice {
    fn device_type(&self) -> DeviceType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiled_backends_follow_build_config() {
        assert_eq!(DeviceType::Dx12.is_compiled(), cfg!(windows));
        assert_eq!(DeviceType::Vulkan.is_compiled(), cfg!(feature = "vulkan"));
    }
}
