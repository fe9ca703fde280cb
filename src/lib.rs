//! GPU command submission and frame pacing over Direct3D 12 and Vulkan.
//!
//! [`rhi`] holds the thin per-API backends, [`ra`] the backend-agnostic
//! device that owns queue timelines and frame slots.

pub mod ra;
pub mod rhi;

pub use ra::{
    command::{CommandList, CommandListState},
    device::Device,
    system::{DeviceDesc, GraphicsCommandList, GraphicsDevice, NativeWindow, create_device},
};
pub use rhi::{
    backend::{DebugFlags, DeviceType, FRAME_COUNT},
    command::{QueueClass, SyncPoint},
    error::{RhiError, RhiResult},
    swapchain::PresentMode,
};
