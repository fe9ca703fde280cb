//! Direct3D 12 backend.

mod backend;
mod command;
mod conv;
mod device;
mod swapchain;

pub use backend::AdapterInfo;
pub use command::{DxCommandList, DxFence};
pub use device::DxDevice;
pub use swapchain::{DxRenderTarget, DxSwapchain};
