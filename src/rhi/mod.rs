pub mod backend;
pub mod command;
pub mod error;
pub mod headless;
pub mod loader;
pub mod swapchain;
pub mod types;

#[cfg(windows)]
pub mod dx12;
#[cfg(feature = "vulkan")]
pub mod vulkan;
