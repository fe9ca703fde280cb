//! Vulkan 1.3 backend. Timeline semaphores back the queue fences, frames
//! record with dynamic rendering and synchronization2.

mod command;
mod conv;
mod device;
mod instance;
mod swapchain;

pub use command::{VkCommandList, VkFence};
pub use device::VkDevice;
pub use instance::QueueFamilies;
pub use swapchain::VkRenderTarget;
