use oxidx::dx;

use crate::rhi::{command::QueueClass, swapchain::ImageState, swapchain::PresentMode};

pub(super) fn map_queue_class(class: QueueClass) -> dx::CommandListType {
    match class {
        QueueClass::Graphics => dx::CommandListType::Direct,
        QueueClass::Compute => dx::CommandListType::Compute,
        QueueClass::Copy => dx::CommandListType::Copy,
    }
}

pub(super) fn map_image_state(state: ImageState) -> dx::ResourceStates {
    match state {
        ImageState::Present => dx::ResourceStates::Present,
        ImageState::RenderTarget => dx::ResourceStates::RenderTarget,
    }
}

/// Sync interval and flags for `IDXGISwapChain::Present`.
pub(super) fn map_present_mode(mode: PresentMode) -> (u32, dx::PresentFlags) {
    match mode {
        PresentMode::Immediate => (0, dx::PresentFlags::AllowTearing),
        PresentMode::Mailbox => (0, dx::PresentFlags::empty()),
        PresentMode::Fifo => (1, dx::PresentFlags::empty()),
    }
}
