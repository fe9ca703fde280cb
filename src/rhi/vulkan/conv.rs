use ash::vk;

use crate::rhi::{
    error::RhiError,
    swapchain::{ImageState, PresentMode},
    types::{ColorSpace, Format},
};

pub(super) fn map_format(format: vk::Format) -> Format {
    match format {
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
        vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
        vk::Format::B8G8R8A8_SRGB => Format::Bgra8Srgb,
        _ => Format::Other,
    }
}

pub(super) fn map_color_space(space: vk::ColorSpaceKHR) -> ColorSpace {
    match space {
        vk::ColorSpaceKHR::PASS_THROUGH_EXT | vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT => {
            ColorSpace::Linear
        }
        vk::ColorSpaceKHR::SRGB_NONLINEAR => ColorSpace::SrgbNonlinear,
        _ => ColorSpace::Other,
    }
}

pub(super) fn map_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
    }
}

pub(super) fn map_image_layout(state: ImageState) -> vk::ImageLayout {
    match state {
        ImageState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        ImageState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }
}

pub(super) fn map_vk_error(call: &'static str, err: vk::Result) -> RhiError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost {
            call,
            reason: format!("{err:?}"),
        },
        err => RhiError::native(call, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::swapchain::choose_surface_format;

    #[test]
    fn bgra_srgb_surface_is_picked_over_unknown_formats() {
        let offered = [
            vk::SurfaceFormatKHR {
                format: vk::Format::A2B10G10R10_UNORM_PACK32,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let candidates = offered
            .iter()
            .map(|f| (map_format(f.format), map_color_space(f.color_space)))
            .collect::<Vec<_>>();

        assert_eq!(choose_surface_format(&candidates), Some(1));
    }

    #[test]
    fn device_lost_is_not_a_plain_native_error() {
        assert!(matches!(
            map_vk_error("vkQueueSubmit2", vk::Result::ERROR_DEVICE_LOST),
            RhiError::DeviceLost { .. }
        ));
        assert!(matches!(
            map_vk_error("vkQueueSubmit2", vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RhiError::Native { .. }
        ));
    }
}
