use std::{sync::Arc, time::Duration};

use ash::{khr::swapchain, vk};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::rhi::{
    command::{QueueClass, RenderCommandList, SyncPoint},
    error::{RhiError, RhiResult},
    swapchain::{
        ImageState, PresentMode, RenderSwapchainDevice, SwapchainDesc, choose_surface_format,
    },
};

use super::{
    command::{VkCommandList, VkFence, WaitError, wait_timeline},
    conv::{map_color_space, map_format, map_image_layout, map_present_mode, map_vk_error},
    device::{RawDevice, VkDevice},
    instance::Surface,
};

/// Swapchain image and its color view.
#[derive(Debug)]
pub struct VkRenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    layout: vk::ImageLayout,
}

#[derive(Clone, Copy, Debug)]
struct AcquireSemaphore {
    raw: vk::Semaphore,
    /// Graphics timeline value of the last frame that waited on it.
    consumed_by: Option<(vk::Semaphore, SyncPoint)>,
}

pub(super) struct VkSwapchain {
    raw: vk::SwapchainKHR,
    swapchain_fn: swapchain::Device,
    pub(super) format: vk::Format,
    pub(super) extent: vk::Extent2D,
    targets: SmallVec<[VkRenderTarget; 3]>,

    acquire: SmallVec<[AcquireSemaphore; 3]>,
    next_acquire: usize,
    pending_acquire: Option<usize>,
    render_finished: SmallVec<[vk::Semaphore; 3]>,

    sync_timeout: Option<Duration>,
    present_mode: PresentMode,

    _surface: Surface,
    device: Arc<RawDevice>,
}

impl VkSwapchain {
    pub(super) fn new(
        device: Arc<RawDevice>,
        surface: Surface,
        desc: SwapchainDesc,
        sync_timeout: Option<Duration>,
    ) -> RhiResult<Self> {
        let instance = &device.instance;
        let physical = device.adapter.physical;

        let caps = unsafe {
            instance
                .surface_fn
                .get_physical_device_surface_capabilities(physical, surface.raw)
        }
        .map_err(|err| map_vk_error("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", err))?;

        let formats = unsafe {
            instance
                .surface_fn
                .get_physical_device_surface_formats(physical, surface.raw)
        }
        .map_err(|err| map_vk_error("vkGetPhysicalDeviceSurfaceFormatsKHR", err))?;

        let candidates = formats
            .iter()
            .map(|f| (map_format(f.format), map_color_space(f.color_space)))
            .collect::<Vec<_>>();
        let format = choose_surface_format(&candidates)
            .map(|i| formats[i])
            .ok_or_else(|| RhiError::native("choose_surface_format", "surface offers no formats"))?;

        let modes = unsafe {
            instance
                .surface_fn
                .get_physical_device_surface_present_modes(physical, surface.raw)
        }
        .map_err(|err| map_vk_error("vkGetPhysicalDeviceSurfacePresentModesKHR", err))?;

        let mut present_mode = desc.present_mode;
        if !modes.contains(&map_present_mode(present_mode)) {
            warn!("{:?} is not supported by the surface, using Fifo", present_mode);
            present_mode = PresentMode::Fifo;
        }

        let mut image_count = (desc.frames as u32).max(caps.min_image_count);
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }
        if image_count as usize != desc.frames {
            warn!(
                "Surface requires {} images instead of {}",
                image_count, desc.frames
            );
        }

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: desc
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: desc
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(map_present_mode(present_mode))
            .clipped(true);

        let swapchain_fn = swapchain::Device::new(&instance.raw, &device.raw);
        let raw = unsafe { swapchain_fn.create_swapchain(&info, None) }
            .map_err(|err| map_vk_error("vkCreateSwapchainKHR", err))?;

        let mut this = Self {
            raw,
            swapchain_fn,
            format: format.format,
            extent,
            targets: SmallVec::new(),
            acquire: SmallVec::new(),
            next_acquire: 0,
            pending_acquire: None,
            render_finished: SmallVec::new(),
            sync_timeout,
            present_mode,
            _surface: surface,
            device,
        };

        let images = unsafe { this.swapchain_fn.get_swapchain_images(this.raw) }
            .map_err(|err| map_vk_error("vkGetSwapchainImagesKHR", err))?;

        for image in images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(this.format)
                .subresource_range(color_range());

            let view = unsafe { this.device.raw.create_image_view(&view_info, None) }
                .map_err(|err| map_vk_error("vkCreateImageView", err))?;

            this.targets.push(VkRenderTarget {
                image,
                view,
                layout: vk::ImageLayout::UNDEFINED,
            });

            let acquire = this.create_semaphore()?;
            this.acquire.push(AcquireSemaphore {
                raw: acquire,
                consumed_by: None,
            });

            let finished = this.create_semaphore()?;
            this.render_finished.push(finished);
        }

        info!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            this.targets.len(),
            format.format,
            present_mode
        );

        Ok(this)
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        unsafe {
            self.device
                .raw
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|err| map_vk_error("vkCreateSemaphore", err))
    }
}

impl Drop for VkSwapchain {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.raw.device_wait_idle();

            for target in &self.targets {
                self.device.raw.destroy_image_view(target.view, None);
            }

            for semaphore in self
                .acquire
                .iter()
                .map(|a| a.raw)
                .chain(self.render_finished.iter().copied())
            {
                self.device.raw.destroy_semaphore(semaphore, None);
            }

            self.swapchain_fn.destroy_swapchain(self.raw, None);
        }
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1)
}

impl RenderSwapchainDevice for VkDevice {
    type RenderTarget = VkRenderTarget;

    fn frame_count(&self) -> usize {
        self.swapchain.targets.len()
    }

    fn render_target(&self, image: usize) -> &Self::RenderTarget {
        &self.swapchain.targets[image]
    }

    fn acquire_next_image(&mut self) -> RhiResult<usize> {
        let sc = &mut self.swapchain;
        let slot = sc.next_acquire;
        let acquire = sc.acquire[slot];

        if let Some((timeline, value)) = acquire.consumed_by {
            debug!("Waiting for acquire semaphore {} (value {})", slot, value);
            wait_timeline(&sc.device, timeline, value, sc.sync_timeout).map_err(|err| {
                match err {
                    WaitError::Timeout => RhiError::SyncTimeout {
                        queue: QueueClass::Graphics,
                        value,
                    },
                    WaitError::Failed(err) => err,
                }
            })?;
        }

        let (image, suboptimal) = unsafe {
            sc.swapchain_fn
                .acquire_next_image(sc.raw, u64::MAX, acquire.raw, vk::Fence::null())
        }
        .map_err(|err| match err {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                RhiError::PresentFailed {
                    reason: format!("vkAcquireNextImageKHR: {err:?}"),
                }
            }
            err => map_vk_error("vkAcquireNextImageKHR", err),
        })?;

        if suboptimal {
            debug!("Swapchain is suboptimal for the surface");
        }

        sc.acquire[slot].consumed_by = None;
        sc.pending_acquire = Some(slot);
        sc.next_acquire = (slot + 1) % sc.acquire.len();

        Ok(image as usize)
    }

    fn transition_image(&mut self, list: &VkCommandList, image: usize, state: ImageState) {
        let target = &mut self.swapchain.targets[image];
        let new_layout = map_image_layout(state);
        let old_layout = std::mem::replace(&mut target.layout, new_layout);

        if old_layout == new_layout {
            return;
        }

        let (src_stage, src_access, dst_stage, dst_access) = match state {
            ImageState::RenderTarget => (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            ImageState::Present => (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::NONE,
                vk::AccessFlags2::NONE,
            ),
        };

        let barrier = [vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .image(target.image)
            .subresource_range(color_range())];

        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barrier);

        unsafe {
            self.device
                .raw
                .cmd_pipeline_barrier2(*list.raw(), &dependency)
        };
    }

    fn clear_image(&self, list: &VkCommandList, image: usize, color: [f32; 4]) {
        let target = &self.swapchain.targets[image];

        let attachment = [vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            })];

        let info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.swapchain.extent,
            })
            .layer_count(1)
            .color_attachments(&attachment);

        unsafe {
            self.device.raw.cmd_begin_rendering(*list.raw(), &info);
            self.device.raw.cmd_end_rendering(*list.raw());
        }
    }

    fn submit_frame(
        &mut self,
        list: &VkCommandList,
        image: usize,
        fence: &VkFence,
        value: SyncPoint,
    ) -> RhiResult<()> {
        let Some(slot) = self.swapchain.pending_acquire.take() else {
            return Err(RhiError::invalid_state(
                "frame submitted without an acquired image",
            ));
        };
        let acquire = self.swapchain.acquire[slot].raw;

        let wait = [vk::SemaphoreSubmitInfo::default()
            .semaphore(acquire)
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
        let signal = [
            vk::SemaphoreSubmitInfo::default()
                .semaphore(fence.semaphore)
                .value(value)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            vk::SemaphoreSubmitInfo::default()
                .semaphore(self.swapchain.render_finished[image])
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        ];
        let buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(*list.raw())];

        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait)
            .command_buffer_infos(&buffers)
            .signal_semaphore_infos(&signal);

        self.submit(QueueClass::Graphics, submit, "vkQueueSubmit2")?;
        self.swapchain.acquire[slot].consumed_by = Some((fence.semaphore, value));

        Ok(())
    }

    fn present(&mut self, image: usize) -> RhiResult<()> {
        let sc = &self.swapchain;

        let wait = [sc.render_finished[image]];
        let swapchains = [sc.raw];
        let indices = [image as u32];

        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let queue = self.device.queue(QueueClass::Graphics);

        match unsafe { sc.swapchain_fn.queue_present(queue, &info) } {
            Ok(false) => Ok(()),
            Ok(true) => {
                debug!("Presented to a suboptimal swapchain");
                Ok(())
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(map_vk_error(
                "vkQueuePresentKHR",
                vk::Result::ERROR_DEVICE_LOST,
            )),
            Err(err) => Err(RhiError::PresentFailed {
                reason: format!("vkQueuePresentKHR: {err:?}"),
            }),
        }
    }
}

impl std::fmt::Debug for VkSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VkSwapchain")
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("images", &self.targets.len())
            .field("present_mode", &self.present_mode)
            .finish_non_exhaustive()
    }
}
