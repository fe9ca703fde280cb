use std::{sync::Arc, time::Duration};

use ash::vk;
use smallvec::SmallVec;
use tracing::info;

use crate::rhi::{
    backend::{DebugFlags, DeviceType, RenderBackend},
    command::{GpuFence, QueueClass, RenderCommandDevice, RenderCommandList, SyncPoint},
    error::{RhiError, RhiResult},
    swapchain::{NativeWindow, SwapchainDesc},
};

use super::{
    command::{VkCommandList, VkFence},
    conv::map_vk_error,
    instance::{Adapter, Surface, VkInstance},
    swapchain::VkSwapchain,
};

#[derive(Clone, Copy, Debug)]
pub(super) struct Queue {
    pub(super) raw: vk::Queue,
    pub(super) family: u32,
}

/// Logical device shared by everything created from it. Destroyed after the
/// last fence, list and swapchain are gone.
pub(super) struct RawDevice {
    pub(super) raw: ash::Device,
    pub(super) adapter: Adapter,
    queues: [Queue; 3],
    pub(super) instance: Arc<VkInstance>,
}

impl RawDevice {
    fn new(instance: Arc<VkInstance>, adapter: Adapter) -> RhiResult<Arc<Self>> {
        let mut families: SmallVec<[u32; 3]> = SmallVec::new();
        for class in QueueClass::ALL {
            let family = adapter.families.get(class);
            if !families.contains(&family) {
                families.push(family);
            }
        }

        let priorities = [1.0];
        let queue_infos = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect::<SmallVec<[_; 3]>>();

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let mut features12 =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let raw = unsafe {
            instance
                .raw
                .create_device(adapter.physical, &info, None)
        }
        .map_err(|err| map_vk_error("vkCreateDevice", err))?;

        let queue = |class| {
            let family = adapter.families.get(class);
            Queue {
                raw: unsafe { raw.get_device_queue(family, 0) },
                family,
            }
        };
        let queues = [
            queue(QueueClass::Graphics),
            queue(QueueClass::Copy),
            queue(QueueClass::Compute),
        ];

        info!(
            "Created device on {} with queue families {:?}",
            adapter.name, adapter.families
        );

        Ok(Arc::new(Self {
            raw,
            adapter,
            queues,
            instance,
        }))
    }

    #[inline]
    pub(super) fn queue(&self, class: QueueClass) -> vk::Queue {
        self.queues[class.index()].raw
    }

    #[inline]
    pub(super) fn queue_family(&self, class: QueueClass) -> u32 {
        self.queues[class.index()].family
    }
}

impl Drop for RawDevice {
    fn drop(&mut self) {
        unsafe { self.raw.destroy_device(None) };
    }
}

pub struct VkDevice {
    pub(super) swapchain: VkSwapchain,
    pub(super) device: Arc<RawDevice>,
}

impl VkDevice {
    pub fn new(
        window: &NativeWindow,
        desc: SwapchainDesc,
        debug_flags: DebugFlags,
        sync_timeout: Option<Duration>,
    ) -> RhiResult<Self> {
        let instance = VkInstance::new(window.display, debug_flags)?;
        let surface = Surface::new(&instance, window)?;
        let adapter = instance.pick_adapter(surface.raw)?;

        info!("Creating device with adapter {}", adapter.name);

        let device = RawDevice::new(Arc::clone(&instance), adapter)?;
        let swapchain = VkSwapchain::new(Arc::clone(&device), surface, desc, sync_timeout)?;

        Ok(Self { swapchain, device })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device.raw
    }

    pub fn adapter_name(&self) -> &str {
        &self.device.adapter.name
    }

    pub fn queue(&self, class: QueueClass) -> vk::Queue {
        self.device.queue(class)
    }

    pub(super) fn submit(
        &self,
        class: QueueClass,
        submit: vk::SubmitInfo2<'_>,
        call: &'static str,
    ) -> RhiResult<()> {
        unsafe {
            self.device
                .raw
                .queue_submit2(self.device.queue(class), &[submit], vk::Fence::null())
        }
        .map_err(|err| map_vk_error(call, err))
    }
}

impl RenderBackend for VkDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Vulkan
    }
}

impl RenderCommandDevice for VkDevice {
    type Fence = VkFence;
    type CommandList = VkCommandList;

    fn create_fence(&self, class: QueueClass) -> RhiResult<Self::Fence> {
        VkFence::new(Arc::clone(&self.device), class)
    }

    fn create_command_list(&self, class: QueueClass) -> RhiResult<Self::CommandList> {
        // Fresh buffers are in the initial state, record an empty pass to close them.
        let mut list = VkCommandList::new(Arc::clone(&self.device), class)?;
        list.reset()?;
        list.close()?;

        Ok(list)
    }

    fn execute(&self, class: QueueClass, lists: &[&Self::CommandList]) -> RhiResult<()> {
        if lists.is_empty() {
            return Ok(());
        }

        let buffers = lists
            .iter()
            .map(|l| vk::CommandBufferSubmitInfo::default().command_buffer(*l.raw()))
            .collect::<SmallVec<[_; 8]>>();

        self.submit(
            class,
            vk::SubmitInfo2::default().command_buffer_infos(&buffers),
            "vkQueueSubmit2",
        )
    }

    fn signal(&self, class: QueueClass, fence: &Self::Fence, value: SyncPoint) -> RhiResult<()> {
        if fence.class() != class {
            return Err(RhiError::invalid_state(format!(
                "{:?} fence signalled on the {:?} queue",
                fence.class(),
                class
            )));
        }

        let signal = [vk::SemaphoreSubmitInfo::default()
            .semaphore(fence.semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];

        self.submit(
            class,
            vk::SubmitInfo2::default().signal_semaphore_infos(&signal),
            "vkQueueSubmit2",
        )
    }
}

impl std::fmt::Debug for VkDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VkDevice")
            .field("adapter", &self.device.adapter.name)
            .field("families", &self.device.adapter.families)
            .finish_non_exhaustive()
    }
}
