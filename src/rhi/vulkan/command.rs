use std::{sync::Arc, time::Duration};

use ash::vk;

use crate::rhi::{
    command::{GpuFence, QueueClass, RenderCommandList, SyncPoint},
    error::{RhiError, RhiResult},
};

use super::{conv::map_vk_error, device::RawDevice};

/// Timeline semaphore backing one queue timeline.
pub struct VkFence {
    class: QueueClass,
    pub(super) semaphore: vk::Semaphore,
    device: Arc<RawDevice>,
}

impl VkFence {
    pub(super) fn new(device: Arc<RawDevice>, class: QueueClass) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = unsafe { device.raw.create_semaphore(&info, None) }
            .map_err(|err| map_vk_error("vkCreateSemaphore", err))?;

        Ok(Self {
            class,
            semaphore,
            device,
        })
    }
}

impl GpuFence for VkFence {
    fn class(&self) -> QueueClass {
        self.class
    }

    fn completed_value(&self) -> RhiResult<SyncPoint> {
        unsafe { self.device.raw.get_semaphore_counter_value(self.semaphore) }
            .map_err(|err| map_vk_error("vkGetSemaphoreCounterValue", err))
    }

    fn wait(&self, value: SyncPoint, timeout: Option<Duration>) -> RhiResult<()> {
        wait_timeline(&self.device, self.semaphore, value, timeout).map_err(|err| match err {
            WaitError::Timeout => RhiError::SyncTimeout {
                queue: self.class,
                value,
            },
            WaitError::Failed(err) => err,
        })
    }
}

impl Drop for VkFence {
    fn drop(&mut self) {
        unsafe { self.device.raw.destroy_semaphore(self.semaphore, None) };
    }
}

impl std::fmt::Debug for VkFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VkFence")
            .field("class", &self.class)
            .field("semaphore", &self.semaphore)
            .finish()
    }
}

pub(super) enum WaitError {
    Timeout,
    Failed(RhiError),
}

/// Host wait on a timeline semaphore. `None` waits forever.
pub(super) fn wait_timeline(
    device: &RawDevice,
    semaphore: vk::Semaphore,
    value: SyncPoint,
    timeout: Option<Duration>,
) -> Result<(), WaitError> {
    let semaphores = [semaphore];
    let values = [value];
    let info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);

    let nanos = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);

    match unsafe { device.raw.wait_semaphores(&info, nanos) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(WaitError::Timeout),
        Err(err) => Err(WaitError::Failed(map_vk_error("vkWaitSemaphores", err))),
    }
}

/// Primary command buffer with its own pool, so resetting one list never
/// touches another.
pub struct VkCommandList {
    class: QueueClass,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    device: Arc<RawDevice>,
}

impl VkCommandList {
    pub(super) fn new(device: Arc<RawDevice>, class: QueueClass) -> RhiResult<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_family(class))
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { device.raw.create_command_pool(&info, None) }
            .map_err(|err| map_vk_error("vkCreateCommandPool", err))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = match unsafe { device.raw.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(err) => {
                unsafe { device.raw.destroy_command_pool(pool, None) };
                return Err(map_vk_error("vkAllocateCommandBuffers", err));
            }
        };

        Ok(Self {
            class,
            pool,
            buffer: buffers[0],
            device,
        })
    }
}

impl RenderCommandList for VkCommandList {
    type Raw = vk::CommandBuffer;

    fn class(&self) -> QueueClass {
        self.class
    }

    fn reset(&mut self) -> RhiResult<()> {
        unsafe {
            self.device
                .raw
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .map_err(|err| map_vk_error("vkResetCommandPool", err))?;

            let info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .raw
                .begin_command_buffer(self.buffer, &info)
                .map_err(|err| map_vk_error("vkBeginCommandBuffer", err))
        }
    }

    fn close(&mut self) -> RhiResult<()> {
        unsafe { self.device.raw.end_command_buffer(self.buffer) }
            .map_err(|err| map_vk_error("vkEndCommandBuffer", err))
    }

    fn raw(&self) -> &Self::Raw {
        &self.buffer
    }
}

impl Drop for VkCommandList {
    fn drop(&mut self) {
        unsafe { self.device.raw.destroy_command_pool(self.pool, None) };
    }
}

impl std::fmt::Debug for VkCommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VkCommandList")
            .field("class", &self.class)
            .field("buffer", &self.buffer)
            .finish()
    }
}
