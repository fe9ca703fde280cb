use std::time::Duration;

use oxidx::dx::{self, ICommandAllocator, IFence, IGraphicsCommandList, PSO_NONE};
use tracing::{debug, warn};

use crate::rhi::{
    command::{GpuFence, QueueClass, RenderCommandList, SyncPoint},
    error::{NativeResultExt, RhiError, RhiResult},
};

const WAIT_TIMEOUT: u32 = 0x0000_0102;
const INFINITE: u32 = 0xFFFF_FFFF;

#[derive(Debug)]
pub struct DxFence {
    pub(super) class: QueueClass,
    pub(super) fence: dx::Fence,
    pub(super) event: dx::Event,
}

impl GpuFence for DxFence {
    fn class(&self) -> QueueClass {
        self.class
    }

    fn completed_value(&self) -> RhiResult<SyncPoint> {
        match self.fence.get_completed_value() {
            // A removed device reports every fence as fully signalled.
            u64::MAX => Err(RhiError::DeviceLost {
                call: "ID3D12Fence::GetCompletedValue",
                reason: "device removed".to_string(),
            }),
            value => Ok(value),
        }
    }

    fn wait(&self, value: SyncPoint, timeout: Option<Duration>) -> RhiResult<()> {
        if self.completed_value()? >= value {
            return Ok(());
        }

        debug!("Waiting for {:?} fence value {}", self.class, value);

        self.fence
            .set_event_on_completion(value, self.event)
            .native("ID3D12Fence::SetEventOnCompletion")?;

        match self.event.wait(timeout_millis(timeout)) {
            0 => {
                self.completed_value()?;
                Ok(())
            }
            WAIT_TIMEOUT => Err(RhiError::SyncTimeout {
                queue: self.class,
                value,
            }),
            code => Err(RhiError::native(
                "WaitForSingleObject",
                format!("0x{code:08X}"),
            )),
        }
    }
}

impl Drop for DxFence {
    fn drop(&mut self) {
        if let Err(err) = self.event.close() {
            warn!("Failed to close {:?} fence event: {}", self.class, err);
        }
    }
}

/// Rounds up so a sub-millisecond timeout still blocks, and never maps a
/// finite timeout onto `INFINITE`.
fn timeout_millis(timeout: Option<Duration>) -> u32 {
    timeout.map_or(INFINITE, |t| {
        t.as_micros().div_ceil(1000).min((INFINITE - 1) as u128) as u32
    })
}

#[derive(Debug)]
pub struct DxCommandList {
    pub(super) class: QueueClass,
    pub(super) allocator: dx::CommandAllocator,
    pub(super) list: dx::GraphicsCommandList,
}

impl RenderCommandList for DxCommandList {
    type Raw = dx::GraphicsCommandList;

    fn class(&self) -> QueueClass {
        self.class
    }

    fn reset(&mut self) -> RhiResult<()> {
        self.allocator
            .reset()
            .native("ID3D12CommandAllocator::Reset")?;
        self.list
            .reset(&self.allocator, PSO_NONE)
            .native("ID3D12GraphicsCommandList::Reset")
    }

    fn close(&mut self) -> RhiResult<()> {
        self.list
            .close()
            .native("ID3D12GraphicsCommandList::Close")
    }

    fn raw(&self) -> &Self::Raw {
        &self.list
    }
}
