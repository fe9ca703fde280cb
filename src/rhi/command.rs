use std::time::Duration;

use super::error::RhiResult;

pub type SyncPoint = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueClass {
    Graphics,
    Copy,
    Compute,
}

impl QueueClass {
    /// Fixed drain order.
    pub const ALL: [QueueClass; 3] = [QueueClass::Graphics, QueueClass::Copy, QueueClass::Compute];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            QueueClass::Graphics => 0,
            QueueClass::Copy => 1,
            QueueClass::Compute => 2,
        }
    }
}

pub trait RenderCommandDevice {
    type Fence: GpuFence;
    type CommandList: RenderCommandList;

    fn create_fence(&self, class: QueueClass) -> RhiResult<Self::Fence>;

    /// Lists are returned closed, ready for their first reset.
    fn create_command_list(&self, class: QueueClass) -> RhiResult<Self::CommandList>;

    fn execute(&self, class: QueueClass, lists: &[&Self::CommandList]) -> RhiResult<()>;
    fn signal(&self, class: QueueClass, fence: &Self::Fence, value: SyncPoint) -> RhiResult<()>;
}

pub trait RenderCommandList {
    type Raw;

    fn class(&self) -> QueueClass;

    /// Resets the allocator and reopens the list for recording.
    fn reset(&mut self) -> RhiResult<()>;
    fn close(&mut self) -> RhiResult<()>;

    fn raw(&self) -> &Self::Raw;
}

pub trait GpuFence {
    fn class(&self) -> QueueClass;

    fn completed_value(&self) -> RhiResult<SyncPoint>;

    /// Blocks until the fence reaches `value`. `None` waits forever.
    fn wait(&self, value: SyncPoint, timeout: Option<Duration>) -> RhiResult<()>;
}
