use crate::rhi::{backend::RenderBackend, command::SyncPoint};

use super::command::CommandList;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Idle,
    Recording,
    Submitted,
    Presented,
    Retired,
}

/// Per-image resources: the graphics list recorded for the image and the
/// graphics timeline value that retires it.
pub struct FrameSlot<B: RenderBackend> {
    pub(super) index: usize,
    pub(super) list: CommandList<B>,
    pub(super) fence_value: SyncPoint,
    pub(super) state: SlotState,
}

impl<B: RenderBackend> FrameSlot<B> {
    pub(super) fn new(index: usize, list: CommandList<B>) -> Self {
        Self {
            index,
            list,
            fence_value: 0,
            state: SlotState::Idle,
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn fence_value(&self) -> SyncPoint {
        self.fence_value
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    #[inline]
    pub fn list(&self) -> &CommandList<B> {
        &self.list
    }

    /// Submitted or presented, and not yet observed as retired.
    #[inline]
    pub fn in_flight(&self) -> bool {
        matches!(self.state, SlotState::Submitted | SlotState::Presented)
    }
}

impl<B: RenderBackend> std::fmt::Debug for FrameSlot<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("index", &self.index)
            .field("fence_value", &self.fence_value)
            .field("state", &self.state)
            .finish()
    }
}
