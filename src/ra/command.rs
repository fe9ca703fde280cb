use std::{sync::Arc, time::Duration};

use tracing::{debug, error};

use crate::rhi::{
    command::{GpuFence, QueueClass, RenderCommandDevice, RenderCommandList, SyncPoint},
    error::{RhiError, RhiResult},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandListState {
    /// Never recorded.
    Initial,
    Recording,
    /// Closed and ready for submission.
    Closed,
    /// Handed to the queue; retires once the fence reaches the value.
    Submitted(SyncPoint),
}

/// A native allocator + list pair bound to one queue class, with its
/// recording lifecycle enforced.
///
/// Dropping a list whose submission has not retired blocks until the queue
/// fence reaches it, bounded by the timeout the list was created with.
pub struct CommandList<D: RenderCommandDevice> {
    raw: D::CommandList,
    fence: Arc<D::Fence>,
    state: CommandListState,
    release_timeout: Option<Duration>,
}

impl<D: RenderCommandDevice> CommandList<D> {
    pub(super) fn new(
        raw: D::CommandList,
        fence: Arc<D::Fence>,
        release_timeout: Option<Duration>,
    ) -> Self {
        Self {
            raw,
            fence,
            state: CommandListState::Initial,
            release_timeout,
        }
    }

    #[inline]
    pub fn class(&self) -> QueueClass {
        self.raw.class()
    }

    #[inline]
    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn begin(&mut self) -> RhiResult<()> {
        match self.state {
            CommandListState::Recording => {
                return Err(RhiError::invalid_state(
                    "begin() on a command list that is already recording",
                ));
            }
            CommandListState::Closed => {
                return Err(RhiError::invalid_state(
                    "begin() on a closed command list that was never submitted",
                ));
            }
            CommandListState::Submitted(value) if self.fence.completed_value()? < value => {
                return Err(RhiError::invalid_state(format!(
                    "begin() on a {:?} command list still in flight (waiting for {value})",
                    self.class()
                )));
            }
            _ => {}
        }

        self.raw.reset()?;
        self.state = CommandListState::Recording;

        Ok(())
    }

    pub fn end(&mut self) -> RhiResult<()> {
        if self.state != CommandListState::Recording {
            return Err(RhiError::invalid_state(format!(
                "end() on a command list in {:?} state",
                self.state
            )));
        }

        self.raw.close()?;
        self.state = CommandListState::Closed;

        Ok(())
    }

    /// Native recordable object. Commands recorded outside `begin`/`end`
    /// are rejected by the native layer, not here.
    #[inline]
    pub fn raw(&self) -> &<D::CommandList as RenderCommandList>::Raw {
        self.raw.raw()
    }

    pub(super) fn native(&self) -> &D::CommandList {
        &self.raw
    }

    pub(super) fn check_submittable(&self, class: QueueClass) -> RhiResult<()> {
        if self.class() != class {
            return Err(RhiError::invalid_state(format!(
                "{:?} command list submitted to the {class:?} queue",
                self.class()
            )));
        }

        match self.state {
            CommandListState::Closed => Ok(()),
            CommandListState::Recording => Err(RhiError::invalid_state(
                "command list is still recording",
            )),
            CommandListState::Initial => Err(RhiError::invalid_state(
                "command list was never recorded",
            )),
            CommandListState::Submitted(value) => Err(RhiError::invalid_state(format!(
                "command list was already submitted at {value}"
            ))),
        }
    }

    pub(super) fn mark_submitted(&mut self, value: SyncPoint) {
        self.state = CommandListState::Submitted(value);
    }

    /// Stops the drop from waiting on a submission that can no longer
    /// retire.
    pub(super) fn abandon(&mut self) {
        if let CommandListState::Submitted(value) = self.state {
            error!(
                "Releasing {:?} command list still in flight at {}",
                self.class(),
                value
            );
            self.state = CommandListState::Closed;
        }
    }
}

impl<D: RenderCommandDevice> Drop for CommandList<D> {
    fn drop(&mut self) {
        let CommandListState::Submitted(value) = self.state else {
            return;
        };

        match self.fence.completed_value() {
            Ok(completed) if completed >= value => return,
            Ok(_) => {}
            Err(err) => {
                error!("Cannot check {:?} command list before release: {}", self.class(), err);
                return;
            }
        }

        debug!(
            "Waiting for {:?} command list to retire (value {}) before release",
            self.class(),
            value
        );

        if let Err(err) = self.fence.wait(value, self.release_timeout) {
            error!(
                "{:?} command list released while in flight at {}: {}",
                self.class(),
                value,
                err
            );
        }
    }
}

impl<D: RenderCommandDevice> std::fmt::Debug for CommandList<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("class", &self.class())
            .field("state", &self.state)
            .finish()
    }
}
