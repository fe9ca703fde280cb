use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use crate::rhi::{
    backend::{DeviceType, RenderBackend},
    command::{QueueClass, RenderCommandDevice, SyncPoint},
    error::{RhiError, RhiResult},
    swapchain::{ImageState, RenderSwapchainDevice},
};

use super::{
    command::CommandList,
    frame::{FrameSlot, SlotState},
    system::DeviceDesc,
    timeline::Timeline,
};

/// Upper bound for the drop-time drain of a lost device when no sync
/// timeout was configured.
pub const LOST_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Frame pacing and queue submission on top of a native backend.
///
/// Owns one timeline per queue class, one graphics command list per
/// swapchain image and the long-lived copy and compute lists. Dropping the
/// device drains graphics, copy and compute (in that order) before any native
/// object is released.
pub struct Device<B: RenderBackend> {
    timelines: [Timeline<B::Fence>; 3],
    slots: Vec<FrameSlot<B>>,
    copy_list: CommandList<B>,
    compute_list: CommandList<B>,

    current: Option<usize>,
    lost: bool,

    sync_timeout: Option<Duration>,
    clear_color: Option<[f32; 4]>,

    backend: B,
}

impl<B: RenderBackend> Device<B> {
    pub fn new(backend: B, desc: &DeviceDesc) -> RhiResult<Self> {
        let timelines = [
            Timeline::new(backend.create_fence(QueueClass::Graphics)?),
            Timeline::new(backend.create_fence(QueueClass::Copy)?),
            Timeline::new(backend.create_fence(QueueClass::Compute)?),
        ];

        let slots = (0..backend.frame_count())
            .map(|index| {
                let list = backend.create_command_list(QueueClass::Graphics)?;
                Ok(FrameSlot::new(
                    index,
                    CommandList::new(
                        list,
                        timelines[QueueClass::Graphics.index()].fence().clone(),
                        desc.sync_timeout,
                    ),
                ))
            })
            .collect::<RhiResult<Vec<_>>>()?;

        let copy_list = CommandList::new(
            backend.create_command_list(QueueClass::Copy)?,
            timelines[QueueClass::Copy.index()].fence().clone(),
            desc.sync_timeout,
        );
        let compute_list = CommandList::new(
            backend.create_command_list(QueueClass::Compute)?,
            timelines[QueueClass::Compute.index()].fence().clone(),
            desc.sync_timeout,
        );

        info!(
            "Created {} device with {} frame slots",
            backend.device_type().name(),
            slots.len()
        );

        Ok(Self {
            timelines,
            slots,
            copy_list,
            compute_list,
            current: None,
            lost: false,
            sync_timeout: desc.sync_timeout,
            clear_color: desc.clear_color,
            backend,
        })
    }

    /// Starts recording the next frame and returns the swapchain image it
    /// renders to. Blocks while the slot for that image is still in flight.
    pub fn begin_draw(&mut self) -> RhiResult<usize> {
        self.ensure_alive()?;

        if let Some(image) = self.current {
            return Err(RhiError::invalid_state(format!(
                "begin_draw() while frame {image} is still recording"
            )));
        }

        let result = self.begin_frame();
        self.guard(result)
    }

    /// Closes, submits and presents the frame opened by [`Self::begin_draw`].
    pub fn end_draw(&mut self) -> RhiResult<()> {
        self.ensure_alive()?;

        let Some(image) = self.current else {
            return Err(RhiError::invalid_state("end_draw() without begin_draw()"));
        };

        let result = self.end_frame(image);
        self.guard(result)
    }

    pub fn create_command_list(&self, class: QueueClass) -> RhiResult<CommandList<B>> {
        self.ensure_alive()?;

        let list = self.backend.create_command_list(class)?;
        Ok(CommandList::new(
            list,
            self.timelines[class.index()].fence().clone(),
            self.sync_timeout,
        ))
    }

    /// Submits closed lists in order to the `class` queue and signals the
    /// next value of its timeline. Nothing is submitted unless every list is
    /// closed and bound to `class`.
    pub fn execute_command_lists(
        &mut self,
        class: QueueClass,
        lists: &mut [&mut CommandList<B>],
    ) -> RhiResult<SyncPoint> {
        self.ensure_alive()?;

        for list in lists.iter() {
            list.check_submittable(class)?;
        }

        let result = Self::submit(
            &self.backend,
            &mut self.timelines[class.index()],
            class,
            lists,
        );
        self.guard(result)
    }

    /// Submits the device-owned copy or compute list.
    pub fn flush(&mut self, class: QueueClass) -> RhiResult<SyncPoint> {
        self.ensure_alive()?;

        let list = match class {
            QueueClass::Copy => &mut self.copy_list,
            QueueClass::Compute => &mut self.compute_list,
            QueueClass::Graphics => {
                return Err(RhiError::invalid_state(
                    "graphics lists are submitted through end_draw()",
                ));
            }
        };
        list.check_submittable(class)?;

        let result = Self::submit(
            &self.backend,
            &mut self.timelines[class.index()],
            class,
            &mut [list],
        );
        self.guard(result)
    }

    /// Blocks until every queue has retired all signalled work.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        let result = self.drain(self.sync_timeout);
        self.guard(result)
    }

    /// Graphics list of the frame being recorded.
    pub fn frame_list(&self) -> RhiResult<&CommandList<B>> {
        match self.current {
            Some(image) => Ok(&self.slots[image].list),
            None => Err(RhiError::invalid_state("no frame is being recorded")),
        }
    }

    /// Device-owned copy or compute list.
    pub fn queue_list(&mut self, class: QueueClass) -> RhiResult<&mut CommandList<B>> {
        match class {
            QueueClass::Copy => Ok(&mut self.copy_list),
            QueueClass::Compute => Ok(&mut self.compute_list),
            QueueClass::Graphics => Err(RhiError::invalid_state(
                "graphics lists are owned by frame slots",
            )),
        }
    }

    #[inline]
    pub fn device_type(&self) -> DeviceType {
        self.backend.device_type()
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slots(&self) -> &[FrameSlot<B>] {
        &self.slots
    }

    #[inline]
    pub fn current_frame(&self) -> Option<usize> {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.in_flight()).count()
    }

    pub fn render_target(&self, image: usize) -> Option<&B::RenderTarget> {
        (image < self.slots.len()).then(|| self.backend.render_target(image))
    }

    /// Last value signalled on the `class` timeline.
    #[inline]
    pub fn signaled_value(&self, class: QueueClass) -> SyncPoint {
        self.timelines[class.index()].signaled()
    }

    pub fn completed_value(&self, class: QueueClass) -> RhiResult<SyncPoint> {
        self.timelines[class.index()].completed_value()
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn begin_frame(&mut self) -> RhiResult<usize> {
        let image = self.backend.acquire_next_image()?;
        let slot = self.slots.get_mut(image).ok_or_else(|| {
            RhiError::native(
                "acquire_next_image",
                format!("image index {image} out of range"),
            )
        })?;

        let timeline = &mut self.timelines[QueueClass::Graphics.index()];
        if !timeline.is_complete(slot.fence_value)? {
            debug!(
                "Waiting for frame slot {} to retire (value {})",
                image, slot.fence_value
            );
            timeline.wait_until(slot.fence_value, self.sync_timeout)?;
        }
        slot.state = SlotState::Retired;

        slot.list.begin()?;
        self.backend
            .transition_image(slot.list.native(), image, ImageState::RenderTarget);
        if let Some(color) = self.clear_color {
            self.backend.clear_image(slot.list.native(), image, color);
        }

        slot.state = SlotState::Recording;
        self.current = Some(image);

        Ok(image)
    }

    fn end_frame(&mut self, image: usize) -> RhiResult<()> {
        let slot = &mut self.slots[image];
        self.current = None;

        self.backend
            .transition_image(slot.list.native(), image, ImageState::Present);
        slot.list.end()?;

        let timeline = &mut self.timelines[QueueClass::Graphics.index()];
        let value = timeline.next_value();
        self.backend
            .submit_frame(slot.list.native(), image, timeline.fence(), value)?;

        slot.list.mark_submitted(value);
        slot.fence_value = value;
        slot.state = SlotState::Submitted;

        self.backend.present(image)?;
        slot.state = SlotState::Presented;

        Ok(())
    }

    fn submit(
        backend: &B,
        timeline: &mut Timeline<B::Fence>,
        class: QueueClass,
        lists: &mut [&mut CommandList<B>],
    ) -> RhiResult<SyncPoint> {
        if !lists.is_empty() {
            let natives = lists
                .iter()
                .map(|l| l.native())
                .collect::<SmallVec<[_; 4]>>();
            backend.execute(class, &natives)?;
        }

        let value = timeline.next_value();
        backend.signal(class, timeline.fence(), value)?;

        for list in lists.iter_mut() {
            list.mark_submitted(value);
        }

        Ok(value)
    }

    /// Waits every timeline up to its last signalled value. Keeps going after
    /// a failure and reports the first one.
    fn drain(&mut self, timeout: Option<Duration>) -> RhiResult<()> {
        let mut first_err = None;

        for class in QueueClass::ALL {
            let timeline = &mut self.timelines[class.index()];
            let value = timeline.signaled();

            if let Err(err) = timeline.wait_until(value, timeout) {
                warn!("Failed to drain {:?} queue up to {}: {}", class, value, err);
                first_err.get_or_insert(err);
            }
        }

        if let Some(err) = first_err {
            return Err(err);
        }

        for slot in &mut self.slots {
            if slot.in_flight() {
                slot.state = SlotState::Retired;
            }
        }

        Ok(())
    }

    fn ensure_alive(&self) -> RhiResult<()> {
        if self.lost {
            return Err(RhiError::invalid_state("device is lost"));
        }

        Ok(())
    }

    fn guard<T>(&mut self, result: RhiResult<T>) -> RhiResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() && !self.lost {
                error!("{} device lost: {}", self.device_type().name(), err);
                self.lost = true;
            }
        }

        result
    }
}

impl<B: RenderBackend> Drop for Device<B> {
    fn drop(&mut self) {
        let timeout = match (self.lost, self.sync_timeout) {
            (true, None) => Some(LOST_DRAIN_TIMEOUT),
            (_, timeout) => timeout,
        };

        if self.drain(timeout).is_err() {
            error!(
                "{} device destroyed with work still in flight",
                self.device_type().name()
            );

            for slot in &mut self.slots {
                slot.list.abandon();
            }
            self.copy_list.abandon();
            self.compute_list.abandon();
        }
    }
}

impl<B: RenderBackend> std::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_type", &self.device_type())
            .field("slots", &self.slots)
            .field("current", &self.current)
            .field("lost", &self.lost)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::rhi::headless::{Completion, HeadlessDesc, HeadlessDevice, HeadlessEvent};

    use super::*;

    fn device(completion: Completion, desc: DeviceDesc) -> Device<HeadlessDevice> {
        let backend = HeadlessDevice::new(HeadlessDesc {
            completion,
            ..Default::default()
        })
        .unwrap();

        Device::new(backend, &desc).unwrap()
    }

    #[test]
    fn begin_draw_twice_is_invalid() {
        let mut dev = device(Completion::Immediate, DeviceDesc::default());

        dev.begin_draw().unwrap();
        assert!(matches!(dev.begin_draw(), Err(RhiError::InvalidState(_))));
        assert!(!dev.is_lost());
    }

    #[test]
    fn end_draw_without_begin_is_invalid() {
        let mut dev = device(Completion::Immediate, DeviceDesc::default());

        assert!(matches!(dev.end_draw(), Err(RhiError::InvalidState(_))));
        assert!(!dev.is_lost());
    }

    #[test]
    fn frame_is_bracketed_by_transitions() {
        let mut dev = device(
            Completion::Immediate,
            DeviceDesc {
                clear_color: Some([0.1, 0.2, 0.3, 1.0]),
                ..Default::default()
            },
        );
        let gpu = dev.backend().gpu();

        let image = dev.begin_draw().unwrap();
        dev.frame_list().unwrap().raw().record("draw");
        dev.end_draw().unwrap();

        let frame = gpu
            .events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    HeadlessEvent::Transition { .. }
                        | HeadlessEvent::Clear { .. }
                        | HeadlessEvent::Present { .. }
                )
            })
            .collect::<Vec<_>>();

        assert_eq!(
            frame,
            vec![
                HeadlessEvent::Transition {
                    image,
                    state: ImageState::RenderTarget
                },
                HeadlessEvent::Clear { image },
                HeadlessEvent::Transition {
                    image,
                    state: ImageState::Present
                },
                HeadlessEvent::Present { image },
            ]
        );

        let commands = dev.slots()[image].list().raw().commands();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[2], "draw");
    }

    #[test]
    fn flush_signals_its_own_timeline() {
        let mut dev = device(Completion::Immediate, DeviceDesc::default());

        let list = dev.queue_list(QueueClass::Copy).unwrap();
        list.begin().unwrap();
        list.end().unwrap();

        assert_eq!(dev.flush(QueueClass::Copy).unwrap(), 1);
        assert_eq!(dev.signaled_value(QueueClass::Copy), 1);
        assert_eq!(dev.signaled_value(QueueClass::Graphics), 0);
        assert_eq!(dev.signaled_value(QueueClass::Compute), 0);

        assert!(matches!(
            dev.flush(QueueClass::Copy),
            Err(RhiError::InvalidState(_))
        ));
        assert!(matches!(
            dev.flush(QueueClass::Graphics),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn lists_of_another_class_are_rejected() {
        let mut dev = device(Completion::Immediate, DeviceDesc::default());
        let mut list = dev.create_command_list(QueueClass::Compute).unwrap();
        list.begin().unwrap();
        list.end().unwrap();

        let result = dev.execute_command_lists(QueueClass::Copy, &mut [&mut list]);

        assert!(matches!(result, Err(RhiError::InvalidState(_))));
        assert_eq!(dev.signaled_value(QueueClass::Copy), 0);
        assert!(!dev.is_lost());
    }

    #[test]
    fn wait_idle_retires_every_slot() {
        let mut dev = device(Completion::OnWait, DeviceDesc::default());

        for _ in 0..2 {
            dev.begin_draw().unwrap();
            dev.end_draw().unwrap();
        }
        assert_eq!(dev.frames_in_flight(), 2);

        dev.wait_idle().unwrap();

        assert_eq!(dev.frames_in_flight(), 0);
        assert_eq!(dev.completed_value(QueueClass::Graphics).unwrap(), 2);
    }

    #[test]
    fn failed_drain_releases_slot_lists_without_waiting_again() {
        let mut dev = device(
            Completion::Stalled,
            DeviceDesc {
                sync_timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        );
        let gpu = dev.backend().gpu();

        for _ in 0..3 {
            dev.begin_draw().unwrap();
            dev.end_draw().unwrap();
        }
        gpu.clear_events();
        drop(dev);

        let waits = gpu
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::Wait { class, value } => Some((class, value)),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(
            waits,
            vec![
                (QueueClass::Graphics, 3),
                (QueueClass::Copy, 0),
                (QueueClass::Compute, 0),
            ]
        );
    }

    #[test]
    fn render_target_is_bounded_by_frame_count() {
        let dev = device(Completion::Immediate, DeviceDesc::default());

        assert_eq!(dev.render_target(2).map(|v| v.image), Some(2));
        assert!(dev.render_target(dev.frame_count()).is_none());
    }
}
