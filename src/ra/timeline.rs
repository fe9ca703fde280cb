use std::{sync::Arc, time::Duration};

use crate::rhi::{
    command::{GpuFence, QueueClass, SyncPoint},
    error::RhiResult,
};

/// CPU-side view of one queue's fence: the last value handed to the GPU and
/// the last value the CPU has waited on.
#[derive(Debug)]
pub struct Timeline<F> {
    fence: Arc<F>,
    signaled: SyncPoint,
    waited: SyncPoint,
}

impl<F: GpuFence> Timeline<F> {
    pub fn new(fence: F) -> Self {
        Self {
            fence: Arc::new(fence),
            signaled: 0,
            waited: 0,
        }
    }

    #[inline]
    pub fn class(&self) -> QueueClass {
        self.fence.class()
    }

    #[inline]
    pub fn fence(&self) -> &Arc<F> {
        &self.fence
    }

    /// Reserves the next value to signal.
    #[inline]
    pub fn next_value(&mut self) -> SyncPoint {
        self.signaled += 1;
        self.signaled
    }

    #[inline]
    pub fn signaled(&self) -> SyncPoint {
        self.signaled
    }

    #[inline]
    pub fn waited(&self) -> SyncPoint {
        self.waited
    }

    pub fn completed_value(&self) -> RhiResult<SyncPoint> {
        self.fence.completed_value()
    }

    pub fn is_complete(&self, value: SyncPoint) -> RhiResult<bool> {
        Ok(value <= self.waited || self.fence.completed_value()? >= value)
    }

    pub fn wait_until(&mut self, value: SyncPoint, timeout: Option<Duration>) -> RhiResult<()> {
        self.fence.wait(value, timeout)?;
        self.waited = self.waited.max(value);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rhi::{
        command::RenderCommandDevice,
        headless::{Completion, HeadlessDesc, HeadlessDevice},
    };

    use super::*;

    #[test]
    fn values_start_at_zero_and_increase_by_one() {
        let dev = HeadlessDevice::new(HeadlessDesc::default()).unwrap();
        let mut timeline = Timeline::new(dev.create_fence(QueueClass::Copy).unwrap());

        assert_eq!(timeline.signaled(), 0);
        assert_eq!(timeline.next_value(), 1);
        assert_eq!(timeline.next_value(), 2);
        assert_eq!(timeline.signaled(), 2);
    }

    #[test]
    fn wait_records_highest_waited_value() {
        let dev = HeadlessDevice::new(HeadlessDesc {
            completion: Completion::OnWait,
            ..Default::default()
        })
        .unwrap();
        let mut timeline = Timeline::new(dev.create_fence(QueueClass::Graphics).unwrap());

        for _ in 0..3 {
            let value = timeline.next_value();
            dev.signal(QueueClass::Graphics, timeline.fence(), value)
                .unwrap();
        }

        assert!(!timeline.is_complete(2).unwrap());
        timeline.wait_until(2, None).unwrap();
        timeline.wait_until(1, None).unwrap();

        assert_eq!(timeline.waited(), 2);
        assert!(timeline.is_complete(2).unwrap());
        assert!(!timeline.is_complete(3).unwrap());
    }
}
