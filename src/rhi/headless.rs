//! Software device that runs the full submission protocol without a GPU.
//!
//! The simulated GPU keeps one timeline per queue class and logs every
//! native-level operation, which makes it the backend of choice for CI and
//! for checking frame-pacing behaviour.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::{
    backend::{DeviceType, FRAME_COUNT, RenderBackend},
    command::{GpuFence, QueueClass, RenderCommandDevice, RenderCommandList, SyncPoint},
    error::{RhiError, RhiResult},
    swapchain::{ImageState, RenderSwapchainDevice},
};

/// How the simulated GPU retires signalled work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Completion {
    /// Work retires as soon as it is signalled.
    #[default]
    Immediate,
    /// Work retires only when the CPU waits for it.
    OnWait,
    /// Work retires only through [`HeadlessGpu::complete`].
    Stalled,
}

#[derive(Clone, Debug)]
pub struct HeadlessDesc {
    pub emulate: DeviceType,
    pub completion: Completion,
    /// Image indices the surface hands out, cycled. Round-robin when `None`.
    pub image_order: Option<Vec<usize>>,
}

impl Default for HeadlessDesc {
    fn default() -> Self {
        Self {
            emulate: DeviceType::Vulkan,
            completion: Completion::Immediate,
            image_order: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadlessEvent {
    Acquire {
        image: usize,
    },
    Reset {
        class: QueueClass,
        list: u64,
        pending: SyncPoint,
        completed: SyncPoint,
    },
    Close {
        class: QueueClass,
        list: u64,
    },
    Transition {
        image: usize,
        state: ImageState,
    },
    Clear {
        image: usize,
    },
    Execute {
        class: QueueClass,
        lists: Vec<u64>,
    },
    Signal {
        class: QueueClass,
        value: SyncPoint,
    },
    Wait {
        class: QueueClass,
        value: SyncPoint,
    },
    Present {
        image: usize,
    },
}

#[derive(Debug, Default)]
pub struct HeadlessGpu {
    state: Mutex<GpuState>,
    retired: Condvar,
}

#[derive(Debug, Default)]
struct GpuState {
    completion: Completion,
    signaled: [SyncPoint; 3],
    completed: [SyncPoint; 3],

    unsignaled: Vec<(QueueClass, u64)>,
    pending: HashMap<u64, SyncPoint>,

    next_list: u64,
    fail_present: bool,
    events: Vec<HeadlessEvent>,
}

impl HeadlessGpu {
    fn new(completion: Completion) -> Self {
        Self {
            state: Mutex::new(GpuState {
                completion,
                ..Default::default()
            }),
            retired: Condvar::new(),
        }
    }

    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.state.lock().events.clone()
    }

    pub fn count(&self, pred: impl Fn(&HeadlessEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn completed_value(&self, class: QueueClass) -> SyncPoint {
        self.state.lock().completed[class.index()]
    }

    pub fn signaled_value(&self, class: QueueClass) -> SyncPoint {
        self.state.lock().signaled[class.index()]
    }

    pub fn set_completion(&self, completion: Completion) {
        let mut guard = self.state.lock();
        guard.completion = completion;

        if completion == Completion::Immediate {
            guard.completed = guard.signaled;
            self.retired.notify_all();
        }
    }

    /// Retires work on `class` up to `value`, clamped to what was signalled.
    pub fn complete(&self, class: QueueClass, value: SyncPoint) {
        let mut guard = self.state.lock();
        let idx = class.index();
        let value = value.min(guard.signaled[idx]);

        if guard.completed[idx] < value {
            guard.completed[idx] = value;
            self.retired.notify_all();
        }
    }

    pub fn fail_next_present(&self) {
        self.state.lock().fail_present = true;
    }

    fn log(&self, event: HeadlessEvent) {
        self.state.lock().events.push(event);
    }

    fn allocate_list_id(&self) -> u64 {
        let mut guard = self.state.lock();
        guard.next_list += 1;
        guard.next_list
    }
}

#[derive(Debug)]
pub struct HeadlessDevice {
    desc: HeadlessDesc,
    gpu: Arc<HeadlessGpu>,
    views: Vec<HeadlessView>,
    acquired: usize,
}

impl HeadlessDevice {
    pub fn new(desc: HeadlessDesc) -> RhiResult<Self> {
        if let Some(order) = &desc.image_order {
            if order.is_empty() || order.iter().any(|i| *i >= FRAME_COUNT) {
                return Err(RhiError::native(
                    "HeadlessDevice::new",
                    format!("image order {order:?} does not fit {FRAME_COUNT} images"),
                ));
            }
        }

        info!("Creating headless device emulating {}", desc.emulate.name());

        Ok(Self {
            gpu: Arc::new(HeadlessGpu::new(desc.completion)),
            views: (0..FRAME_COUNT).map(|image| HeadlessView { image }).collect(),
            acquired: 0,
            desc,
        })
    }

    /// Handle to the simulated GPU; stays valid after the device is dropped.
    pub fn gpu(&self) -> Arc<HeadlessGpu> {
        Arc::clone(&self.gpu)
    }

    pub fn raw(&self) -> &HeadlessGpu {
        &self.gpu
    }
}

impl RenderBackend for HeadlessDevice {
    fn device_type(&self) -> DeviceType {
        self.desc.emulate
    }
}

impl RenderCommandDevice for HeadlessDevice {
    type Fence = HeadlessFence;
    type CommandList = HeadlessCommandList;

    fn create_fence(&self, class: QueueClass) -> RhiResult<Self::Fence> {
        Ok(HeadlessFence {
            class,
            gpu: Arc::clone(&self.gpu),
        })
    }

    fn create_command_list(&self, class: QueueClass) -> RhiResult<Self::CommandList> {
        let id = self.gpu.allocate_list_id();

        Ok(HeadlessCommandList {
            gpu: Arc::clone(&self.gpu),
            buffer: HeadlessCommandBuffer {
                id,
                class,
                commands: Mutex::new(Vec::new()),
            },
        })
    }

    fn execute(&self, class: QueueClass, lists: &[&Self::CommandList]) -> RhiResult<()> {
        let ids = lists.iter().map(|l| l.buffer.id).collect::<Vec<_>>();

        let mut guard = self.gpu.state.lock();
        guard.unsignaled.extend(ids.iter().map(|id| (class, *id)));
        guard.events.push(HeadlessEvent::Execute { class, lists: ids });

        Ok(())
    }

    fn signal(&self, class: QueueClass, fence: &Self::Fence, value: SyncPoint) -> RhiResult<()> {
        if fence.class != class {
            return Err(RhiError::native(
                "HeadlessDevice::signal",
                format!("{:?} fence signalled on the {class:?} queue", fence.class),
            ));
        }

        let mut guard = self.gpu.state.lock();
        let idx = class.index();
        guard.signaled[idx] = value;

        let (retiring, rest): (Vec<_>, Vec<_>) =
            guard.unsignaled.drain(..).partition(|(c, _)| *c == class);
        guard.unsignaled = rest;
        for (_, id) in retiring {
            guard.pending.insert(id, value);
        }

        if guard.completion == Completion::Immediate {
            guard.completed[idx] = value;
            self.gpu.retired.notify_all();
        }

        guard.events.push(HeadlessEvent::Signal { class, value });

        Ok(())
    }
}

impl RenderSwapchainDevice for HeadlessDevice {
    type RenderTarget = HeadlessView;

    fn frame_count(&self) -> usize {
        self.views.len()
    }

    fn render_target(&self, image: usize) -> &Self::RenderTarget {
        &self.views[image]
    }

    fn acquire_next_image(&mut self) -> RhiResult<usize> {
        let image = match &self.desc.image_order {
            Some(order) => order[self.acquired % order.len()],
            None => self.acquired % self.views.len(),
        };
        self.acquired += 1;

        self.gpu.log(HeadlessEvent::Acquire { image });

        Ok(image)
    }

    fn transition_image(&mut self, list: &Self::CommandList, image: usize, state: ImageState) {
        list.buffer.record(format!("transition {image} -> {state:?}"));
        self.gpu.log(HeadlessEvent::Transition { image, state });
    }

    fn clear_image(&self, list: &Self::CommandList, image: usize, color: [f32; 4]) {
        list.buffer.record(format!("clear {image} {color:?}"));
        self.gpu.log(HeadlessEvent::Clear { image });
    }

    fn submit_frame(
        &mut self,
        list: &Self::CommandList,
        _image: usize,
        fence: &Self::Fence,
        value: SyncPoint,
    ) -> RhiResult<()> {
        self.execute(QueueClass::Graphics, &[list])?;
        self.signal(QueueClass::Graphics, fence, value)
    }

    fn present(&mut self, image: usize) -> RhiResult<()> {
        let failed = std::mem::take(&mut self.gpu.state.lock().fail_present);
        if failed {
            return Err(RhiError::PresentFailed {
                reason: "surface lost (injected)".to_string(),
            });
        }

        self.gpu.log(HeadlessEvent::Present { image });

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadlessView {
    pub image: usize,
}

#[derive(Debug)]
pub struct HeadlessFence {
    class: QueueClass,
    gpu: Arc<HeadlessGpu>,
}

impl GpuFence for HeadlessFence {
    fn class(&self) -> QueueClass {
        self.class
    }

    fn completed_value(&self) -> RhiResult<SyncPoint> {
        Ok(self.gpu.completed_value(self.class))
    }

    fn wait(&self, value: SyncPoint, timeout: Option<Duration>) -> RhiResult<()> {
        let idx = self.class.index();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut guard = self.gpu.state.lock();
        guard.events.push(HeadlessEvent::Wait {
            class: self.class,
            value,
        });

        if guard.completion == Completion::OnWait && value <= guard.signaled[idx] {
            guard.completed[idx] = guard.completed[idx].max(value);
        }

        while guard.completed[idx] < value {
            match deadline {
                Some(deadline) => {
                    if self.gpu.retired.wait_until(&mut guard, deadline).timed_out()
                        && guard.completed[idx] < value
                    {
                        debug!("Headless wait for {} on {:?} timed out", value, self.class);
                        return Err(RhiError::SyncTimeout {
                            queue: self.class,
                            value,
                        });
                    }
                }
                None => self.gpu.retired.wait(&mut guard),
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct HeadlessCommandList {
    gpu: Arc<HeadlessGpu>,
    buffer: HeadlessCommandBuffer,
}

impl RenderCommandList for HeadlessCommandList {
    type Raw = HeadlessCommandBuffer;

    fn class(&self) -> QueueClass {
        self.buffer.class
    }

    fn reset(&mut self) -> RhiResult<()> {
        let mut guard = self.gpu.state.lock();
        let pending = guard.pending.get(&self.buffer.id).copied().unwrap_or(0);
        let completed = guard.completed[self.buffer.class.index()];

        guard.events.push(HeadlessEvent::Reset {
            class: self.buffer.class,
            list: self.buffer.id,
            pending,
            completed,
        });
        self.buffer.commands.lock().clear();

        Ok(())
    }

    fn close(&mut self) -> RhiResult<()> {
        self.gpu.log(HeadlessEvent::Close {
            class: self.buffer.class,
            list: self.buffer.id,
        });

        Ok(())
    }

    fn raw(&self) -> &Self::Raw {
        &self.buffer
    }
}

/// Recordable stand-in for a native command buffer.
#[derive(Debug)]
pub struct HeadlessCommandBuffer {
    pub id: u64,
    pub class: QueueClass,
    commands: Mutex<Vec<String>>,
}

impl HeadlessCommandBuffer {
    pub fn record(&self, command: impl Into<String>) {
        self.commands.lock().push(command.into());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn device(completion: Completion) -> HeadlessDevice {
        HeadlessDevice::new(HeadlessDesc {
            completion,
            ..Default::default()
        })
        .expect("headless device")
    }

    #[test]
    fn immediate_completion_tracks_signals() {
        let dev = device(Completion::Immediate);
        let fence = dev.create_fence(QueueClass::Copy).unwrap();

        dev.signal(QueueClass::Copy, &fence, 3).unwrap();

        assert_eq!(fence.completed_value().unwrap(), 3);
        assert_eq!(dev.gpu().completed_value(QueueClass::Graphics), 0);
    }

    #[test]
    fn on_wait_retires_only_when_waited() {
        let dev = device(Completion::OnWait);
        let fence = dev.create_fence(QueueClass::Graphics).unwrap();

        dev.signal(QueueClass::Graphics, &fence, 1).unwrap();
        dev.signal(QueueClass::Graphics, &fence, 2).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 0);

        fence.wait(1, None).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 1);
    }

    #[test]
    fn stalled_wait_times_out() {
        let dev = device(Completion::Stalled);
        let fence = dev.create_fence(QueueClass::Compute).unwrap();
        dev.signal(QueueClass::Compute, &fence, 1).unwrap();

        let start = Instant::now();
        let err = fence.wait(1, Some(Duration::from_millis(20))).unwrap_err();

        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(matches!(
            err,
            RhiError::SyncTimeout {
                queue: QueueClass::Compute,
                value: 1
            }
        ));
    }

    #[test]
    fn stalled_wait_wakes_on_manual_completion() {
        let dev = device(Completion::Stalled);
        let fence = dev.create_fence(QueueClass::Graphics).unwrap();
        dev.signal(QueueClass::Graphics, &fence, 1).unwrap();

        let gpu = dev.gpu();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            gpu.complete(QueueClass::Graphics, 1);
        });

        fence.wait(1, Some(Duration::from_secs(5))).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn completion_is_clamped_to_signalled_value() {
        let dev = device(Completion::Stalled);
        let fence = dev.create_fence(QueueClass::Copy).unwrap();
        dev.signal(QueueClass::Copy, &fence, 2).unwrap();

        dev.gpu().complete(QueueClass::Copy, 10);

        assert_eq!(fence.completed_value().unwrap(), 2);
    }

    #[test]
    fn reset_reports_pending_submission() {
        let dev = device(Completion::Stalled);
        let fence = dev.create_fence(QueueClass::Copy).unwrap();
        let mut list = dev.create_command_list(QueueClass::Copy).unwrap();

        list.raw().record("copy");
        dev.execute(QueueClass::Copy, &[&list]).unwrap();
        dev.signal(QueueClass::Copy, &fence, 1).unwrap();
        list.reset().unwrap();

        let id = list.raw().id;
        let resets = dev
            .gpu()
            .events()
            .into_iter()
            .filter(|e| matches!(e, HeadlessEvent::Reset { .. }))
            .collect::<Vec<_>>();

        assert_eq!(
            resets,
            vec![HeadlessEvent::Reset {
                class: QueueClass::Copy,
                list: id,
                pending: 1,
                completed: 0,
            }]
        );
        assert!(list.raw().commands().is_empty());
    }

    #[test]
    fn scripted_image_order_cycles() {
        let mut dev = HeadlessDevice::new(HeadlessDesc {
            image_order: Some(vec![2, 0]),
            ..Default::default()
        })
        .unwrap();

        let images = (0..4)
            .map(|_| dev.acquire_next_image().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(images, vec![2, 0, 2, 0]);
    }

    #[test]
    fn rejects_out_of_range_image_order() {
        let result = HeadlessDevice::new(HeadlessDesc {
            image_order: Some(vec![0, FRAME_COUNT]),
            ..Default::default()
        });

        assert!(result.is_err());
    }

    #[test]
    fn injected_present_failure_fires_once() {
        let mut dev = device(Completion::Immediate);
        dev.gpu().fail_next_present();

        assert!(matches!(dev.present(0), Err(RhiError::PresentFailed { .. })));
        assert!(dev.present(0).is_ok());
    }
}
