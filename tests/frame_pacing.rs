use std::time::{Duration, Instant};

use proptest::prelude::*;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle, WebDisplayHandle, WebWindowHandle};
use tessera::{
    CommandListState, Device, DeviceDesc, DeviceType, NativeWindow, QueueClass, RhiError,
    create_device,
    ra::frame::SlotState,
    rhi::headless::{Completion, HeadlessDesc, HeadlessDevice, HeadlessEvent},
};

fn device(backend: HeadlessDesc, desc: DeviceDesc) -> Device<HeadlessDevice> {
    Device::new(HeadlessDevice::new(backend).unwrap(), &desc).unwrap()
}

fn with_completion(completion: Completion) -> HeadlessDesc {
    HeadlessDesc {
        completion,
        ..Default::default()
    }
}

#[test]
fn fresh_device_has_three_idle_slots() {
    let dev = device(HeadlessDesc::default(), DeviceDesc::default());

    assert_eq!(dev.frame_count(), 3);
    assert!(dev.slots().iter().all(|s| s.state() == SlotState::Idle));
    assert!(dev.slots().iter().all(|s| s.fence_value() == 0));

    for image in 0..3 {
        assert!(dev.render_target(image).is_some());
    }

    for class in QueueClass::ALL {
        assert_eq!(dev.signaled_value(class), 0);
        assert_eq!(dev.completed_value(class).unwrap(), 0);
    }
}

#[test]
fn ten_frames_present_ten_times() {
    let mut dev = device(HeadlessDesc::default(), DeviceDesc::default());
    let gpu = dev.backend().gpu();

    for _ in 0..10 {
        dev.begin_draw().unwrap();
        dev.end_draw().unwrap();
    }

    let presents = gpu.count(|e| matches!(e, HeadlessEvent::Present { .. }));
    let signals = gpu
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HeadlessEvent::Signal {
                class: QueueClass::Graphics,
                value,
            } => Some(value),
            _ => None,
        })
        .collect::<Vec<_>>();

    assert_eq!(presents, 10);
    assert_eq!(signals, (1..=10).collect::<Vec<_>>());
    assert_eq!(dev.signaled_value(QueueClass::Graphics), 10);
}

#[test]
fn stalled_gpu_blocks_fourth_frame_until_timeout() {
    let timeout = Duration::from_millis(50);
    let mut dev = device(
        with_completion(Completion::Stalled),
        DeviceDesc {
            sync_timeout: Some(timeout),
            ..Default::default()
        },
    );

    for _ in 0..3 {
        dev.begin_draw().unwrap();
        dev.end_draw().unwrap();
    }
    assert_eq!(dev.frames_in_flight(), 3);

    let start = Instant::now();
    let err = dev.begin_draw().unwrap_err();

    assert!(start.elapsed() >= timeout);
    assert!(matches!(
        err,
        RhiError::SyncTimeout {
            queue: QueueClass::Graphics,
            value: 1
        }
    ));
    assert!(dev.is_lost());
}

#[test]
fn stalled_gpu_unblocks_when_work_retires() {
    let mut dev = device(
        with_completion(Completion::Stalled),
        DeviceDesc {
            sync_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        },
    );
    let gpu = dev.backend().gpu();

    for _ in 0..3 {
        dev.begin_draw().unwrap();
        dev.end_draw().unwrap();
    }

    let worker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        gpu.complete(QueueClass::Graphics, 1);
    });

    assert_eq!(dev.begin_draw().unwrap(), 0);
    worker.join().unwrap();

    dev.backend().gpu().set_completion(Completion::Immediate);
    dev.end_draw().unwrap();
}

#[test]
fn recording_list_is_not_submitted() {
    let mut dev = device(HeadlessDesc::default(), DeviceDesc::default());
    let gpu = dev.backend().gpu();

    let mut list = dev.create_command_list(QueueClass::Copy).unwrap();
    list.begin().unwrap();
    gpu.clear_events();

    let result = dev.execute_command_lists(QueueClass::Copy, &mut [&mut list]);

    assert!(matches!(result, Err(RhiError::InvalidState(_))));
    assert_eq!(
        gpu.count(|e| matches!(e, HeadlessEvent::Execute { .. } | HeadlessEvent::Signal { .. })),
        0
    );
    assert_eq!(list.state(), CommandListState::Recording);
    assert!(!dev.is_lost());
}

#[test]
fn one_bad_list_rejects_the_whole_batch() {
    let mut dev = device(HeadlessDesc::default(), DeviceDesc::default());
    let gpu = dev.backend().gpu();

    let mut closed = dev.create_command_list(QueueClass::Compute).unwrap();
    closed.begin().unwrap();
    closed.end().unwrap();
    let mut fresh = dev.create_command_list(QueueClass::Compute).unwrap();

    let result = dev.execute_command_lists(QueueClass::Compute, &mut [&mut closed, &mut fresh]);

    assert!(matches!(result, Err(RhiError::InvalidState(_))));
    assert_eq!(closed.state(), CommandListState::Closed);
    assert_eq!(gpu.count(|e| matches!(e, HeadlessEvent::Execute { .. })), 0);
}

#[test]
fn drop_drains_each_queue_once() {
    let mut dev = device(HeadlessDesc::default(), DeviceDesc::default());
    let gpu = dev.backend().gpu();

    for _ in 0..5 {
        dev.begin_draw().unwrap();
        dev.end_draw().unwrap();
    }
    let list = dev.queue_list(QueueClass::Copy).unwrap();
    list.begin().unwrap();
    list.end().unwrap();
    dev.flush(QueueClass::Copy).unwrap();

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
            (QueueClass::Graphics, 5),
            (QueueClass::Copy, 1),
            (QueueClass::Compute, 0),
        ]
    );
}

#[test]
fn ending_a_list_twice_is_invalid() {
    let dev = device(HeadlessDesc::default(), DeviceDesc::default());
    let mut list = dev.create_command_list(QueueClass::Graphics).unwrap();

    list.begin().unwrap();
    list.end().unwrap();

    assert!(matches!(list.end(), Err(RhiError::InvalidState(_))));
    assert_eq!(list.state(), CommandListState::Closed);
}

#[test]
fn in_flight_list_cannot_be_reopened() {
    let mut dev = device(with_completion(Completion::Stalled), DeviceDesc::default());
    let gpu = dev.backend().gpu();

    let mut list = dev.create_command_list(QueueClass::Compute).unwrap();
    list.begin().unwrap();
    list.end().unwrap();
    let value = dev
        .execute_command_lists(QueueClass::Compute, &mut [&mut list])
        .unwrap();

    assert!(matches!(list.begin(), Err(RhiError::InvalidState(_))));

    gpu.complete(QueueClass::Compute, value);
    list.begin().unwrap();
    gpu.set_completion(Completion::Immediate);
}

#[test]
fn dropping_an_in_flight_list_waits_for_its_submission() {
    let mut dev = device(
        with_completion(Completion::Stalled),
        DeviceDesc {
            sync_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        },
    );
    let gpu = dev.backend().gpu();

    let mut list = dev.create_command_list(QueueClass::Compute).unwrap();
    list.begin().unwrap();
    list.end().unwrap();
    let value = dev
        .execute_command_lists(QueueClass::Compute, &mut [&mut list])
        .unwrap();
    gpu.clear_events();

    let worker = {
        let gpu = gpu.clone();
        std::thread::spawn(move || {
            while gpu.count(|e| matches!(e, HeadlessEvent::Wait { .. })) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            gpu.complete(QueueClass::Compute, value);
        })
    };
    drop(list);
    worker.join().unwrap();

    assert_eq!(
        gpu.events(),
        vec![HeadlessEvent::Wait {
            class: QueueClass::Compute,
            value
        }]
    );
    assert_eq!(dev.completed_value(QueueClass::Compute).unwrap(), value);
    gpu.set_completion(Completion::Immediate);
}

#[test]
fn reopening_a_closed_list_is_invalid() {
    let dev = device(HeadlessDesc::default(), DeviceDesc::default());
    let mut list = dev.create_command_list(QueueClass::Copy).unwrap();

    list.begin().unwrap();
    list.end().unwrap();

    assert!(matches!(list.begin(), Err(RhiError::InvalidState(_))));
    assert_eq!(list.state(), CommandListState::Closed);
}

#[test]
fn unavailable_backend_returns_no_device() {
    let window = NativeWindow {
        window: RawWindowHandle::Web(WebWindowHandle::new(1)),
        display: RawDisplayHandle::Web(WebDisplayHandle::new()),
    };

    for ty in [DeviceType::Dx12, DeviceType::Vulkan] {
        let result = create_device(&window, 800, 600, ty, &DeviceDesc::default());

        match result {
            Err(RhiError::BackendUnavailable { backend, .. }) => assert_eq!(backend, ty),
            other => panic!("expected BackendUnavailable for {ty:?}, got {other:?}"),
        }
    }
}

#[test]
fn failed_present_loses_the_device() {
    let mut dev = device(HeadlessDesc::default(), DeviceDesc::default());
    dev.backend().gpu().fail_next_present();

    dev.begin_draw().unwrap();
    assert!(matches!(
        dev.end_draw(),
        Err(RhiError::PresentFailed { .. })
    ));
    assert!(dev.is_lost());

    assert!(matches!(dev.begin_draw(), Err(RhiError::InvalidState(_))));
    assert!(matches!(
        dev.flush(QueueClass::Copy),
        Err(RhiError::InvalidState(_))
    ));
}

#[test]
fn slots_follow_the_acquired_image() {
    let mut dev = device(
        HeadlessDesc {
            image_order: Some(vec![2, 0, 1]),
            ..Default::default()
        },
        DeviceDesc::default(),
    );

    assert_eq!(dev.begin_draw().unwrap(), 2);
    assert_eq!(dev.current_frame(), Some(2));
    assert_eq!(dev.slots()[2].state(), SlotState::Recording);
    assert_eq!(dev.slots()[0].state(), SlotState::Idle);
    dev.end_draw().unwrap();

    assert_eq!(dev.slots()[2].state(), SlotState::Presented);
    assert_eq!(dev.slots()[2].fence_value(), 1);

    assert_eq!(dev.begin_draw().unwrap(), 0);
    dev.end_draw().unwrap();
    assert_eq!(dev.slots()[0].fence_value(), 2);
}

proptest! {
    #[test]
    fn slot_list_is_never_reset_while_in_flight(
        order in prop::collection::vec(0usize..3, 1..8),
        frames in 1usize..24,
    ) {
        let mut dev = device(
            HeadlessDesc {
                completion: Completion::OnWait,
                image_order: Some(order),
                ..Default::default()
            },
            DeviceDesc::default(),
        );
        let gpu = dev.backend().gpu();

        for _ in 0..frames {
            dev.begin_draw().unwrap();
            dev.end_draw().unwrap();
        }

        for event in gpu.events() {
            if let HeadlessEvent::Reset { class: QueueClass::Graphics, pending, completed, .. } = event {
                prop_assert!(pending <= completed, "reset at {} with {} completed", pending, completed);
            }
        }

        prop_assert_eq!(dev.signaled_value(QueueClass::Graphics), frames as u64);
    }
}
