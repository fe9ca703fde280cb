use std::time::Duration;

use smallvec::SmallVec;
use tracing::info;

use crate::rhi::{
    backend::{DebugFlags, DeviceType},
    command::{QueueClass, SyncPoint},
    error::{RhiError, RhiResult},
    headless::{HeadlessCommandBuffer, HeadlessDesc, HeadlessDevice},
    swapchain::{PresentMode, SwapchainDesc},
};

pub use crate::rhi::swapchain::NativeWindow;

#[cfg(windows)]
use crate::rhi::dx12::DxDevice;
#[cfg(feature = "vulkan")]
use crate::rhi::vulkan::VkDevice;

use super::{
    command::{CommandList, CommandListState},
    device::Device,
};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceDesc {
    pub debug: DebugFlags,
    pub present_mode: PresentMode,
    /// Upper bound for every blocking fence wait. `None` waits forever.
    pub sync_timeout: Option<Duration>,
    /// Colour the back buffer is cleared to at the start of each frame.
    pub clear_color: Option<[f32; 4]>,
}

/// Creates a device of the requested backend presenting to `window`.
pub fn create_device(
    window: &NativeWindow,
    width: u32,
    height: u32,
    ty: DeviceType,
    desc: &DeviceDesc,
) -> RhiResult<GraphicsDevice> {
    info!("Requested {} device {}x{}", ty.name(), width, height);

    let swapchain = SwapchainDesc {
        width,
        height,
        present_mode: desc.present_mode,
        frames: crate::rhi::backend::FRAME_COUNT,
    };

    let device = match ty {
        DeviceType::Dx12 => create_dx12(window, swapchain, desc),
        DeviceType::Vulkan => create_vulkan(window, swapchain, desc),
    };

    device.map_err(|err| err.into_init_failure(ty))
}

#[cfg(windows)]
fn create_dx12(
    window: &NativeWindow,
    swapchain: SwapchainDesc,
    desc: &DeviceDesc,
) -> RhiResult<GraphicsDevice> {
    let backend = DxDevice::new(window, swapchain, desc.debug)?;
    Ok(GraphicsDevice::Dx12(Device::new(backend, desc)?))
}

#[cfg(not(windows))]
fn create_dx12(_: &NativeWindow, _: SwapchainDesc, _: &DeviceDesc) -> RhiResult<GraphicsDevice> {
    Err(RhiError::BackendUnavailable {
        backend: DeviceType::Dx12,
        reason: "Direct3D 12 is only available on Windows".into(),
    })
}

#[cfg(feature = "vulkan")]
fn create_vulkan(
    window: &NativeWindow,
    swapchain: SwapchainDesc,
    desc: &DeviceDesc,
) -> RhiResult<GraphicsDevice> {
    let backend = VkDevice::new(window, swapchain, desc.debug, desc.sync_timeout)?;
    Ok(GraphicsDevice::Vulkan(Device::new(backend, desc)?))
}

#[cfg(not(feature = "vulkan"))]
fn create_vulkan(_: &NativeWindow, _: SwapchainDesc, _: &DeviceDesc) -> RhiResult<GraphicsDevice> {
    Err(RhiError::BackendUnavailable {
        backend: DeviceType::Vulkan,
        reason: "built without the `vulkan` feature".into(),
    })
}

macro_rules! dispatch {
    ($value:expr, $enum:ident, $inner:ident => $body:expr) => {
        match $value {
            #[cfg(windows)]
            $enum::Dx12($inner) => $body,
            #[cfg(feature = "vulkan")]
            $enum::Vulkan($inner) => $body,
            $enum::Headless($inner) => $body,
        }
    };
}

#[derive(Debug)]
pub enum GraphicsDevice {
    #[cfg(windows)]
    Dx12(Device<DxDevice>),
    #[cfg(feature = "vulkan")]
    Vulkan(Device<VkDevice>),
    Headless(Device<HeadlessDevice>),
}

impl GraphicsDevice {
    /// Software device; needs no window and no GPU.
    pub fn headless(backend: HeadlessDesc, desc: &DeviceDesc) -> RhiResult<Self> {
        let emulate = backend.emulate;
        let device = HeadlessDevice::new(backend).and_then(|b| Device::new(b, desc));

        device
            .map(GraphicsDevice::Headless)
            .map_err(|err| err.into_init_failure(emulate))
    }

    pub fn device_type(&self) -> DeviceType {
        dispatch!(self, GraphicsDevice, dev => dev.device_type())
    }

    pub fn begin_draw(&mut self) -> RhiResult<usize> {
        dispatch!(self, GraphicsDevice, dev => dev.begin_draw())
    }

    pub fn end_draw(&mut self) -> RhiResult<()> {
        dispatch!(self, GraphicsDevice, dev => dev.end_draw())
    }

    pub fn wait_idle(&mut self) -> RhiResult<()> {
        dispatch!(self, GraphicsDevice, dev => dev.wait_idle())
    }

    pub fn flush(&mut self, class: QueueClass) -> RhiResult<SyncPoint> {
        dispatch!(self, GraphicsDevice, dev => dev.flush(class))
    }

    pub fn frame_count(&self) -> usize {
        dispatch!(self, GraphicsDevice, dev => dev.frame_count())
    }

    pub fn current_frame(&self) -> Option<usize> {
        dispatch!(self, GraphicsDevice, dev => dev.current_frame())
    }

    pub fn frames_in_flight(&self) -> usize {
        dispatch!(self, GraphicsDevice, dev => dev.frames_in_flight())
    }

    pub fn signaled_value(&self, class: QueueClass) -> SyncPoint {
        dispatch!(self, GraphicsDevice, dev => dev.signaled_value(class))
    }

    pub fn completed_value(&self, class: QueueClass) -> RhiResult<SyncPoint> {
        dispatch!(self, GraphicsDevice, dev => dev.completed_value(class))
    }

    pub fn is_lost(&self) -> bool {
        dispatch!(self, GraphicsDevice, dev => dev.is_lost())
    }

    /// Native handle of the frame command list while a frame is recording.
    pub fn frame_list(&self) -> RhiResult<RawCommandList<'_>> {
        match self {
            #[cfg(windows)]
            GraphicsDevice::Dx12(dev) => dev.frame_list().map(|l| RawCommandList::Dx12(l.raw())),
            #[cfg(feature = "vulkan")]
            GraphicsDevice::Vulkan(dev) => {
                dev.frame_list().map(|l| RawCommandList::Vulkan(*l.raw()))
            }
            GraphicsDevice::Headless(dev) => {
                dev.frame_list().map(|l| RawCommandList::Headless(l.raw()))
            }
        }
    }

    pub fn create_command_list(&self, class: QueueClass) -> RhiResult<GraphicsCommandList> {
        match self {
            #[cfg(windows)]
            GraphicsDevice::Dx12(dev) => dev.create_command_list(class).map(GraphicsCommandList::Dx12),
            #[cfg(feature = "vulkan")]
            GraphicsDevice::Vulkan(dev) => {
                dev.create_command_list(class).map(GraphicsCommandList::Vulkan)
            }
            GraphicsDevice::Headless(dev) => {
                dev.create_command_list(class).map(GraphicsCommandList::Headless)
            }
        }
    }

    /// Lists created by another backend are rejected before anything is
    /// submitted.
    pub fn execute_command_lists(
        &mut self,
        class: QueueClass,
        lists: &mut [&mut GraphicsCommandList],
    ) -> RhiResult<SyncPoint> {
        match self {
            #[cfg(windows)]
            GraphicsDevice::Dx12(dev) => {
                let mut lists = downcast_lists(lists, GraphicsCommandList::as_dx12_mut)?;
                dev.execute_command_lists(class, &mut lists)
            }
            #[cfg(feature = "vulkan")]
            GraphicsDevice::Vulkan(dev) => {
                let mut lists = downcast_lists(lists, GraphicsCommandList::as_vulkan_mut)?;
                dev.execute_command_lists(class, &mut lists)
            }
            GraphicsDevice::Headless(dev) => {
                let mut lists = downcast_lists(lists, GraphicsCommandList::as_headless_mut)?;
                dev.execute_command_lists(class, &mut lists)
            }
        }
    }

    #[cfg(windows)]
    pub fn as_dx12(&self) -> Option<&Device<DxDevice>> {
        match self {
            GraphicsDevice::Dx12(dev) => Some(dev),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    #[cfg(feature = "vulkan")]
    pub fn as_vulkan(&self) -> Option<&Device<VkDevice>> {
        match self {
            GraphicsDevice::Vulkan(dev) => Some(dev),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    pub fn as_headless(&self) -> Option<&Device<HeadlessDevice>> {
        match self {
            GraphicsDevice::Headless(dev) => Some(dev),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

fn downcast_lists<'a, T>(
    lists: &'a mut [&mut GraphicsCommandList],
    pick: impl Fn(&mut GraphicsCommandList) -> Option<&mut T>,
) -> RhiResult<SmallVec<[&'a mut T; 4]>> {
    lists
        .iter_mut()
        .map(|list| {
            pick(list).ok_or_else(|| {
                RhiError::invalid_state("command list was created by another backend")
            })
        })
        .collect()
}

#[derive(Debug)]
pub enum GraphicsCommandList {
    #[cfg(windows)]
    Dx12(CommandList<DxDevice>),
    #[cfg(feature = "vulkan")]
    Vulkan(CommandList<VkDevice>),
    Headless(CommandList<HeadlessDevice>),
}

impl GraphicsCommandList {
    pub fn class(&self) -> QueueClass {
        dispatch!(self, GraphicsCommandList, list => list.class())
    }

    pub fn state(&self) -> CommandListState {
        dispatch!(self, GraphicsCommandList, list => list.state())
    }

    pub fn begin(&mut self) -> RhiResult<()> {
        dispatch!(self, GraphicsCommandList, list => list.begin())
    }

    pub fn end(&mut self) -> RhiResult<()> {
        dispatch!(self, GraphicsCommandList, list => list.end())
    }

    pub fn raw_handle(&self) -> RawCommandList<'_> {
        match self {
            #[cfg(windows)]
            GraphicsCommandList::Dx12(list) => RawCommandList::Dx12(list.raw()),
            #[cfg(feature = "vulkan")]
            GraphicsCommandList::Vulkan(list) => RawCommandList::Vulkan(*list.raw()),
            GraphicsCommandList::Headless(list) => RawCommandList::Headless(list.raw()),
        }
    }

    #[cfg(windows)]
    pub fn as_dx12_mut(&mut self) -> Option<&mut CommandList<DxDevice>> {
        match self {
            GraphicsCommandList::Dx12(list) => Some(list),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    #[cfg(feature = "vulkan")]
    pub fn as_vulkan_mut(&mut self) -> Option<&mut CommandList<VkDevice>> {
        match self {
            GraphicsCommandList::Vulkan(list) => Some(list),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    pub fn as_headless_mut(&mut self) -> Option<&mut CommandList<HeadlessDevice>> {
        match self {
            GraphicsCommandList::Headless(list) => Some(list),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

/// Native recordable object behind a command list.
#[derive(Clone, Copy, Debug)]
pub enum RawCommandList<'a> {
    #[cfg(windows)]
    Dx12(&'a oxidx::dx::GraphicsCommandList),
    #[cfg(feature = "vulkan")]
    Vulkan(ash::vk::CommandBuffer),
    Headless(&'a HeadlessCommandBuffer),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headless() -> GraphicsDevice {
        GraphicsDevice::headless(HeadlessDesc::default(), &DeviceDesc::default()).unwrap()
    }

    #[test]
    fn headless_reports_emulated_type() {
        let dev = GraphicsDevice::headless(
            HeadlessDesc {
                emulate: DeviceType::Dx12,
                ..Default::default()
            },
            &DeviceDesc::default(),
        )
        .unwrap();

        assert_eq!(dev.device_type(), DeviceType::Dx12);
        assert_eq!(dev.frame_count(), 3);
        assert!(dev.as_headless().is_some());
    }

    #[test]
    fn frame_list_only_while_recording() {
        let mut dev = headless();

        assert!(dev.frame_list().is_err());
        dev.begin_draw().unwrap();
        assert!(matches!(dev.frame_list(), Ok(RawCommandList::Headless(_))));
        dev.end_draw().unwrap();
        assert!(dev.frame_list().is_err());
    }

    #[test]
    fn execute_through_facade() {
        let mut dev = headless();
        let mut first = dev.create_command_list(QueueClass::Compute).unwrap();
        let mut second = dev.create_command_list(QueueClass::Compute).unwrap();

        for list in [&mut first, &mut second] {
            list.begin().unwrap();
            list.end().unwrap();
        }

        let value = dev
            .execute_command_lists(QueueClass::Compute, &mut [&mut first, &mut second])
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(first.state(), CommandListState::Submitted(1));
        assert_eq!(second.state(), CommandListState::Submitted(1));
    }

    #[test]
    fn headless_init_failure_names_backend() {
        let err = GraphicsDevice::headless(
            HeadlessDesc {
                image_order: Some(vec![7]),
                ..Default::default()
            },
            &DeviceDesc::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            RhiError::DeviceInitFailed {
                backend: DeviceType::Vulkan,
                ..
            }
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn dx12_is_unavailable_off_windows() {
        use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

        let window = NativeWindow {
            window: RawWindowHandle::Web(raw_window_handle::WebWindowHandle::new(1)),
            display: RawDisplayHandle::Web(raw_window_handle::WebDisplayHandle::new()),
        };

        let result = create_device(&window, 800, 600, DeviceType::Dx12, &DeviceDesc::default());

        assert!(matches!(
            result,
            Err(RhiError::BackendUnavailable {
                backend: DeviceType::Dx12,
                ..
            })
        ));
    }
}
