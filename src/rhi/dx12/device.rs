use oxidx::dx::{self, ICommandQueue, IDescriptorHeap, IDevice, IGraphicsCommandList, PSO_NONE};
use raw_window_handle::RawWindowHandle;
use smallvec::SmallVec;
use tracing::info;

use crate::rhi::{
    backend::{DebugFlags, DeviceType, RenderBackend},
    command::{QueueClass, RenderCommandDevice, SyncPoint},
    error::{NativeResultExt, RhiError, RhiResult},
    loader::LibraryRef,
    swapchain::{NativeWindow, SwapchainDesc},
};

use super::{
    backend::{AdapterInfo, DebugLayer, DxFactory},
    command::{DxCommandList, DxFence},
    conv::map_queue_class,
    swapchain::DxSwapchain,
};

#[derive(Debug)]
pub struct DxDevice {
    pub(super) swapchain: DxSwapchain,
    _rtv_heap: DescriptorHeap,
    queues: [dx::CommandQueue; 3],

    gpu: dx::Device,
    info: AdapterInfo,
    _factory: dx::Factory4,
    _adapter: dx::Adapter3,
    _debug: Option<LibraryRef<DebugLayer>>,
}

impl DxDevice {
    pub fn new(
        window: &NativeWindow,
        desc: SwapchainDesc,
        debug_flags: DebugFlags,
    ) -> RhiResult<Self> {
        let RawWindowHandle::Win32(handle) = window.window else {
            return Err(RhiError::BackendUnavailable {
                backend: DeviceType::Dx12,
                reason: "window is not a Win32 window".into(),
            });
        };

        let factory = DxFactory::new(debug_flags)?;

        let (adapter, info) = factory
            .adapters()
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::BackendUnavailable {
                backend: DeviceType::Dx12,
                reason: "no adapter supports feature level 11.0".into(),
            })?;

        info!("Creating device with adapter {} and id {}", info.name, info.id);

        let gpu = dx::create_device(Some(&adapter), dx::FeatureLevel::Level11)
            .native("D3D12CreateDevice")?;

        let create_queue = |class| {
            gpu.create_command_queue(&dx::CommandQueueDesc::new(map_queue_class(class)))
                .native("ID3D12Device::CreateCommandQueue")
        };
        let queues = [
            create_queue(QueueClass::Graphics)?,
            create_queue(QueueClass::Copy)?,
            create_queue(QueueClass::Compute)?,
        ];

        let mut rtv_heap = DescriptorHeap::new(&gpu, dx::DescriptorHeapType::Rtv, desc.frames)?;
        let swapchain = DxSwapchain::new(
            &factory.factory,
            &gpu,
            &queues[QueueClass::Graphics.index()],
            &mut rtv_heap,
            handle.hwnd,
            desc,
        )?;

        Ok(Self {
            swapchain,
            _rtv_heap: rtv_heap,
            queues,
            gpu,
            info,
            _factory: factory.factory,
            _adapter: adapter,
            _debug: factory.debug,
        })
    }

    pub fn raw(&self) -> &dx::Device {
        &self.gpu
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    pub fn queue(&self, class: QueueClass) -> &dx::CommandQueue {
        &self.queues[class.index()]
    }
}

impl RenderBackend for DxDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Dx12
    }
}

impl RenderCommandDevice for DxDevice {
    type Fence = DxFence;
    type CommandList = DxCommandList;

    fn create_fence(&self, class: QueueClass) -> RhiResult<Self::Fence> {
        let fence = self
            .gpu
            .create_fence(0, dx::FenceFlags::empty())
            .native("ID3D12Device::CreateFence")?;
        let event = dx::Event::create(false, false).native("CreateEvent")?;

        Ok(DxFence {
            class,
            fence,
            event,
        })
    }

    fn create_command_list(&self, class: QueueClass) -> RhiResult<Self::CommandList> {
        let ty = map_queue_class(class);

        let allocator = self
            .gpu
            .create_command_allocator(ty)
            .native("ID3D12Device::CreateCommandAllocator")?;
        let list = self
            .gpu
            .create_command_list(0, ty, &allocator, PSO_NONE)
            .native("ID3D12Device::CreateCommandList")?;
        list.close().native("ID3D12GraphicsCommandList::Close")?;

        Ok(DxCommandList {
            class,
            allocator,
            list,
        })
    }

    fn execute(&self, class: QueueClass, lists: &[&Self::CommandList]) -> RhiResult<()> {
        let lists = lists
            .iter()
            .map(|l| Some(l.list.clone()))
            .collect::<SmallVec<[_; 8]>>();

        self.queues[class.index()].execute_command_lists(&lists);

        Ok(())
    }

    fn signal(&self, class: QueueClass, fence: &Self::Fence, value: SyncPoint) -> RhiResult<()> {
        self.queues[class.index()]
            .signal(&fence.fence, value)
            .native("ID3D12CommandQueue::Signal")
    }
}

/// Non shader-visible heap for the swapchain render-target views.
#[derive(Debug)]
pub(super) struct DescriptorHeap {
    allocator: range_alloc::RangeAllocator<usize>,
    heap: dx::DescriptorHeap,
    inc_size: usize,
}

impl DescriptorHeap {
    fn new(device: &dx::Device, ty: dx::DescriptorHeapType, size: usize) -> RhiResult<Self> {
        let inc_size = device.get_descriptor_handle_increment_size(ty);

        let heap = device
            .create_descriptor_heap(&dx::DescriptorHeapDesc::new(ty, size))
            .native("ID3D12Device::CreateDescriptorHeap")?;

        Ok(Self {
            allocator: range_alloc::RangeAllocator::new(0..size),
            heap,
            inc_size,
        })
    }

    pub(super) fn allocate(&mut self) -> RhiResult<dx::CpuDescriptorHandle> {
        let allocation = self
            .allocator
            .allocate_range(1)
            .map_err(|_| RhiError::native("DescriptorHeap::allocate", "descriptor heap is full"))?;

        Ok(self
            .heap
            .get_cpu_descriptor_handle_for_heap_start()
            .advance(allocation.start, self.inc_size))
    }
}
