use std::num::NonZero;

use oxidx::dx::{self, IDevice, IFactory4, IGraphicsCommandList, ISwapchain1, ISwapchain3};
use smallvec::SmallVec;
use tracing::info;

use crate::rhi::{
    command::{QueueClass, RenderCommandDevice, SyncPoint},
    error::{NativeResultExt, RhiError, RhiResult},
    swapchain::{ImageState, RenderSwapchainDevice, SwapchainDesc},
};

use super::{
    command::{DxCommandList, DxFence},
    conv::{map_image_state, map_present_mode},
    device::{DescriptorHeap, DxDevice},
};

#[derive(Debug)]
pub struct DxSwapchain {
    raw: dx::Swapchain3,
    _hwnd: NonZero<isize>,
    views: SmallVec<[DxRenderTarget; 3]>,
    desc: SwapchainDesc,
}

/// Back buffer and its render-target view.
#[derive(Debug)]
pub struct DxRenderTarget {
    pub raw: dx::Resource,
    pub cpu: dx::CpuDescriptorHandle,
    state: ImageState,
}

impl DxSwapchain {
    pub(super) fn new(
        factory: &dx::Factory4,
        gpu: &dx::Device,
        queue: &dx::CommandQueue,
        rtv_heap: &mut DescriptorHeap,
        hwnd: NonZero<isize>,
        desc: SwapchainDesc,
    ) -> RhiResult<Self> {
        let raw_desc = dx::SwapchainDesc1::new(desc.width, desc.height)
            .with_format(dx::Format::Rgba8Unorm)
            .with_usage(dx::FrameBufferUsage::RenderTargetOutput)
            .with_buffer_count(desc.frames)
            .with_scaling(dx::Scaling::None)
            .with_swap_effect(dx::SwapEffect::FlipDiscard)
            .with_flags(dx::SwapchainFlags::AllowTearing);

        let swapchain = factory
            .create_swapchain_for_hwnd(queue, hwnd, &raw_desc, None, dx::OUTPUT_NONE)
            .native("IDXGIFactory2::CreateSwapChainForHwnd")?;
        let raw: dx::Swapchain3 = swapchain
            .try_into()
            .native("IDXGISwapChain3 cast")?;

        let views = (0..desc.frames)
            .map(|i| {
                let res: dx::Resource = raw.get_buffer(i).native("IDXGISwapChain::GetBuffer")?;
                let cpu = rtv_heap.allocate()?;
                gpu.create_render_target_view(Some(&res), None, cpu);

                Ok(DxRenderTarget {
                    raw: res,
                    cpu,
                    state: ImageState::Present,
                })
            })
            .collect::<RhiResult<SmallVec<_>>>()?;

        info!(
            "Created swapchain {}x{} with {} buffers ({:?})",
            desc.width, desc.height, desc.frames, desc.present_mode
        );

        Ok(Self {
            raw,
            _hwnd: hwnd,
            views,
            desc,
        })
    }
}

impl RenderSwapchainDevice for DxDevice {
    type RenderTarget = DxRenderTarget;

    fn frame_count(&self) -> usize {
        self.swapchain.views.len()
    }

    fn render_target(&self, image: usize) -> &Self::RenderTarget {
        &self.swapchain.views[image]
    }

    fn acquire_next_image(&mut self) -> RhiResult<usize> {
        Ok(self.swapchain.raw.get_current_back_buffer_index() as usize)
    }

    fn transition_image(&mut self, list: &DxCommandList, image: usize, state: ImageState) {
        let target = &mut self.swapchain.views[image];
        let old_state = std::mem::replace(&mut target.state, state);

        if old_state != state {
            list.list.resource_barrier(&[dx::ResourceBarrier::transition(
                &target.raw,
                map_image_state(old_state),
                map_image_state(state),
                None,
            )]);
        }
    }

    fn clear_image(&self, list: &DxCommandList, image: usize, color: [f32; 4]) {
        list.list
            .clear_render_target_view(self.swapchain.views[image].cpu, color, &[]);
    }

    fn submit_frame(
        &mut self,
        list: &DxCommandList,
        _image: usize,
        fence: &DxFence,
        value: SyncPoint,
    ) -> RhiResult<()> {
        self.execute(QueueClass::Graphics, &[list])?;
        self.signal(QueueClass::Graphics, fence, value)
    }

    fn present(&mut self, _image: usize) -> RhiResult<()> {
        let (interval, flags) = map_present_mode(self.swapchain.desc.present_mode);

        self.swapchain
            .raw
            .present(interval, flags)
            .map_err(|err| RhiError::PresentFailed {
                reason: format!("{err:?}"),
            })
    }
}
