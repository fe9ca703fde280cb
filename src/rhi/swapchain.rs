use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use serde::{Deserialize, Serialize};

use super::{
    command::{RenderCommandDevice, SyncPoint},
    error::{NativeResultExt, RhiResult},
    types::{ColorSpace, Format},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PresentMode {
    Immediate,
    Mailbox,
    #[default]
    Fifo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageState {
    Present,
    RenderTarget,
}

/// Raw handles of the window the swapchain presents to.
#[derive(Clone, Copy, Debug)]
pub struct NativeWindow {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
}

impl NativeWindow {
    pub fn new(source: &(impl HasWindowHandle + HasDisplayHandle)) -> RhiResult<Self> {
        Ok(Self {
            window: source.window_handle().native("window_handle")?.as_raw(),
            display: source.display_handle().native("display_handle")?.as_raw(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub present_mode: PresentMode,
    pub frames: usize,
}

pub trait RenderSwapchainDevice: RenderCommandDevice {
    type RenderTarget;

    fn frame_count(&self) -> usize;
    fn render_target(&self, image: usize) -> &Self::RenderTarget;

    /// Index of the image the surface hands out next.
    fn acquire_next_image(&mut self) -> RhiResult<usize>;

    fn transition_image(&mut self, list: &Self::CommandList, image: usize, state: ImageState);
    fn clear_image(&self, list: &Self::CommandList, image: usize, color: [f32; 4]);

    /// Submits the frame list to the graphics queue and signals `fence` with
    /// `value` once it retires.
    fn submit_frame(
        &mut self,
        list: &Self::CommandList,
        image: usize,
        fence: &Self::Fence,
        value: SyncPoint,
    ) -> RhiResult<()>;

    fn present(&mut self, image: usize) -> RhiResult<()>;
}

const PREFERRED_FORMATS: [Format; 4] = [
    Format::Rgba8Unorm,
    Format::Bgra8Unorm,
    Format::Rgba8Srgb,
    Format::Bgra8Srgb,
];

const PREFERRED_COLOR_SPACES: [ColorSpace; 2] = [ColorSpace::Linear, ColorSpace::SrgbNonlinear];

/// Picks the index of the best surface format out of `available`, falling
/// back to the first one. `None` only for an empty list.
pub fn choose_surface_format(available: &[(Format, ColorSpace)]) -> Option<usize> {
    PREFERRED_FORMATS
        .iter()
        .flat_map(|f| PREFERRED_COLOR_SPACES.iter().map(move |c| (*f, *c)))
        .find_map(|wanted| available.iter().position(|a| *a == wanted))
        .or_else(|| (!available.is_empty()).then_some(0))
}
