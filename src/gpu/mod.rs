//! Backend-neutral device contracts consumed by the frame graph.

mod descriptor;
mod headless;

use std::any::Any;
use std::fmt;

use slotmap::new_key_type;

pub use descriptor::{
    CBV_SRV_UAV_CAPACITY, DSV_CAPACITY, DescriptorCache, DescriptorHandle, DescriptorHeap,
    RTV_CAPACITY,
};
pub use headless::{Command, HeadlessDevice};

new_key_type! { pub struct TextureHandle; }
new_key_type! { pub struct CommandListHandle; }

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Extent2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Format {
    R32Float,
    R16G16Float,
    R11G11B10Float,
    R10G10B10A2Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba32Float,
    D32Float,
    D24UnormS8Uint,
    Bgra8Unorm,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint)
    }

    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::Rgba32Float => 16,
            Format::R16G16Float
            | Format::R32Float
            | Format::R11G11B10Float
            | Format::R10G10B10A2Unorm
            | Format::Rgba8Unorm
            | Format::Rgba8UnormSrgb
            | Format::D32Float
            | Format::D24UnormS8Uint
            | Format::Bgra8Unorm => 4,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TextureUsage {
    RenderTarget,
    DepthStencil,
    /// Sampled only, filled through [`CommandList::upload`] or a copy.
    Sampled,
}

/// GPU access state of a texture. Barriers move a texture between these.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ResourceState {
    ShaderRead,
    RenderTarget,
    DepthWrite,
    DepthRead,
    CopySource,
    CopyDest,
    Present,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub extent: Extent2D,
    pub format: Format,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
}

/// Device, queue and swap-chain provider.
///
/// Every method takes `&self`; implementations synchronise internally so
/// passes running on worker threads can share one device.
pub trait GpuDevice: Send + Sync {
    /// Number of frames in flight.
    fn frame_count(&self) -> u32;

    /// Cycles through `0..frame_count()`, advanced by [`GpuDevice::present`].
    fn frame_index(&self) -> u32;

    fn extent(&self) -> Extent2D;

    /// Waits until the current frame slot is free and acquires a back buffer.
    fn begin_frame(&self) -> anyhow::Result<()>;

    fn create_texture(&self, desc: &TextureDesc) -> anyhow::Result<TextureHandle>;

    fn destroy_texture(&self, texture: TextureHandle);

    /// Writes a view of `texture` into the descriptor slot `descriptor`.
    fn create_view(
        &self,
        texture: TextureHandle,
        descriptor: DescriptorHandle,
        format: Format,
    ) -> anyhow::Result<()>;

    /// The swap-chain image acquired by the last [`GpuDevice::begin_frame`].
    fn back_buffer(&self) -> TextureHandle;

    fn create_command_list(&self, label: &str) -> anyhow::Result<Box<dyn CommandList>>;

    /// Resets the transient command memory of the current frame slot.
    fn reset_command_allocator(&self) -> anyhow::Result<()>;

    fn execute_command_lists(&self, lists: &[CommandListHandle]) -> anyhow::Result<()>;

    fn present(&self) -> anyhow::Result<()>;

    fn wait_for_gpu(&self) -> anyhow::Result<()>;
}

/// A command list owned by exactly one pass. Lists are recorded on whichever
/// worker runs the pass and submitted later by handle.
pub trait CommandList: Send {
    fn handle(&self) -> CommandListHandle;

    fn label(&self) -> &str;

    fn begin(&mut self) -> anyhow::Result<()>;

    fn end(&mut self) -> anyhow::Result<()>;

    fn barrier(&mut self, texture: TextureHandle, before: ResourceState, after: ResourceState);

    /// Notes that `texture` is already in `state` for the rest of this list.
    /// Called instead of [`CommandList::barrier`] when no transition is needed.
    fn assume_state(&mut self, _texture: TextureHandle, _state: ResourceState) {}

    fn clear_color(&mut self, view: DescriptorHandle, color: [f32; 4]);

    fn clear_depth(&mut self, view: DescriptorHandle, depth: f32);

    fn set_render_targets(&mut self, colors: &[DescriptorHandle], depth: Option<DescriptorHandle>);

    fn bind_shader_resource(&mut self, slot: u32, view: DescriptorHandle);

    fn set_viewport(&mut self, extent: Extent2D);

    fn draw(&mut self, vertex_count: u32, instance_count: u32);

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle);

    /// Copies `data` into `texture`, which must be in [`ResourceState::CopyDest`].
    fn upload(&mut self, texture: TextureHandle, data: &[u8]) -> anyhow::Result<()>;

    /// Backend escape hatch for draw hooks that bind their own pipelines.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
