mod final_pass;
mod gbuffer;
mod shadow;
mod skybox;
mod ssao;
mod taa;
mod transparent;
mod zprepass;

use std::sync::Arc;

use anyhow::Context;

use crate::error::FrameGraphError;
use crate::gpu::{
    CommandList, CommandListHandle, DescriptorCache, DescriptorHandle, Extent2D, GpuDevice,
    TextureHandle,
};
use crate::render::draw::DrawHooks;
use crate::render::framegraph::{
    FrameGraphBuilder, FrameGraphResource, ResourceHandle, ResourceSize, ResourceTable,
};

pub use final_pass::FinalPass;
pub use gbuffer::GBufferPass;
pub use shadow::ShadowPass;
pub use skybox::SkyboxPass;
pub use ssao::{NOISE_DIM, SAMPLE_COUNT, SsaoBlurPass, SsaoPass, hemisphere_kernel, rotation_noise};
pub use taa::TaaPass;
pub use transparent::TransparentPass;
pub use zprepass::ZPrepass;

pub const SHADOW_MAP: &str = "ShadowMap";
pub const ZPRE_POSITION: &str = "ZPrePosition";
pub const ZPRE_NORMAL: &str = "ZPreNormal";
pub const ZPRE_DEPTH: &str = "ZPreDepth";
pub const SSAO: &str = "SSAO";
pub const SSAO_BLUR: &str = "SSAOBlur";
pub const NORMAL: &str = "Normal";
pub const BASE_COLOR: &str = "BaseColor";
pub const METALLIC_SPECULAR_ROUGHNESS: &str = "MetallicSpecularRoughness";
pub const VELOCITY: &str = "Velocity";
pub const TRANSPARENT: &str = "Transparent";
pub const SKY: &str = "Sky";
pub const TAA_BASE_COLOR: &str = "TAABaseColor";

/// One stage of the frame.
///
/// `setup` runs every frame and declares what the pass writes and reads.
/// The remaining per-frame hooks run only while the pass survives culling:
/// `register_resources` backs its writes with textures, `prepare` opens the
/// pass's command list and takes its views on the render thread, in
/// execution order, and `execute` finishes the recording, possibly on a
/// worker thread.
pub trait Pass: Send {
    fn name(&self) -> &'static str;

    /// Targets are never culled.
    fn is_target(&self) -> bool {
        false
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()>;

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()>;

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()>;

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>>;

    /// One-time work before the first frame, recorded into `ctx.cmd`.
    fn pre_compute(&mut self, _ctx: &mut PreComputeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once the pre-compute uploads have reached the GPU.
    fn post_pre_compute(&mut self) {}

    fn destroy(&mut self, _device: &dyn GpuDevice) {}
}

pub struct RegisterContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub cache: &'a DescriptorCache,
    pub resources: &'a mut ResourceTable,
}

impl RegisterContext<'_> {
    pub fn register(&mut self, handle: ResourceHandle, size: ResourceSize) -> anyhow::Result<()> {
        let resource = self
            .resources
            .get_mut(handle)
            .with_context(|| format!("resource {} is not in this frame graph", handle))?;
        resource.register(self.device, self.cache, size)
    }
}

pub struct PreComputeContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub cmd: &'a mut dyn CommandList,
}

/// Gives a pass its views for the frame. Every state transition a view
/// needs is recorded into the `cmd` handed in, which must be the pass's own
/// list.
pub struct PrepareContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub cache: &'a DescriptorCache,
    pub resources: &'a mut ResourceTable,
    pub frame_index: u32,
}

impl PrepareContext<'_> {
    pub fn write(
        &mut self,
        cmd: &mut dyn CommandList,
        handle: ResourceHandle,
    ) -> anyhow::Result<DescriptorHandle> {
        Ok(self.resource(handle)?.write_view(cmd)?)
    }

    pub fn read(
        &mut self,
        cmd: &mut dyn CommandList,
        handle: ResourceHandle,
    ) -> anyhow::Result<DescriptorHandle> {
        Ok(self.resource(handle)?.read_view(cmd)?)
    }

    pub fn depth_stencil(
        &mut self,
        cmd: &mut dyn CommandList,
        handle: ResourceHandle,
    ) -> anyhow::Result<DescriptorHandle> {
        Ok(self.resource(handle)?.depth_stencil_view(cmd)?)
    }

    /// Backing texture of a registered resource.
    pub fn texture(&self, handle: ResourceHandle) -> anyhow::Result<TextureHandle> {
        let resource = self
            .resources
            .get(handle)
            .with_context(|| format!("resource {} is not in this frame graph", handle))?;
        Ok(resource
            .texture()
            .ok_or_else(|| FrameGraphError::Unregistered {
                resource: resource.name().to_string(),
            })?)
    }

    pub fn resource(&mut self, handle: ResourceHandle) -> anyhow::Result<&mut FrameGraphResource> {
        self.resources
            .get_mut(handle)
            .with_context(|| format!("resource {} is not in this frame graph", handle))
    }
}

/// What a pass needs while finishing its recording. Cloned into each
/// worker task.
#[derive(Clone)]
pub struct PassContext {
    pub device: Arc<dyn GpuDevice>,
    pub draw: Arc<DrawHooks>,
    pub frame_index: u32,
    pub extent: Extent2D,
}

/// One command list per frame in flight.
pub struct FrameCommandLists {
    lists: Vec<Box<dyn CommandList>>,
}

impl FrameCommandLists {
    pub fn new(device: &dyn GpuDevice, label: &str) -> anyhow::Result<Self> {
        let lists = (0..device.frame_count().max(1))
            .map(|i| {
                device
                    .create_command_list(&format!("{label}[{i}]"))
                    .with_context(|| format!("failed to create command list for {label}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { lists })
    }

    /// Opens the list for `frame_index`, discarding what it held.
    pub fn begin(&mut self, frame_index: u32) -> anyhow::Result<&mut dyn CommandList> {
        let cmd = self.current(frame_index);
        cmd.begin()?;
        Ok(cmd)
    }

    pub fn current(&mut self, frame_index: u32) -> &mut dyn CommandList {
        let slot = frame_index as usize % self.lists.len();
        self.lists[slot].as_mut()
    }

    /// Closes the list for `frame_index` and returns it for submission.
    pub fn finish(&mut self, frame_index: u32) -> anyhow::Result<CommandListHandle> {
        let cmd = self.current(frame_index);
        cmd.end()?;
        Ok(cmd.handle())
    }
}

fn declared<T>(value: Option<T>, pass: &str) -> anyhow::Result<T> {
    value.with_context(|| format!("{pass} used a resource before its setup ran"))
}

fn prepared<T>(views: Option<T>, pass: &str) -> anyhow::Result<T> {
    views.with_context(|| format!("{pass} executed without being prepared"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    struct Pair {
        first: u32,
        second: u32,
    }

    #[test]
    fn declared_hands_back_whatever_setup_stored() {
        let pair = Pair {
            first: 1,
            second: 2,
        };
        assert_eq!(declared(Some(pair), "GBuffer").unwrap(), pair);

        let err = declared(None::<Pair>, "GBuffer").unwrap_err();
        assert_eq!(err.to_string(), "GBuffer used a resource before its setup ran");
    }

    #[test]
    fn prepared_names_the_unprepared_pass() {
        let err = prepared(None::<[u32; 4]>, "TAA").unwrap_err();
        assert_eq!(err.to_string(), "TAA executed without being prepared");
    }
}
