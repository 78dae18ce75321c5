use anyhow::Context;

use crate::gpu::{
    CommandListHandle, DescriptorHandle, Format, GpuDevice, ResourceState, TextureDesc,
    TextureHandle, TextureUsage,
};
use crate::render::framegraph::{FrameGraphBuilder, ResourceHandle, ResourceKind, ResourceSize};

use super::{
    BASE_COLOR, FrameCommandLists, Pass, PassContext, PreComputeContext, PrepareContext,
    RegisterContext, TAA_BASE_COLOR, VELOCITY, ZPRE_DEPTH, declared, prepared,
};

const OUTPUT_FORMAT: Format = Format::Rgba8UnormSrgb;

#[derive(Copy, Clone)]
struct Inputs {
    output: ResourceHandle,
    base_color: ResourceHandle,
    velocity: ResourceHandle,
    depth: ResourceHandle,
}

#[derive(Copy, Clone)]
struct Views {
    output: DescriptorHandle,
    output_texture: TextureHandle,
    base_color: DescriptorHandle,
    velocity: DescriptorHandle,
    depth: DescriptorHandle,
    history: DescriptorHandle,
}

/// Temporal anti-aliasing. Resolves the current frame against a history
/// texture, then copies the result into the history for the next frame.
pub struct TaaPass {
    lists: FrameCommandLists,
    inputs: Option<Inputs>,
    history: Option<TextureHandle>,
    views: Option<Views>,
}

impl TaaPass {
    pub fn new(device: &dyn GpuDevice) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "TAA")?,
            inputs: None,
            history: None,
            views: None,
        })
    }
}

impl Pass for TaaPass {
    fn name(&self) -> &'static str {
        "TAA"
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        self.inputs = Some(Inputs {
            output: builder.write(TAA_BASE_COLOR, ResourceKind::RenderTarget, OUTPUT_FORMAT)?,
            base_color: builder.read(BASE_COLOR, ResourceKind::RenderTarget, Format::Rgba8UnormSrgb)?,
            velocity: builder.read(VELOCITY, ResourceKind::RenderTarget, Format::R16G16Float)?,
            depth: builder.read(ZPRE_DEPTH, ResourceKind::Depth, Format::D32Float)?,
        });
        Ok(())
    }

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()> {
        let inputs = declared(self.inputs, self.name())?;
        ctx.register(inputs.output, ResourceSize::Viewport)
    }

    fn pre_compute(&mut self, ctx: &mut PreComputeContext) -> anyhow::Result<()> {
        let desc = TextureDesc {
            label: "TAA history".to_string(),
            extent: ctx.device.extent(),
            format: OUTPUT_FORMAT,
            usage: TextureUsage::Sampled,
            initial_state: ResourceState::ShaderRead,
        };
        self.history = Some(
            ctx.device
                .create_texture(&desc)
                .context("failed to create TAA history")?,
        );
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let inputs = declared(self.inputs, self.name())?;
        let history = self.history.context("TAA history was never created")?;

        let cmd = self.lists.begin(ctx.frame_index)?;
        self.views = Some(Views {
            output: ctx.write(cmd, inputs.output)?,
            output_texture: ctx.texture(inputs.output)?,
            base_color: ctx.read(cmd, inputs.base_color)?,
            velocity: ctx.read(cmd, inputs.velocity)?,
            depth: ctx.read(cmd, inputs.depth)?,
            history: ctx.cache.append_srv(ctx.device, history, OUTPUT_FORMAT)?,
        });
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("taa");
        let views = prepared(self.views.take(), self.name())?;
        let history = self.history.context("TAA history was never created")?;

        let cmd = self.lists.current(ctx.frame_index);
        cmd.set_render_targets(&[views.output], None);
        cmd.bind_shader_resource(0, views.base_color);
        cmd.bind_shader_resource(1, views.velocity);
        cmd.bind_shader_resource(2, views.depth);
        cmd.bind_shader_resource(3, views.history);
        cmd.set_viewport(ctx.extent);
        cmd.draw(3, 1);

        // Output returns to RenderTarget, where the graph still tracks it.
        let output = views.output_texture;
        cmd.barrier(output, ResourceState::RenderTarget, ResourceState::CopySource);
        cmd.barrier(history, ResourceState::ShaderRead, ResourceState::CopyDest);
        cmd.copy_texture(output, history);
        cmd.barrier(history, ResourceState::CopyDest, ResourceState::ShaderRead);
        cmd.barrier(output, ResourceState::CopySource, ResourceState::RenderTarget);

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }

    fn destroy(&mut self, device: &dyn GpuDevice) {
        if let Some(history) = self.history.take() {
            device.destroy_texture(history);
        }
    }
}
