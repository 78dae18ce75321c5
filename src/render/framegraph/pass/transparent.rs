use crate::gpu::{CommandListHandle, DescriptorHandle, Format, GpuDevice};
use crate::render::draw::DrawStage;
use crate::render::framegraph::{FrameGraphBuilder, ResourceHandle, ResourceKind, ResourceSize};

use super::gbuffer::TARGETS;
use super::{
    FrameCommandLists, Pass, PassContext, PrepareContext, RegisterContext, TRANSPARENT,
    ZPRE_DEPTH, declared, prepared,
};

#[derive(Copy, Clone)]
struct Inputs {
    output: ResourceHandle,
    gbuffer: [ResourceHandle; 4],
    depth: ResourceHandle,
}

#[derive(Copy, Clone)]
struct Views {
    output: DescriptorHandle,
    gbuffer: [DescriptorHandle; 4],
    depth: DescriptorHandle,
}

/// Blended geometry over the lit G-buffer. Nothing downstream reads its
/// output in the default graph, so it is normally culled.
pub struct TransparentPass {
    lists: FrameCommandLists,
    inputs: Option<Inputs>,
    views: Option<Views>,
}

impl TransparentPass {
    pub fn new(device: &dyn GpuDevice) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "GBufferTransparent")?,
            inputs: None,
            views: None,
        })
    }
}

impl Pass for TransparentPass {
    fn name(&self) -> &'static str {
        "GBufferTransparent"
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        let output = builder.write(TRANSPARENT, ResourceKind::RenderTarget, Format::Rgba8Unorm)?;
        let [normal, base_color, msr, velocity] =
            TARGETS.map(|(name, format)| builder.read(name, ResourceKind::RenderTarget, format));

        self.inputs = Some(Inputs {
            output,
            gbuffer: [normal?, base_color?, msr?, velocity?],
            depth: builder.read(ZPRE_DEPTH, ResourceKind::Depth, Format::D32Float)?,
        });
        Ok(())
    }

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()> {
        let inputs = declared(self.inputs, self.name())?;
        ctx.register(inputs.output, ResourceSize::Viewport)
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let inputs = declared(self.inputs, self.name())?;
        let cmd = self.lists.begin(ctx.frame_index)?;

        let [normal, base_color, msr, velocity] = inputs.gbuffer;
        self.views = Some(Views {
            output: ctx.write(cmd, inputs.output)?,
            gbuffer: [
                ctx.read(cmd, normal)?,
                ctx.read(cmd, base_color)?,
                ctx.read(cmd, msr)?,
                ctx.read(cmd, velocity)?,
            ],
            depth: ctx.depth_stencil(cmd, inputs.depth)?,
        });
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("gbuffer_transparent");
        let views = prepared(self.views.take(), self.name())?;

        let cmd = self.lists.current(ctx.frame_index);
        cmd.clear_color(views.output, [0.0; 4]);
        cmd.set_render_targets(&[views.output], Some(views.depth));
        for (slot, view) in views.gbuffer.into_iter().enumerate() {
            cmd.bind_shader_resource(slot as u32, view);
        }
        cmd.set_viewport(ctx.extent);
        ctx.draw.draw(DrawStage::Transparent, cmd, ctx.extent)?;

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }
}
