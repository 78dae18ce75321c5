use crate::gpu::{CommandListHandle, DescriptorHandle, Format, GpuDevice};
use crate::render::draw::DrawStage;
use crate::render::framegraph::{FrameGraphBuilder, ResourceHandle, ResourceKind, ResourceSize};

use super::{
    BASE_COLOR, FrameCommandLists, METALLIC_SPECULAR_ROUGHNESS, NORMAL, Pass, PassContext,
    PrepareContext, RegisterContext, SHADOW_MAP, SSAO_BLUR, VELOCITY, ZPRE_DEPTH, declared,
    prepared,
};

/// Render targets of the G-buffer, in attachment order.
pub(super) const TARGETS: [(&str, Format); 4] = [
    (NORMAL, Format::R10G10B10A2Unorm),
    (BASE_COLOR, Format::Rgba8UnormSrgb),
    (METALLIC_SPECULAR_ROUGHNESS, Format::Rgba8Unorm),
    (VELOCITY, Format::R16G16Float),
];

#[derive(Copy, Clone)]
struct Inputs {
    targets: [ResourceHandle; 4],
    depth: ResourceHandle,
    shadow_map: ResourceHandle,
    ao: ResourceHandle,
}

#[derive(Copy, Clone)]
struct Views {
    targets: [DescriptorHandle; 4],
    depth: DescriptorHandle,
    shadow_map: DescriptorHandle,
    ao: DescriptorHandle,
}

/// Opaque geometry into the G-buffer, depth-tested against the prepass.
pub struct GBufferPass {
    lists: FrameCommandLists,
    inputs: Option<Inputs>,
    views: Option<Views>,
}

impl GBufferPass {
    pub fn new(device: &dyn GpuDevice) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "GBuffer")?,
            inputs: None,
            views: None,
        })
    }
}

impl Pass for GBufferPass {
    fn name(&self) -> &'static str {
        "GBuffer"
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        let [normal, base_color, msr, velocity] =
            TARGETS.map(|(name, format)| builder.write(name, ResourceKind::RenderTarget, format));
        let targets = [normal?, base_color?, msr?, velocity?];

        self.inputs = Some(Inputs {
            targets,
            depth: builder.read(ZPRE_DEPTH, ResourceKind::Depth, Format::D32Float)?,
            shadow_map: builder.read(SHADOW_MAP, ResourceKind::Depth, Format::D32Float)?,
            ao: builder.read(SSAO_BLUR, ResourceKind::RenderTarget, Format::R32Float)?,
        });
        Ok(())
    }

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()> {
        for handle in declared(self.inputs, self.name())?.targets {
            ctx.register(handle, ResourceSize::Viewport)?;
        }
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let inputs = declared(self.inputs, self.name())?;
        let cmd = self.lists.begin(ctx.frame_index)?;

        let [normal, base_color, msr, velocity] = inputs.targets;
        let targets = [
            ctx.write(cmd, normal)?,
            ctx.write(cmd, base_color)?,
            ctx.write(cmd, msr)?,
            ctx.write(cmd, velocity)?,
        ];
        self.views = Some(Views {
            targets,
            depth: ctx.depth_stencil(cmd, inputs.depth)?,
            shadow_map: ctx.read(cmd, inputs.shadow_map)?,
            ao: ctx.read(cmd, inputs.ao)?,
        });
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("gbuffer");
        let views = prepared(self.views.take(), self.name())?;

        let cmd = self.lists.current(ctx.frame_index);
        for target in views.targets {
            cmd.clear_color(target, [0.0; 4]);
        }
        cmd.set_render_targets(&views.targets, Some(views.depth));
        cmd.bind_shader_resource(0, views.shadow_map);
        cmd.bind_shader_resource(1, views.ao);
        cmd.set_viewport(ctx.extent);
        ctx.draw.draw(DrawStage::GBuffer, cmd, ctx.extent)?;

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }
}
