use crate::gpu::{CommandListHandle, DescriptorHandle, Format, GpuDevice};
use crate::render::draw::DrawStage;
use crate::render::framegraph::{FrameGraphBuilder, ResourceHandle, ResourceKind, ResourceSize};

use super::{
    BASE_COLOR, FrameCommandLists, Pass, PassContext, PrepareContext, RegisterContext, SKY,
    ZPRE_DEPTH, declared, prepared,
};

#[derive(Copy, Clone)]
struct Views {
    sky: DescriptorHandle,
    base_color: DescriptorHandle,
    depth: DescriptorHandle,
}

/// Fills the background wherever the prepass left the far plane.
pub struct SkyboxPass {
    lists: FrameCommandLists,
    sky: Option<ResourceHandle>,
    base_color: Option<ResourceHandle>,
    depth: Option<ResourceHandle>,
    views: Option<Views>,
}

impl SkyboxPass {
    pub fn new(device: &dyn GpuDevice) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "Skybox")?,
            sky: None,
            base_color: None,
            depth: None,
            views: None,
        })
    }
}

impl Pass for SkyboxPass {
    fn name(&self) -> &'static str {
        "Skybox"
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        self.base_color =
            Some(builder.read(BASE_COLOR, ResourceKind::RenderTarget, Format::Rgba8UnormSrgb)?);
        self.depth = Some(builder.read(ZPRE_DEPTH, ResourceKind::Depth, Format::D32Float)?);
        self.sky = Some(builder.write(SKY, ResourceKind::RenderTarget, Format::Rgba8Unorm)?);
        Ok(())
    }

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()> {
        ctx.register(declared(self.sky, self.name())?, ResourceSize::Viewport)
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let sky = declared(self.sky, self.name())?;
        let base_color = declared(self.base_color, self.name())?;
        let depth = declared(self.depth, self.name())?;

        let cmd = self.lists.begin(ctx.frame_index)?;
        self.views = Some(Views {
            sky: ctx.write(cmd, sky)?,
            base_color: ctx.read(cmd, base_color)?,
            depth: ctx.depth_stencil(cmd, depth)?,
        });
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("skybox");
        let views = prepared(self.views.take(), self.name())?;

        let cmd = self.lists.current(ctx.frame_index);
        cmd.set_render_targets(&[views.sky], Some(views.depth));
        cmd.bind_shader_resource(0, views.base_color);
        cmd.set_viewport(ctx.extent);
        ctx.draw.draw(DrawStage::Skybox, cmd, ctx.extent)?;

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }
}
