use crate::gpu::{CommandListHandle, DescriptorHandle, Format, GpuDevice};
use crate::render::draw::DrawStage;
use crate::render::framegraph::{FrameGraphBuilder, ResourceHandle, ResourceKind, ResourceSize};

use super::{
    FrameCommandLists, Pass, PassContext, PrepareContext, RegisterContext, ZPRE_DEPTH,
    ZPRE_NORMAL, ZPRE_POSITION, declared, prepared,
};

#[derive(Copy, Clone)]
struct Targets {
    position: ResourceHandle,
    normal: ResourceHandle,
    depth: ResourceHandle,
}

#[derive(Copy, Clone)]
struct Views {
    position: DescriptorHandle,
    normal: DescriptorHandle,
    depth: DescriptorHandle,
}

/// Lays down view-space position, normal and depth before shading.
pub struct ZPrepass {
    lists: FrameCommandLists,
    targets: Option<Targets>,
    views: Option<Views>,
}

impl ZPrepass {
    pub fn new(device: &dyn GpuDevice) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "ZPrepass")?,
            targets: None,
            views: None,
        })
    }
}

impl Pass for ZPrepass {
    fn name(&self) -> &'static str {
        "ZPrepass"
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        self.targets = Some(Targets {
            position: builder.write(ZPRE_POSITION, ResourceKind::RenderTarget, Format::Rgba32Float)?,
            normal: builder.write(ZPRE_NORMAL, ResourceKind::RenderTarget, Format::R11G11B10Float)?,
            depth: builder.write(ZPRE_DEPTH, ResourceKind::Depth, Format::D32Float)?,
        });
        Ok(())
    }

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()> {
        let targets = declared(self.targets, self.name())?;
        for handle in [targets.position, targets.normal, targets.depth] {
            ctx.register(handle, ResourceSize::Viewport)?;
        }
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let targets = declared(self.targets, self.name())?;
        let cmd = self.lists.begin(ctx.frame_index)?;
        self.views = Some(Views {
            position: ctx.write(cmd, targets.position)?,
            normal: ctx.write(cmd, targets.normal)?,
            depth: ctx.write(cmd, targets.depth)?,
        });
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("z_prepass");
        let views = prepared(self.views.take(), self.name())?;

        let cmd = self.lists.current(ctx.frame_index);
        cmd.clear_color(views.position, [0.0; 4]);
        cmd.clear_color(views.normal, [0.0; 4]);
        cmd.clear_depth(views.depth, 1.0);
        cmd.set_render_targets(&[views.position, views.normal], Some(views.depth));
        cmd.set_viewport(ctx.extent);
        ctx.draw.draw(DrawStage::ZPrepass, cmd, ctx.extent)?;

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }
}
