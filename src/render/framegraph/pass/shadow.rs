use crate::gpu::{CommandListHandle, DescriptorHandle, Extent2D, Format, GpuDevice};
use crate::render::draw::DrawStage;
use crate::render::framegraph::{FrameGraphBuilder, ResourceHandle, ResourceKind, ResourceSize};

use super::{
    FrameCommandLists, Pass, PassContext, PrepareContext, RegisterContext, SHADOW_MAP, declared,
    prepared,
};

/// Renders scene depth from the light into a square shadow map.
pub struct ShadowPass {
    lists: FrameCommandLists,
    map_size: u32,
    shadow_map: Option<ResourceHandle>,
    dsv: Option<DescriptorHandle>,
}

impl ShadowPass {
    pub fn new(device: &dyn GpuDevice, map_size: u32) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "Shadow")?,
            map_size,
            shadow_map: None,
            dsv: None,
        })
    }
}

impl Pass for ShadowPass {
    fn name(&self) -> &'static str {
        "Shadow"
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        self.shadow_map = Some(builder.write(SHADOW_MAP, ResourceKind::Depth, Format::D32Float)?);
        Ok(())
    }

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()> {
        let size = ResourceSize::Explicit {
            width: self.map_size,
            height: self.map_size,
        };
        ctx.register(declared(self.shadow_map, self.name())?, size)
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let shadow_map = declared(self.shadow_map, self.name())?;
        let cmd = self.lists.begin(ctx.frame_index)?;
        self.dsv = Some(ctx.write(cmd, shadow_map)?);
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("shadow");
        let dsv = prepared(self.dsv.take(), self.name())?;
        let extent = Extent2D::new(self.map_size, self.map_size);

        let cmd = self.lists.current(ctx.frame_index);
        cmd.clear_depth(dsv, 1.0);
        cmd.set_render_targets(&[], Some(dsv));
        cmd.set_viewport(extent);
        ctx.draw.draw(DrawStage::Shadow, cmd, extent)?;

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }
}
