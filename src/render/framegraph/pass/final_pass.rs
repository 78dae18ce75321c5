use crate::gpu::{CommandListHandle, DescriptorHandle, Format, GpuDevice, ResourceState, TextureHandle};
use crate::render::framegraph::{FrameGraphBuilder, ResourceHandle, ResourceKind};

use super::{
    FrameCommandLists, Pass, PassContext, PrepareContext, RegisterContext, TAA_BASE_COLOR,
    declared, prepared,
};

const CLEAR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

#[derive(Copy, Clone)]
struct Views {
    back_buffer: TextureHandle,
    rtv: DescriptorHandle,
    color: DescriptorHandle,
}

/// Resolves the anti-aliased image onto the swapchain back buffer. This is
/// the graph's target; everything live is live because of it.
pub struct FinalPass {
    lists: FrameCommandLists,
    color: Option<ResourceHandle>,
    views: Option<Views>,
}

impl FinalPass {
    pub fn new(device: &dyn GpuDevice) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "Final")?,
            color: None,
            views: None,
        })
    }
}

impl Pass for FinalPass {
    fn name(&self) -> &'static str {
        "Final"
    }

    fn is_target(&self) -> bool {
        true
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        self.color =
            Some(builder.read(TAA_BASE_COLOR, ResourceKind::RenderTarget, Format::Rgba8UnormSrgb)?);
        Ok(())
    }

    fn register_resources(&mut self, _ctx: &mut RegisterContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let color = declared(self.color, self.name())?;
        let back_buffer = ctx.device.back_buffer();

        let cmd = self.lists.begin(ctx.frame_index)?;
        self.views = Some(Views {
            back_buffer,
            rtv: ctx
                .cache
                .append_rtv(ctx.device, back_buffer, Format::Bgra8Unorm)?,
            color: ctx.read(cmd, color)?,
        });
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("final");
        let views = prepared(self.views.take(), self.name())?;

        let cmd = self.lists.current(ctx.frame_index);
        cmd.barrier(views.back_buffer, ResourceState::Present, ResourceState::RenderTarget);
        cmd.clear_color(views.rtv, CLEAR);
        cmd.set_render_targets(&[views.rtv], None);
        cmd.bind_shader_resource(0, views.color);
        cmd.set_viewport(ctx.extent);
        cmd.draw(3, 1);
        cmd.barrier(views.back_buffer, ResourceState::RenderTarget, ResourceState::Present);

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }
}
