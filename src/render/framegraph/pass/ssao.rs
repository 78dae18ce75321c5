use anyhow::Context;
use glam::{Vec3, Vec4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::gpu::{
    CommandList, CommandListHandle, DescriptorHandle, Extent2D, Format, GpuDevice, ResourceState,
    TextureDesc, TextureHandle, TextureUsage,
};
use crate::render::framegraph::{FrameGraphBuilder, ResourceHandle, ResourceKind, ResourceSize};

use super::{
    FrameCommandLists, Pass, PassContext, PreComputeContext, PrepareContext, RegisterContext,
    SSAO, SSAO_BLUR, ZPRE_NORMAL, ZPRE_POSITION, declared, prepared,
};

pub const SAMPLE_COUNT: usize = 64;
pub const NOISE_DIM: u32 = 4;

/// Sample offsets in the +Z hemisphere, packed as `xyz0`. Later samples lie
/// further from the origin so occlusion favours nearby geometry.
pub fn hemisphere_kernel(rng: &mut impl Rng) -> Vec<Vec4> {
    (0..SAMPLE_COUNT)
        .map(|i| {
            let sample = Vec3::new(
                rng.r#gen::<f32>() * 2.0 - 1.0,
                rng.r#gen::<f32>() * 2.0 - 1.0,
                rng.r#gen::<f32>(),
            )
            .normalize_or(Vec3::Z);
            let t = i as f32 / SAMPLE_COUNT as f32;
            let scale = 0.1 + t * t * (1.0 - 0.1);
            (sample * rng.r#gen::<f32>() * scale).extend(0.0)
        })
        .collect()
}

/// Random rotations around +Z, tiled over the screen.
pub fn rotation_noise(rng: &mut impl Rng) -> Vec<Vec4> {
    (0..NOISE_DIM * NOISE_DIM)
        .map(|_| {
            Vec4::new(
                rng.r#gen::<f32>() * 2.0 - 1.0,
                rng.r#gen::<f32>() * 2.0 - 1.0,
                0.0,
                0.0,
            )
        })
        .collect()
}

fn upload_table(
    ctx: &mut PreComputeContext,
    label: &str,
    extent: Extent2D,
    texels: &[Vec4],
) -> anyhow::Result<TextureHandle> {
    let desc = TextureDesc {
        label: label.to_string(),
        extent,
        format: Format::Rgba32Float,
        usage: TextureUsage::Sampled,
        initial_state: ResourceState::CopyDest,
    };
    let texture = ctx
        .device
        .create_texture(&desc)
        .with_context(|| format!("failed to create {label}"))?;
    ctx.cmd
        .upload(texture, bytemuck::cast_slice(texels))
        .with_context(|| format!("failed to upload {label}"))?;
    ctx.cmd
        .barrier(texture, ResourceState::CopyDest, ResourceState::ShaderRead);
    Ok(texture)
}

#[derive(Copy, Clone)]
struct Views {
    ao: DescriptorHandle,
    position: DescriptorHandle,
    normal: DescriptorHandle,
    kernel: DescriptorHandle,
    noise: DescriptorHandle,
}

/// Screen-space ambient occlusion from the Z-prepass position and normal.
pub struct SsaoPass {
    lists: FrameCommandLists,
    seed: u64,

    ao: Option<ResourceHandle>,
    position: Option<ResourceHandle>,
    normal: Option<ResourceHandle>,

    kernel_texture: Option<TextureHandle>,
    noise_texture: Option<TextureHandle>,
    /// Set once the pre-compute submission has completed on the GPU.
    tables_ready: bool,

    views: Option<Views>,
}

impl SsaoPass {
    pub fn new(device: &dyn GpuDevice, seed: u64) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "SSAO")?,
            seed,
            ao: None,
            position: None,
            normal: None,
            kernel_texture: None,
            noise_texture: None,
            tables_ready: false,
            views: None,
        })
    }

    /// Whether the kernel and noise uploads have landed and may be sampled.
    pub fn tables_ready(&self) -> bool {
        self.tables_ready
    }
}

impl Pass for SsaoPass {
    fn name(&self) -> &'static str {
        "SSAO"
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        self.ao = Some(builder.write(SSAO, ResourceKind::RenderTarget, Format::R32Float)?);
        self.position =
            Some(builder.read(ZPRE_POSITION, ResourceKind::RenderTarget, Format::Rgba32Float)?);
        self.normal =
            Some(builder.read(ZPRE_NORMAL, ResourceKind::RenderTarget, Format::R11G11B10Float)?);
        Ok(())
    }

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()> {
        ctx.register(declared(self.ao, self.name())?, ResourceSize::Viewport)
    }

    fn pre_compute(&mut self, ctx: &mut PreComputeContext) -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let kernel = hemisphere_kernel(&mut rng);
        let noise = rotation_noise(&mut rng);

        self.kernel_texture = Some(upload_table(
            ctx,
            "SSAO kernel",
            Extent2D::new(SAMPLE_COUNT as u32, 1),
            &kernel,
        )?);
        self.noise_texture = Some(upload_table(
            ctx,
            "SSAO noise",
            Extent2D::new(NOISE_DIM, NOISE_DIM),
            &noise,
        )?);
        Ok(())
    }

    fn post_pre_compute(&mut self) {
        self.tables_ready = self.kernel_texture.is_some() && self.noise_texture.is_some();
        log::trace!("SSAO tables ready: {}", self.tables_ready);
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let name = self.name();
        anyhow::ensure!(
            self.tables_ready,
            "SSAO tables sampled before their upload completed"
        );
        let kernel = self
            .kernel_texture
            .context("SSAO kernel was never uploaded")?;
        let noise = self
            .noise_texture
            .context("SSAO noise was never uploaded")?;
        let ao = declared(self.ao, name)?;
        let position = declared(self.position, name)?;
        let normal = declared(self.normal, name)?;

        let cmd: &mut dyn CommandList = self.lists.begin(ctx.frame_index)?;
        self.views = Some(Views {
            ao: ctx.write(cmd, ao)?,
            position: ctx.read(cmd, position)?,
            normal: ctx.read(cmd, normal)?,
            kernel: ctx.cache.append_srv(ctx.device, kernel, Format::Rgba32Float)?,
            noise: ctx.cache.append_srv(ctx.device, noise, Format::Rgba32Float)?,
        });
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("ssao");
        let views = prepared(self.views.take(), self.name())?;

        let cmd = self.lists.current(ctx.frame_index);
        cmd.clear_color(views.ao, [1.0; 4]);
        cmd.set_render_targets(&[views.ao], None);
        cmd.bind_shader_resource(0, views.position);
        cmd.bind_shader_resource(1, views.normal);
        cmd.bind_shader_resource(2, views.kernel);
        cmd.bind_shader_resource(3, views.noise);
        cmd.set_viewport(ctx.extent);
        cmd.draw(3, 1);

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }

    fn destroy(&mut self, device: &dyn GpuDevice) {
        for texture in [self.kernel_texture.take(), self.noise_texture.take()]
            .into_iter()
            .flatten()
        {
            device.destroy_texture(texture);
        }
        self.tables_ready = false;
    }
}

/// Separable blur over the raw occlusion term.
pub struct SsaoBlurPass {
    lists: FrameCommandLists,
    blurred: Option<ResourceHandle>,
    ao: Option<ResourceHandle>,
    views: Option<(DescriptorHandle, DescriptorHandle)>,
}

impl SsaoBlurPass {
    pub fn new(device: &dyn GpuDevice) -> anyhow::Result<Self> {
        Ok(Self {
            lists: FrameCommandLists::new(device, "SSAOBlur")?,
            blurred: None,
            ao: None,
            views: None,
        })
    }
}

impl Pass for SsaoBlurPass {
    fn name(&self) -> &'static str {
        "SSAOBlur"
    }

    fn setup(&mut self, builder: &mut FrameGraphBuilder) -> anyhow::Result<()> {
        self.ao = Some(builder.read(SSAO, ResourceKind::RenderTarget, Format::R32Float)?);
        self.blurred = Some(builder.write(SSAO_BLUR, ResourceKind::RenderTarget, Format::R32Float)?);
        Ok(())
    }

    fn register_resources(&mut self, ctx: &mut RegisterContext) -> anyhow::Result<()> {
        ctx.register(declared(self.blurred, self.name())?, ResourceSize::Viewport)
    }

    fn prepare(&mut self, ctx: &mut PrepareContext) -> anyhow::Result<()> {
        let blurred = declared(self.blurred, self.name())?;
        let ao = declared(self.ao, self.name())?;
        let cmd = self.lists.begin(ctx.frame_index)?;
        self.views = Some((ctx.write(cmd, blurred)?, ctx.read(cmd, ao)?));
        Ok(())
    }

    fn execute(&mut self, ctx: &PassContext) -> anyhow::Result<Option<CommandListHandle>> {
        crate::profile_scope!("ssao_blur");
        let (target, ao) = prepared(self.views.take(), self.name())?;

        let cmd = self.lists.current(ctx.frame_index);
        cmd.set_render_targets(&[target], None);
        cmd.bind_shader_resource(0, ao);
        cmd.set_viewport(ctx.extent);
        cmd.draw(3, 1);

        Ok(Some(self.lists.finish(ctx.frame_index)?))
    }
}
