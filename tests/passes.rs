use std::sync::Arc;

use rstest::{fixture, rstest};

use weft::config::RendererConfig;
use weft::gpu::{
    Command, CommandListHandle, DescriptorCache, Extent2D, GpuDevice, HeadlessDevice,
    ResourceState, TextureHandle,
};
use weft::render::RenderSystem;
use weft::render::draw::{DrawHooks, DrawStage};
use weft::render::framegraph::pass::{
    BASE_COLOR, NOISE_DIM, SAMPLE_COUNT, SHADOW_MAP, SKY, SsaoPass, TAA_BASE_COLOR, TRANSPARENT,
    ZPRE_DEPTH,
};
use weft::FrameGraphError;
use weft::render::framegraph::{FrameGraph, GraphState, Pass, PreComputeContext};
use weft::render::{build_frame_graph, run_frames};
use weft::messages::EngineControl;

const EXTENT: Extent2D = Extent2D::new(64, 32);

struct Renderer {
    device: Arc<HeadlessDevice>,
    graph: FrameGraph,
    renderer: RenderSystem,
    cache: DescriptorCache,
}

impl Renderer {
    fn frame(&mut self) {
        self.device.begin_frame().unwrap();
        self.graph.render_frame(&self.cache, &self.renderer).unwrap();
    }

    /// The submitted list recorded under `label` in the latest frame.
    fn list(&self, label: &str) -> CommandListHandle {
        self.device
            .submissions()
            .into_iter()
            .rev()
            .find(|&h| self.device.list_label(h).as_deref() == Some(label))
            .unwrap_or_else(|| panic!("{label} was not submitted"))
    }

    fn texture(&self, resource: &str) -> TextureHandle {
        self.graph
            .resources()
            .by_name(resource)
            .and_then(|r| r.texture())
            .unwrap_or_else(|| panic!("{resource} has no texture"))
    }

    fn transitions(&self, label: &str, texture: TextureHandle) -> Vec<(ResourceState, ResourceState)> {
        self.device
            .barriers(self.list(label))
            .into_iter()
            .filter(|(t, _, _)| *t == texture)
            .map(|(_, before, after)| (before, after))
            .collect()
    }
}

fn config() -> RendererConfig {
    RendererConfig {
        frames_in_flight: 2,
        width: EXTENT.width,
        height: EXTENT.height,
        worker_threads: 2,
        shadow_map_size: 256,
        max_frames: Some(1),
        ..RendererConfig::default()
    }
}

#[fixture]
fn renderer() -> Renderer {
    let _ = env_logger::builder().is_test(true).try_init();

    let device = Arc::new(HeadlessDevice::new(2, EXTENT));
    let draw = DrawHooks::default().with(DrawStage::GBuffer, |ctx| {
        ctx.cmd.draw(36, 4);
        Ok(())
    });
    let mut graph = build_frame_graph(device.clone(), &config(), Arc::new(draw)).unwrap();
    let renderer = RenderSystem::new(device.clone());
    graph.pre_compute(&renderer).unwrap();

    Renderer {
        renderer,
        graph,
        cache: DescriptorCache::new(),
        device,
    }
}

#[rstest]
fn transparent_and_sky_are_culled(mut renderer: Renderer) {
    renderer.frame();

    assert_eq!(
        renderer.graph.execution_order(),
        vec!["Shadow", "ZPrepass", "SSAO", "SSAOBlur", "GBuffer", "TAA", "Final"]
    );
    assert_eq!(renderer.graph.culled_passes(), vec!["GBufferTransparent", "Skybox"]);

    let resources = renderer.graph.resources();
    assert!(!resources.by_name(TRANSPARENT).unwrap().is_registered());
    assert!(!resources.by_name(SKY).unwrap().is_registered());
}

#[rstest]
fn one_list_per_live_pass_in_order(mut renderer: Renderer) {
    renderer.device.clear_submissions();
    renderer.frame();

    assert_eq!(
        renderer.device.submitted_labels(),
        vec!["Shadow[0]", "ZPrepass[0]", "SSAO[0]", "SSAOBlur[0]", "GBuffer[0]", "TAA[0]", "Final[0]"]
    );
    assert_eq!(renderer.device.presents(), 1);
}

#[rstest]
fn live_resources_and_pass_textures_are_allocated(mut renderer: Renderer) {
    renderer.frame();

    // Eleven graph resources, the SSAO tables, the TAA history and the back buffer.
    assert_eq!(renderer.device.texture_count(), 15);

    let shadow = renderer.device.texture_desc(renderer.texture(SHADOW_MAP)).unwrap();
    assert_eq!(shadow.extent, Extent2D::new(256, 256));
    let base_color = renderer.device.texture_desc(renderer.texture(BASE_COLOR)).unwrap();
    assert_eq!(base_color.extent, EXTENT);

    renderer.frame();
    assert_eq!(renderer.device.texture_count(), 15);
}

#[rstest]
fn prepass_depth_is_held_for_early_z_then_sampled(mut renderer: Renderer) {
    renderer.frame();
    let depth = renderer.texture(ZPRE_DEPTH);

    assert_eq!(
        renderer.transitions("ZPrepass[0]", depth),
        vec![(ResourceState::ShaderRead, ResourceState::DepthWrite)]
    );
    assert_eq!(
        renderer.transitions("GBuffer[0]", depth),
        vec![(ResourceState::DepthWrite, ResourceState::DepthRead)]
    );
    assert_eq!(
        renderer.transitions("TAA[0]", depth),
        vec![(ResourceState::DepthRead, ResourceState::ShaderRead)]
    );

    // Next frame starts where this one left off.
    renderer.frame();
    assert_eq!(
        renderer.transitions("ZPrepass[1]", depth),
        vec![(ResourceState::ShaderRead, ResourceState::DepthWrite)]
    );
}

#[rstest]
fn gbuffer_runs_scene_hooks(mut renderer: Renderer) {
    renderer.frame();
    let commands = renderer.device.commands(renderer.list("GBuffer[0]"));
    assert!(commands.contains(&Command::Draw {
        vertex_count: 36,
        instance_count: 4
    }));
}

#[rstest]
fn taa_copies_its_output_into_history(mut renderer: Renderer) {
    renderer.frame();
    let output = renderer.texture(TAA_BASE_COLOR);

    let commands = renderer.device.commands(renderer.list("TAA[0]"));
    let copy = commands
        .iter()
        .position(|c| matches!(c, Command::Copy { src, .. } if *src == output))
        .expect("TAA records a history copy");
    let history = match &commands[copy] {
        Command::Copy { dst, .. } => *dst,
        _ => unreachable!(),
    };

    assert_eq!(
        &commands[copy - 2..copy],
        &[
            Command::Barrier {
                texture: output,
                before: ResourceState::RenderTarget,
                after: ResourceState::CopySource
            },
            Command::Barrier {
                texture: history,
                before: ResourceState::ShaderRead,
                after: ResourceState::CopyDest
            },
        ]
    );
    assert_eq!(
        &commands[copy + 1..],
        &[
            Command::Barrier {
                texture: history,
                before: ResourceState::CopyDest,
                after: ResourceState::ShaderRead
            },
            Command::Barrier {
                texture: output,
                before: ResourceState::CopySource,
                after: ResourceState::RenderTarget
            },
        ]
    );
    // Final sampled the output after the copy.
    assert_eq!(
        renderer.graph.resources().by_name(TAA_BASE_COLOR).unwrap().gpu_state(),
        ResourceState::ShaderRead
    );
}

#[rstest]
fn final_pass_returns_the_back_buffer_for_present(mut renderer: Renderer) {
    renderer.frame();
    let back_buffer = renderer.device.back_buffer();

    assert_eq!(
        renderer.transitions("Final[0]", back_buffer),
        vec![
            (ResourceState::Present, ResourceState::RenderTarget),
            (ResourceState::RenderTarget, ResourceState::Present),
        ]
    );
}

#[rstest]
fn repeated_pre_compute_leaks_nothing(mut renderer: Renderer) {
    let before = renderer.device.texture_count();
    let err = renderer.graph.pre_compute(&renderer.renderer).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FrameGraphError>(),
        Some(FrameGraphError::InvalidState { operation: "pre_compute", .. })
    ));
    assert_eq!(renderer.device.texture_count(), before);
    assert!(renderer.graph.add_pass("Skybox").is_err());

    renderer.frame();
    renderer.graph.destroy();
    assert_eq!(renderer.graph.state(), GraphState::Destroyed);
    // Only the back buffer is left.
    assert_eq!(renderer.device.texture_count(), 1);
}

#[rstest]
fn ssao_tables_are_uploaded_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = HeadlessDevice::new(2, EXTENT);
    let mut pass = SsaoPass::new(&device, 7).unwrap();
    let mut cmd = device.create_command_list("SSAO:pre_compute").unwrap();

    cmd.begin().unwrap();
    pass.pre_compute(&mut PreComputeContext {
        device: &device,
        cmd: cmd.as_mut(),
    })
    .unwrap();
    cmd.end().unwrap();
    assert!(!pass.tables_ready());

    let uploads: Vec<usize> = device
        .commands(cmd.handle())
        .into_iter()
        .filter_map(|c| match c {
            Command::Upload { bytes, .. } => Some(bytes),
            _ => None,
        })
        .collect();
    assert_eq!(uploads, vec![SAMPLE_COUNT * 16, (NOISE_DIM * NOISE_DIM) as usize * 16]);

    pass.post_pre_compute();
    assert!(pass.tables_ready());

    pass.destroy(&device);
    assert!(!pass.tables_ready());
    assert_eq!(device.texture_count(), 1);
}

#[rstest]
fn ssao_refuses_tables_that_were_never_uploaded() {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(HeadlessDevice::new(2, EXTENT));
    let mut graph =
        build_frame_graph(device.clone(), &config(), Arc::new(DrawHooks::default())).unwrap();
    let renderer = RenderSystem::new(device.clone());

    device.begin_frame().unwrap();
    let err = graph
        .render_frame(&DescriptorCache::new(), &renderer)
        .unwrap_err();
    assert!(
        format!("{err:#}").contains("SSAO tables sampled before their upload completed"),
        "{err:#}"
    );
    graph.destroy();
}

#[rstest]
fn headless_run_reports_the_frame(#[values(false, true)] parallel: bool) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(HeadlessDevice::new(2, EXTENT));
    let config = RendererConfig {
        parallel_execute: parallel,
        parallel_pre_compute: parallel,
        max_frames: Some(4),
        ..config()
    };

    let stats = run_frames(
        device.clone(),
        &config,
        Arc::new(DrawHooks::default()),
        &EngineControl::new(),
    )
    .unwrap();

    assert_eq!(stats.frames, 4);
    assert_eq!(stats.execution_order.len(), 7);
    assert_eq!(device.presents(), 4);
    // Pre-compute lists plus seven per frame.
    assert_eq!(device.submissions().len(), 9 + 4 * 7);
    assert_eq!(device.texture_count(), 1);
}
