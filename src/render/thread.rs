use std::sync::Arc;

use anyhow::Context;
#[cfg(feature = "tracing")]
use tracy_client::frame_mark;

use crate::concurrency::WorkerPool;
use crate::config::RendererConfig;
use crate::gpu::{DescriptorCache, GpuDevice};
use crate::messages::EngineControl;
use crate::render::RenderSystem;
use crate::render::draw::DrawHooks;
use crate::render::framegraph::{FrameGraph, PassRegistry};

/// What a finished frame loop looked like.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameStats {
    pub frames: u64,
    pub execution_order: Vec<String>,
    pub culled: Vec<String>,
}

/// Builds the configured frame graph on `device`.
pub fn build_frame_graph(
    device: Arc<dyn GpuDevice>,
    config: &RendererConfig,
    draw: Arc<DrawHooks>,
) -> anyhow::Result<FrameGraph> {
    let pool = WorkerPool::new(config.worker_count()).context("failed to start worker pool")?;
    log::debug!("Started {} frame graph workers", pool.size());

    let mut graph = FrameGraph::new(device, PassRegistry::with_defaults())
        .with_pool(Arc::new(pool))
        .with_draw_hooks(draw)
        .with_settings(config.pass_settings())
        .with_parallelism(config.parallel_execute, config.parallel_pre_compute);

    for name in &config.passes {
        graph.add_pass(name)?;
    }
    Ok(graph)
}

/// Pre-computes, then renders until `control` stops or `max_frames` is hit.
/// Resources are released whether or not the loop succeeded.
pub fn run_frames(
    device: Arc<dyn GpuDevice>,
    config: &RendererConfig,
    draw: Arc<DrawHooks>,
    control: &EngineControl,
) -> anyhow::Result<FrameStats> {
    let mut graph = build_frame_graph(device.clone(), config, draw)?;
    let renderer = RenderSystem::new(device.clone());
    let cache = DescriptorCache::new();

    let result = frame_loop(&mut graph, &renderer, &cache, device.as_ref(), config, control);

    let idle = device
        .wait_for_gpu()
        .context("failed to wait for the GPU before teardown");
    graph.destroy();

    let stats = result?;
    idle?;
    Ok(stats)
}

fn frame_loop(
    graph: &mut FrameGraph,
    renderer: &RenderSystem,
    cache: &DescriptorCache,
    device: &dyn GpuDevice,
    config: &RendererConfig,
    control: &EngineControl,
) -> anyhow::Result<FrameStats> {
    graph
        .pre_compute(renderer)
        .context("frame graph pre-compute failed")?;

    let mut stats = FrameStats::default();
    while control.is_running() && config.max_frames.is_none_or(|max| stats.frames < max) {
        device.begin_frame().context("failed to begin frame")?;
        graph
            .render_frame(cache, renderer)
            .with_context(|| format!("frame {} failed", stats.frames))?;
        stats.frames += 1;

        #[cfg(feature = "tracing")]
        frame_mark();
    }

    stats.execution_order = graph
        .execution_order()
        .into_iter()
        .map(String::from)
        .collect();
    stats.culled = graph.culled_passes().into_iter().map(String::from).collect();
    log::info!("Rendered {} frames", stats.frames);
    Ok(stats)
}

/// Body of the engine's render thread.
pub fn render_thread(
    device: Arc<dyn GpuDevice>,
    config: RendererConfig,
    control: Arc<EngineControl>,
) -> anyhow::Result<FrameStats> {
    let stats = run_frames(device, &config, Arc::new(DrawHooks::default()), &control)?;
    log::debug!("Render thread finished: {:?}", stats);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Extent2D, HeadlessDevice};

    fn config(frames: u64) -> RendererConfig {
        RendererConfig {
            frames_in_flight: 2,
            width: 64,
            height: 32,
            worker_threads: 2,
            max_frames: Some(frames),
            ..RendererConfig::default()
        }
    }

    #[test]
    fn stops_after_max_frames() {
        let device = Arc::new(HeadlessDevice::new(2, Extent2D::new(64, 32)));
        let stats = run_frames(
            device.clone(),
            &config(3),
            Arc::new(DrawHooks::default()),
            &EngineControl::new(),
        )
        .unwrap();

        assert_eq!(stats.frames, 3);
        assert_eq!(device.presents(), 3);
        assert_eq!(stats.culled, vec!["GBufferTransparent", "Skybox"]);
        // Back buffer only once everything is released.
        assert_eq!(device.texture_count(), 1);
    }

    #[test]
    fn stopped_engine_renders_nothing() {
        let device = Arc::new(HeadlessDevice::new(2, Extent2D::new(64, 32)));
        let control = EngineControl::new();
        control.request_stop();

        let stats = run_frames(device.clone(), &config(5), Arc::new(DrawHooks::default()), &control)
            .unwrap();
        assert_eq!(stats.frames, 0);
        assert_eq!(device.presents(), 0);
    }
}
