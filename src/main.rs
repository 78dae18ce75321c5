use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use winit::event_loop::{ControlFlow, EventLoop};

use weft::app::{App, AppState};
use weft::config::RendererConfig;
use weft::gpu::HeadlessDevice;
use weft::messages::EngineControl;
use weft::render::draw::DrawHooks;
use weft::render::run_frames;

/// Frame-graph renderer.
#[derive(Parser, Debug)]
#[command(name = "weft", version)]
struct Args {
    /// Renderer config file.
    #[arg(long, default_value = "weft.toml")]
    config: PathBuf,

    /// Run on the recording device without opening a window.
    #[arg(long)]
    headless: bool,

    /// Stop after this many frames. Overrides `max_frames` in the config.
    #[arg(long)]
    frames: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    log4rs::init_file("log4rs.yml", Default::default())
        .context("failed to load logging config file")?;

    #[cfg(feature = "tracing")]
    tracy_client::Client::start();

    let args = Args::parse();
    let mut config = RendererConfig::load(&args.config)?;
    if args.frames.is_some() {
        config.max_frames = args.frames;
    }

    if args.headless {
        return run_headless(config);
    }

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut application = App::new(config);
    event_loop
        .run_app(&mut application)
        .context("failed to run application")?;

    if let AppState::FatalError(e) = &application.app_state {
        log::error!("{:?}", e);
    }

    Ok(())
}

fn run_headless(mut config: RendererConfig) -> anyhow::Result<()> {
    if config.max_frames.is_none() {
        log::info!("No frame limit for a headless run, rendering a single frame");
        config.max_frames = Some(1);
    }
    let device = Arc::new(HeadlessDevice::new(config.frames_in_flight, config.extent()));
    let stats = run_frames(
        device.clone(),
        &config,
        Arc::new(DrawHooks::default()),
        &EngineControl::new(),
    )?;

    log::info!("Execution order: {}", stats.execution_order.join(" -> "));
    if !stats.culled.is_empty() {
        log::info!("Culled: {}", stats.culled.join(", "));
    }
    log::info!(
        "{} frames, {} presents, {} command lists submitted",
        stats.frames,
        device.presents(),
        device.submissions().len()
    );
    Ok(())
}
