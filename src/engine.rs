use std::sync::Arc;
use std::thread;

use anyhow::Context;
use winit::window::Window;

use crate::config::RendererConfig;
use crate::gpu::GpuDevice;
use crate::messages::EngineControl;
use crate::render::{FrameStats, render_thread};
use crate::vulkan::{VulkanContext, VulkanDevice};

/// One window's renderer: the Vulkan instance plus the thread driving the
/// frame graph on it.
pub struct Engine {
    control: Arc<EngineControl>,
    render: Option<thread::JoinHandle<anyhow::Result<FrameStats>>>,
    // Dropped after the render thread has released the device.
    _context: Arc<VulkanContext>,
}

impl Engine {
    pub fn new(window: &Window, config: RendererConfig) -> anyhow::Result<Self> {
        let context = Arc::new(
            VulkanContext::new(window, config.validation)
                .context("failed to create Vulkan context")?,
        );
        let device: Arc<dyn GpuDevice> = Arc::new(
            VulkanDevice::new(context.clone(), config.frames_in_flight, config.extent())
                .context("failed to create Vulkan device")?,
        );

        let control = Arc::new(EngineControl::new());
        let render = thread::Builder::new()
            .name("render".to_owned())
            .spawn({
                let control = control.clone();
                move || render_thread(device, config, control)
            })
            .context("failed to spawn render thread")?;

        Ok(Self {
            control,
            render: Some(render),
            _context: context,
        })
    }

    pub fn is_rendering(&self) -> bool {
        self.render.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the render thread and hands back how its run ended. A second
    /// call is a no-op returning `Ok(None)`.
    pub fn shutdown(&mut self) -> anyhow::Result<Option<FrameStats>> {
        let Some(handle) = self.render.take() else {
            return Ok(None);
        };
        self.control.request_stop();
        let stats = handle
            .join()
            .map_err(|_| anyhow::anyhow!("render thread panicked"))?
            .context("render thread failed")?;
        log::info!(
            "Engine stopped after {} frames ({})",
            stats.frames,
            stats.execution_order.join(" -> ")
        );
        Ok(Some(stats))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("{e:#}");
        }
    }
}
