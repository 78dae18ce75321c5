use anyhow::Context;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

use crate::config::RendererConfig;
use crate::engine::Engine;

#[derive(Default)]
pub enum AppState {
    #[default]
    Running,
    FatalError(anyhow::Error),
}

/// Window shell around an [`Engine`]. The window closes when the user asks
/// or when the render thread ends on its own.
pub struct App {
    config: RendererConfig,
    window: Option<Window>,
    engine: Option<Engine>,
    pub app_state: AppState,
}

impl App {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            window: None,
            engine: None,
            app_state: AppState::Running,
        }
    }

    fn open(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let attributes = Window::default_attributes()
            .with_title("weft")
            .with_resizable(false)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = event_loop
            .create_window(attributes)
            .context("failed to create window")?;
        let engine = Engine::new(&window, self.config.clone()).context("failed to create engine")?;
        self.window = Some(window);
        self.engine = Some(engine);
        Ok(())
    }

    fn close(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(Err(e)) = self.engine.take().map(|mut engine| engine.shutdown()) {
            self.app_state = AppState::FatalError(e);
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.open(event_loop) {
            self.app_state = AppState::FatalError(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::debug!("Close requested");
                self.close(event_loop);
            }
            WindowEvent::RedrawRequested => {
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => (),
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.engine.as_ref().is_some_and(|e| !e.is_rendering()) {
            log::debug!("Render thread finished, closing window");
            self.close(event_loop);
        }
    }
}
