pub mod draw;
pub mod framegraph;
mod renderer;
mod thread;

pub use renderer::RenderSystem;
pub use thread::{FrameStats, build_frame_graph, render_thread, run_frames};
