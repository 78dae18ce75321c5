/// Opens a Tracy zone for the rest of the enclosing block.
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! profile_scope {
    ($name:literal) => {
        let _profile_span = tracy_client::span!($name);
    };
}

#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! profile_scope {
    ($name:literal) => {};
}

pub mod app;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod messages;
pub mod render;
pub mod vulkan;

pub use error::FrameGraphError;
