//! Vulkan 1.3 implementation of the [`crate::gpu`] device contracts.

mod adapter;
mod backend;
mod command;
mod context;
mod frame;
mod layouts;
mod naming;
mod swapchain;
mod texture;
mod validation;

pub use backend::VulkanDevice;
pub use command::VulkanCommandList;
pub use context::VulkanContext;
pub use layouts::ImageState;
pub use swapchain::{SurfaceSupport, SwapchainProperties};
