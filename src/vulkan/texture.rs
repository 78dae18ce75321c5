use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use ash::vk;
use vk_mem::Alloc;

use crate::gpu::{Extent2D, Format, ResourceState, TextureDesc, TextureUsage};

pub fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R16G16Float => vk::Format::R16G16_SFLOAT,
        Format::R11G11B10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
        Format::R10G10B10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
    }
}

pub fn aspect_mask(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn usage_flags(usage: TextureUsage) -> vk::ImageUsageFlags {
    let common = vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST;
    match usage {
        TextureUsage::RenderTarget => common | vk::ImageUsageFlags::COLOR_ATTACHMENT,
        TextureUsage::DepthStencil => common | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        TextureUsage::Sampled => common,
    }
}

pub struct VulkanTexture {
    pub image: vk::Image,
    /// `None` for swap-chain images, which the swap chain owns.
    allocation: Option<vk_mem::Allocation>,
    pub label: String,
    pub format: Format,
    /// Format the image was created with.
    pub native_format: vk::Format,
    pub extent: Extent2D,
    pub initial_state: ResourceState,
    /// Set until the first command touches the image; its contents start
    /// out undefined.
    fresh: AtomicBool,
}

impl VulkanTexture {
    pub fn allocate(allocator: &vk_mem::Allocator, desc: &TextureDesc) -> anyhow::Result<Self> {
        let ici = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format(desc.format))
            .mip_levels(1)
            .array_layers(1)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage_flags(desc.usage))
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let aci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, allocation) = unsafe { allocator.create_image(&ici, &aci) }
            .with_context(|| format!("failed to allocate image '{}'", desc.label))?;

        Ok(Self {
            image,
            allocation: Some(allocation),
            label: desc.label.clone(),
            format: desc.format,
            native_format: vk_format(desc.format),
            extent: desc.extent,
            initial_state: desc.initial_state,
            fresh: AtomicBool::new(true),
        })
    }

    pub fn swapchain_image(
        image: vk::Image,
        index: usize,
        native_format: vk::Format,
        extent: Extent2D,
    ) -> Self {
        Self {
            image,
            allocation: None,
            label: format!("swapchain[{index}]"),
            format: Format::Bgra8Unorm,
            native_format,
            extent,
            initial_state: ResourceState::Present,
            fresh: AtomicBool::new(true),
        }
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        aspect_mask(self.format)
    }

    /// Returns true exactly once, for the first command to use the image.
    pub fn take_fresh(&self) -> bool {
        self.fresh.swap(false, Ordering::AcqRel)
    }

    /// # Safety
    /// The image must be idle on the GPU and have no live views.
    pub unsafe fn destroy(&mut self, allocator: &vk_mem::Allocator) {
        if let Some(mut allocation) = self.allocation.take() {
            log::trace!("Destroying image '{}'", self.label);
            unsafe {
                allocator.destroy_image(self.image, &mut allocation);
            }
        }
    }
}

pub fn create_view(
    device: &ash::Device,
    texture: &VulkanTexture,
    format: Format,
) -> anyhow::Result<vk::ImageView> {
    // Depth and swap-chain images are viewed through their own format
    // whatever the caller asked for.
    let (format, aspect) = if texture.format.is_depth() {
        (texture.native_format, vk::ImageAspectFlags::DEPTH)
    } else if texture.allocation.is_none() {
        (texture.native_format, vk::ImageAspectFlags::COLOR)
    } else {
        (vk_format(format), vk::ImageAspectFlags::COLOR)
    };

    let create_info = vk::ImageViewCreateInfo::default()
        .image(texture.image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(super::layouts::subresource_range(aspect));

    unsafe {
        device
            .create_image_view(&create_info, None)
            .with_context(|| format!("failed to create view of '{}'", texture.label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_get_depth_aspect() {
        assert_eq!(aspect_mask(Format::D32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(Format::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask(Format::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn render_targets_can_be_copied_and_sampled() {
        let flags = usage_flags(TextureUsage::RenderTarget);
        assert!(flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(flags.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(flags.contains(vk::ImageUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn packed_float_maps_to_vulkan_order() {
        assert_eq!(
            vk_format(Format::R11G11B10Float),
            vk::Format::B10G11R11_UFLOAT_PACK32
        );
    }
}
