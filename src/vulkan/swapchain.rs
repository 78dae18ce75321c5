use anyhow::Context;
use ash::vk;

use crate::gpu::{Extent2D, Format};

use super::context::VulkanContext;
use super::adapter::QueueFamilies;
use super::texture::vk_format;

/// Format the frame graph's back buffer is declared with.
const BACK_BUFFER_FORMAT: Format = Format::Bgra8Unorm;

#[derive(Clone, Copy, Debug)]
pub struct SwapchainProperties {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: Extent2D,
    pub image_count: u32,
}

/// What a surface offers on one physical device.
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        device: vk::PhysicalDevice,
        surface: &ash::khr::surface::Instance,
        surface_khr: vk::SurfaceKHR,
    ) -> anyhow::Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface
                    .get_physical_device_surface_capabilities(device, surface_khr)
                    .context("failed to query surface capabilities")?,
                formats: surface
                    .get_physical_device_surface_formats(device, surface_khr)
                    .context("failed to query surface formats")?,
                present_modes: surface
                    .get_physical_device_surface_present_modes(device, surface_khr)
                    .context("failed to query surface present modes")?,
            })
        }
    }

    /// The back buffer must be created in exactly its declared format.
    pub fn is_adequate(&self) -> bool {
        self.back_buffer_format().is_some() && !self.present_modes.is_empty()
    }

    pub fn choose(&self, preferred: Extent2D) -> anyhow::Result<SwapchainProperties> {
        let format = self
            .back_buffer_format()
            .with_context(|| format!("surface cannot present {:?}", BACK_BUFFER_FORMAT))?;

        let present_mode = if self.present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };

        let caps = &self.capabilities;
        let extent = if caps.current_extent.width != u32::MAX {
            Extent2D::new(caps.current_extent.width, caps.current_extent.height)
        } else {
            Extent2D::new(
                preferred
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                preferred
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            )
        };

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        Ok(SwapchainProperties {
            format,
            present_mode,
            extent,
            image_count,
        })
    }

    fn back_buffer_format(&self) -> Option<vk::SurfaceFormatKHR> {
        let wanted = vk::SurfaceFormatKHR {
            format: vk_format(BACK_BUFFER_FORMAT),
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        match self.formats.as_slice() {
            [only] if only.format == vk::Format::UNDEFINED => Some(wanted),
            formats => formats
                .iter()
                .find(|f| f.format == wanted.format && f.color_space == wanted.color_space)
                .copied(),
        }
    }
}

/// Swap chain plus one render-finished semaphore per image.
pub struct Swapchain {
    pub loader: ash::khr::swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub properties: SwapchainProperties,
    pub images: Vec<vk::Image>,
    pub render_finished: Vec<vk::Semaphore>,
}

impl Swapchain {
    pub fn new(
        context: &VulkanContext,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
        device: &ash::Device,
        preferred: Extent2D,
    ) -> anyhow::Result<Self> {
        let support =
            SurfaceSupport::query(physical_device, &context.surface_instance, context.surface_khr)?;
        let properties = support.choose(preferred)?;
        log::debug!("Creating swapchain: {:?}", properties);

        let families = [queue_families.graphics, queue_families.present];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(context.surface_khr)
            .min_image_count(properties.image_count)
            .image_format(properties.format.format)
            .image_color_space(properties.format.color_space)
            .image_extent(vk::Extent2D {
                width: properties.extent.width,
                height: properties.extent.height,
            })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(properties.present_mode)
            .clipped(true);
        let create_info = if families[0] != families[1] {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let loader = ash::khr::swapchain::Device::new(&context.instance, device);
        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .context("failed to create swapchain")?
        };
        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("failed to get swapchain images");
            }
        };

        let mut render_finished = Vec::with_capacity(images.len());
        for _ in &images {
            match unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) } {
                Ok(semaphore) => render_finished.push(semaphore),
                Err(e) => {
                    unsafe {
                        for semaphore in render_finished {
                            device.destroy_semaphore(semaphore, None);
                        }
                        loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e).context("failed to create render-finished semaphore");
                }
            }
        }

        Ok(Self {
            loader,
            swapchain,
            properties,
            images,
            render_finished,
        })
    }

    /// # Safety
    /// The swap chain must be idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            for semaphore in &self.render_finished {
                device.destroy_semaphore(*semaphore, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn support(formats: Vec<vk::SurfaceFormatKHR>, current: vk::Extent2D) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: current,
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 1920,
                    height: 1080,
                },
                ..Default::default()
            },
            formats,
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    fn bgra() -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    const FREE: vk::Extent2D = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };

    #[test]
    fn extent_is_clamped_when_the_surface_leaves_it_open() {
        let props = support(vec![bgra()], FREE)
            .choose(Extent2D::new(4000, 600))
            .unwrap();
        assert_eq!(props.extent, Extent2D::new(1920, 600));
        assert_eq!(props.image_count, 3);
        assert_eq!(props.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_extent_wins_when_fixed() {
        let fixed = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let props = support(vec![bgra()], fixed)
            .choose(Extent2D::new(1280, 720))
            .unwrap();
        assert_eq!(props.extent, Extent2D::new(800, 600));
    }

    #[test]
    fn surface_without_the_back_buffer_format_is_rejected() {
        let srgb_only = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let support = support(vec![srgb_only], FREE);
        assert!(!support.is_adequate());
        assert!(support.choose(Extent2D::new(64, 64)).is_err());
    }

    #[test]
    fn undefined_surface_format_accepts_anything() {
        let any = vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let props = support(vec![any], FREE).choose(Extent2D::new(64, 64)).unwrap();
        assert_eq!(props.format, bgra());
    }
}
