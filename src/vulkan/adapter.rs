use std::ffi::CStr;

use anyhow::Context;
use ash::vk;

use super::context::VulkanContext;
use super::swapchain::SurfaceSupport;

const DEVICE_EXTENSIONS: [&CStr; 1] = [ash::khr::swapchain::NAME];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    fn distinct(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.present];
        families.dedup();
        families
    }
}

/// A physical device that can drive the frame graph on the context's surface.
pub struct Adapter {
    pub physical: vk::PhysicalDevice,
    pub families: QueueFamilies,
}

pub struct LogicalDevice {
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl Adapter {
    /// Picks the highest ranked suitable device. Discrete GPUs rank above integrated ones.
    pub fn select(context: &VulkanContext) -> anyhow::Result<Self> {
        let devices = unsafe {
            context
                .instance
                .enumerate_physical_devices()
                .context("failed to enumerate physical devices")?
        };

        let (adapter, name) = devices
            .into_iter()
            .filter_map(|physical| {
                let props = unsafe { context.instance.get_physical_device_properties(physical) };
                let name = props
                    .device_name_as_c_str()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown".to_owned());
                match Self::suitability(context, physical, &props) {
                    Ok(families) => Some((rank(props.device_type), Self { physical, families }, name)),
                    Err(reason) => {
                        log::debug!("Skipping {}: {}", name, reason);
                        None
                    }
                }
            })
            .max_by_key(|(rank, _, _)| *rank)
            .map(|(_, adapter, name)| (adapter, name))
            .context("no Vulkan 1.3 device with graphics and present support")?;

        log::info!("Selected physical device: {} ({:?})", name, adapter.families);
        Ok(adapter)
    }

    fn suitability(
        context: &VulkanContext,
        physical: vk::PhysicalDevice,
        props: &vk::PhysicalDeviceProperties,
    ) -> Result<QueueFamilies, String> {
        if props.api_version < vk::API_VERSION_1_3 {
            return Err("Vulkan 1.3 not supported".to_owned());
        }
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features13);
        unsafe { context.instance.get_physical_device_features2(physical, &mut features) };
        if features13.dynamic_rendering != vk::TRUE || features13.synchronization2 != vk::TRUE {
            return Err("dynamic rendering or synchronization2 missing".to_owned());
        }

        let available = unsafe { context.instance.enumerate_device_extension_properties(physical) }
            .map_err(|e| format!("cannot enumerate extensions: {e}"))?;
        if let Some(missing) = DEVICE_EXTENSIONS.iter().find(|required| {
            !available
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(**required))
        }) {
            return Err(format!("missing extension {}", missing.to_string_lossy()));
        }

        let support =
            SurfaceSupport::query(physical, &context.surface_instance, context.surface_khr)
                .map_err(|e| e.to_string())?;
        if !support.is_adequate() {
            return Err("surface cannot present the back buffer format".to_owned());
        }

        find_families(context, physical).ok_or_else(|| "no graphics or present queue".to_owned())
    }

    pub fn open(&self, instance: &ash::Instance) -> anyhow::Result<LogicalDevice> {
        let priorities = [1.0f32];
        let queue_infos = self
            .families
            .distinct()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect::<Vec<_>>();
        let extensions = DEVICE_EXTENSIONS.map(CStr::as_ptr);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features13);

        let device = unsafe {
            instance
                .create_device(self.physical, &create_info, None)
                .context("failed to create logical device")?
        };
        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(self.families.graphics, 0),
                device.get_device_queue(self.families.present, 0),
            )
        };
        log::trace!("Created logical device");

        Ok(LogicalDevice {
            device,
            graphics_queue,
            present_queue,
        })
    }
}

fn rank(device_type: vk::PhysicalDeviceType) -> u8 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

/// Prefers one family that does both graphics and present.
fn find_families(context: &VulkanContext, physical: vk::PhysicalDevice) -> Option<QueueFamilies> {
    let families =
        unsafe { context.instance.get_physical_device_queue_family_properties(physical) };
    let presents = |index: u32| {
        unsafe {
            context.surface_instance.get_physical_device_surface_support(
                physical,
                index,
                context.surface_khr,
            )
        }
        .unwrap_or_else(|e| {
            log::warn!("failed to query present support for queue family {index}: {e}");
            false
        })
    };

    let usable = families
        .iter()
        .enumerate()
        .filter(|(_, family)| family.queue_count > 0)
        .map(|(index, family)| (index as u32, family.queue_flags));
    let graphics: Vec<u32> = usable
        .clone()
        .filter(|(_, flags)| flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(index, _)| index)
        .collect();

    if let Some(&both) = graphics.iter().find(|&&index| presents(index)) {
        return Some(QueueFamilies {
            graphics: both,
            present: both,
        });
    }
    let present = usable.map(|(index, _)| index).find(|&index| presents(index))?;
    Some(QueueFamilies {
        graphics: *graphics.first()?,
        present,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_outranks_integrated() {
        assert!(rank(vk::PhysicalDeviceType::DISCRETE_GPU) > rank(vk::PhysicalDeviceType::INTEGRATED_GPU));
        assert!(rank(vk::PhysicalDeviceType::INTEGRATED_GPU) > rank(vk::PhysicalDeviceType::CPU));
    }

    #[test]
    fn shared_family_is_created_once() {
        let shared = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        assert_eq!(shared.distinct(), vec![0]);
        let split = QueueFamilies {
            graphics: 0,
            present: 2,
        };
        assert_eq!(split.distinct(), vec![0, 2]);
    }
}
