use anyhow::Context;
use ash::{ext::debug_utils, vk};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use super::validation::{self, ValidationMessenger};

/// Instance-level Vulkan state: the instance, the window surface and the
/// optional validation messenger. Outlives every device created from it.
pub struct VulkanContext {
    pub(super) surface_instance: ash::khr::surface::Instance,
    pub(super) surface_khr: vk::SurfaceKHR,
    validation: Option<ValidationMessenger>,
    pub(super) instance: ash::Instance,
}

impl VulkanContext {
    pub fn new(window: &Window, validate: bool) -> anyhow::Result<Self> {
        let entry = ash::Entry::linked();
        let display_handle = window
            .display_handle()
            .context("failed to acquire display handle")?;
        let window_handle = window
            .window_handle()
            .context("failed to acquire window handle")?;

        let validate = validate && {
            let available = validation::layer_available(&entry);
            if !available {
                log::warn!("Validation requested but the layer is not installed");
            }
            available
        };
        let instance = create_instance(&entry, display_handle.as_raw(), validate)?;

        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);
        let surface_khr = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .context("failed to create surface")?;

        let validation = validate
            .then(|| ValidationMessenger::new(&entry, &instance))
            .flatten();
        log::debug!("Created Vulkan context (validation: {})", validation.is_some());

        Ok(Self {
            surface_instance,
            surface_khr,
            validation,
            instance,
        })
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation.is_some()
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Some(messenger) = &self.validation {
                messenger.destroy();
            }
            self.surface_instance.destroy_surface(self.surface_khr, None);
            self.instance.destroy_instance(None);
        }
        log::trace!("Vulkan context destroyed");
    }
}

fn create_instance(
    entry: &ash::Entry,
    display_handle: raw_window_handle::RawDisplayHandle,
    validate: bool,
) -> anyhow::Result<ash::Instance> {
    let version = vk::make_api_version(0, 0, 1, 0);
    let app_info = vk::ApplicationInfo::default()
        .api_version(vk::API_VERSION_1_3)
        .application_name(c"weft")
        .application_version(version)
        .engine_name(c"weft")
        .engine_version(version);

    let mut extension_names = ash_window::enumerate_required_extensions(display_handle)
        .context("failed to enumerate required extensions")?
        .to_vec();
    if validate {
        extension_names.push(debug_utils::NAME.as_ptr());
    }

    let layer_names = validation::layer_names();

    let create_flags = if cfg!(any(target_os = "macos", target_os = "ios")) {
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::default()
    };
    let mut messenger_info = validation::messenger_info();
    let mut instance_create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .flags(create_flags);
    if validate {
        instance_create_info = instance_create_info
            .enabled_layer_names(&layer_names)
            .push_next(&mut messenger_info);
    }

    unsafe {
        entry
            .create_instance(&instance_create_info, None)
            .context("failed to create Vulkan instance")
    }
}
