use std::ffi::CString;

use ash::vk;

/// Labels Vulkan objects for validation messages and capture tools. Does
/// nothing unless validation is on.
#[derive(Clone)]
pub struct DebugNamer {
    loader: Option<ash::ext::debug_utils::Device>,
}

impl DebugNamer {
    pub fn new(instance: &ash::Instance, device: &ash::Device, enabled: bool) -> Self {
        Self {
            loader: enabled.then(|| ash::ext::debug_utils::Device::new(instance, device)),
        }
    }

    /// Naming is best effort. A failure only costs the label.
    pub fn name<T: vk::Handle>(&self, handle: T, label: &str) {
        let Some(loader) = &self.loader else {
            return;
        };
        let Ok(label) = CString::new(label.replace('\0', "?")) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&label);
        if let Err(e) = unsafe { loader.set_debug_utils_object_name(&info) } {
            log::debug!("failed to name {:?}: {e}", label);
        }
    }
}
