use std::ffi::{CStr, c_char, c_void};

use ash::{ext::debug_utils, vk};

const LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn on_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    let data = unsafe { &*data };
    let id = unsafe { data.message_id_name_as_c_str() }
        .map(CStr::to_string_lossy)
        .unwrap_or_default();
    let message = unsafe { data.message_as_c_str() }
        .map(CStr::to_string_lossy)
        .unwrap_or_default();

    let level = match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::Level::Info,
        _ => log::Level::Debug,
    };
    log::log!(target: "weft::vulkan::validation", level, "[{:?}] {}: {}", kind, id, message);
    vk::FALSE
}

/// Messenger settings shared by instance creation and the long-lived messenger.
pub fn messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(on_message))
}

/// Whether the Khronos validation layer is installed. A missing layer turns
/// validation off instead of failing startup.
pub fn layer_available(entry: &ash::Entry) -> bool {
    match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str() == Ok(LAYER)),
        Err(e) => {
            log::warn!("failed to enumerate instance layers: {e}");
            false
        }
    }
}

pub fn layer_names() -> [*const c_char; 1] {
    [LAYER.as_ptr()]
}

pub struct ValidationMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl ValidationMessenger {
    pub fn new(entry: &ash::Entry, instance: &ash::Instance) -> Option<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        match unsafe { loader.create_debug_utils_messenger(&messenger_info(), None) } {
            Ok(messenger) => Some(Self { loader, messenger }),
            Err(e) => {
                log::warn!("failed to create validation messenger: {e}");
                None
            }
        }
    }

    /// # Safety
    /// Must run before the owning instance is destroyed.
    pub unsafe fn destroy(&self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None)
        };
    }
}
