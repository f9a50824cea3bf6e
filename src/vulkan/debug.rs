// Debug messenger - validation message routing
//
// Installed when the debug runtime is requested. Messages are formatted
// with their id and routed through the message sink; ids on the configured
// ignore list are dropped before they reach the sink.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;

use crate::error::DeviceManagerError;
use crate::message::{MessageSeverity, MessageSink};

/// State shared with the driver callback. Boxed so its address stays
/// stable for the lifetime of the messenger.
pub struct DebugContext {
    pub sink: Arc<dyn MessageSink>,
    pub ignored_message_ids: Vec<i32>,
}

pub struct DebugMessenger {
    loader: ash::extensions::ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
    _context: Box<DebugContext>,
}

impl DebugMessenger {
    pub fn install(
        entry: &ash::Entry,
        instance: &ash::Instance,
        context: Box<DebugContext>,
    ) -> Result<Self, DeviceManagerError> {
        let loader = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(context.as_ref() as *const DebugContext as *mut std::ffi::c_void);

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .map_err(|code| DeviceManagerError::Driver {
                what: "vkCreateDebugUtilsMessengerEXT",
                code,
            })?;

        Ok(Self {
            loader,
            messenger,
            _context: context,
        })
    }

    pub fn destroy(self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

/// Whether a validation message id is filtered out entirely: suppressed
/// from both logging and escalation.
pub fn should_suppress(ignored_message_ids: &[i32], message_id: i32) -> bool {
    ignored_message_ids.contains(&message_id)
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }
    let data = &*p_callback_data;
    let context = &*(p_user_data as *const DebugContext);

    if should_suppress(&context.ignored_message_ids, data.message_id_number) {
        return vk::FALSE;
    }

    let message = if data.p_message.is_null() {
        String::new()
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy().into_owned()
    };

    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => MessageSeverity::Error,
        _ => MessageSeverity::Warning,
    };

    context.sink.message(
        severity,
        &format!("[Vulkan: id={}] {}", data.message_id_number, message),
    );

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listed_ids_are_suppressed() {
        assert!(should_suppress(&[3, 7, 42], 42));
    }

    #[test]
    fn unlisted_ids_pass_through() {
        assert!(!should_suppress(&[3, 7, 42], 1));
        assert!(!should_suppress(&[], 0));
    }
}
