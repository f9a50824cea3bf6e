// Capability negotiation - extensions and layers
//
// Resolves desired instance/device extensions and layers into an enabled
// set given what the driver actually reports. Required names that are
// absent fail the whole negotiation; optional names are enabled when
// present and silently skipped otherwise.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use ash::vk;

use crate::error::{CapabilityScope, DeviceManagerError};

/// Capability names grouped by the scope they are enabled at.
///
/// Frozen once bring-up completes; the query surface on the manager reads
/// from the enabled set for the lifetime of the device.
#[derive(Debug, Clone, Default)]
pub struct ExtensionSet {
    pub instance: HashSet<String>,
    pub layers: HashSet<String>,
    pub device: HashSet<String>,
}

impl ExtensionSet {
    /// Minimal set of required extensions for a presentable device.
    pub fn baseline_required() -> Self {
        Self {
            instance: [cstr_to_string(vk::KhrGetPhysicalDeviceProperties2Fn::name())].into(),
            layers: HashSet::new(),
            device: [
                cstr_to_string(ash::extensions::khr::Swapchain::name()),
                cstr_to_string(vk::KhrMaintenance1Fn::name()),
            ]
            .into(),
        }
    }

    /// Extensions probed for and enabled when the driver reports them.
    pub fn baseline_optional() -> Self {
        Self {
            instance: [
                cstr_to_string(vk::ExtSamplerFilterMinmaxFn::name()),
                cstr_to_string(ash::extensions::ext::DebugUtils::name()),
            ]
            .into(),
            layers: HashSet::new(),
            device: [
                cstr_to_string(vk::ExtDebugMarkerFn::name()),
                cstr_to_string(vk::ExtDescriptorIndexingFn::name()),
                cstr_to_string(vk::KhrBufferDeviceAddressFn::name()),
                cstr_to_string(vk::NvMeshShaderFn::name()),
                cstr_to_string(vk::KhrFragmentShadingRateFn::name()),
            ]
            .into(),
        }
    }
}

/// Device extensions enabled as a group when ray tracing is requested and
/// the adapter reports them.
pub fn ray_tracing_extensions() -> HashSet<String> {
    [
        cstr_to_string(vk::KhrAccelerationStructureFn::name()),
        cstr_to_string(vk::KhrDeferredHostOperationsFn::name()),
        cstr_to_string(vk::KhrPipelineLibraryFn::name()),
        cstr_to_string(vk::KhrRayQueryFn::name()),
        cstr_to_string(vk::KhrRayTracingPipelineFn::name()),
    ]
    .into()
}

pub const VALIDATION_LAYER_NAME: &str = "VK_LAYER_KHRONOS_validation";

/// Resolves `enabled = required ∪ (optional ∩ available)` for one scope.
///
/// `enabled` holds the required names on entry and grows with every
/// optional name the driver reports. If any required name is missing the
/// scope fails as a whole, with the complete missing list in the error.
pub fn negotiate(
    enabled: &mut HashSet<String>,
    optional: &HashSet<String>,
    available: &HashSet<String>,
    scope: CapabilityScope,
) -> Result<(), DeviceManagerError> {
    for name in optional {
        if available.contains(name) {
            enabled.insert(name.clone());
        }
    }

    let mut missing: Vec<String> = enabled.difference(available).cloned().collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(DeviceManagerError::Configuration { scope, missing });
    }

    Ok(())
}

pub(crate) fn cstr_to_string(name: &CStr) -> String {
    name.to_string_lossy().into_owned()
}

/// Converts a fixed-size Vulkan name buffer into an owned string.
pub(crate) fn vk_name_to_string(raw: &[c_char]) -> String {
    unsafe { CStr::from_ptr(raw.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Builds the NUL-terminated pointer list a Vulkan create-info expects.
/// The returned `CString` storage must stay alive for as long as the
/// pointers are in use.
pub(crate) fn to_cstring_pointers(names: &HashSet<String>) -> (Vec<CString>, Vec<*const c_char>) {
    let mut storage: Vec<CString> = Vec::with_capacity(names.len());
    for name in names {
        match CString::new(name.as_str()) {
            Ok(cstring) => storage.push(cstring),
            Err(_) => log::warn!("Skipping capability name with embedded NUL: {:?}", name),
        }
    }
    let pointers = storage.iter().map(|s| s.as_ptr()).collect();
    (storage, pointers)
}
