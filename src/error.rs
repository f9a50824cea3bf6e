// Error taxonomy for device bring-up and the per-frame cycle
//
// Construction-phase failures are recoverable at the call site: the manager
// stays in its last successfully reached state and never half-advances.
// Per-frame failures are either tolerated (stale surface, the caller must
// resize) or fatal.

use ash::vk;
use thiserror::Error;

use crate::message::MessageSeverity;

/// Which capability enumeration a missing name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityScope {
    InstanceExtensions,
    Layers,
    DeviceExtensions,
}

impl std::fmt::Display for CapabilityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityScope::InstanceExtensions => write!(f, "instance extension(s)"),
            CapabilityScope::Layers => write!(f, "layer(s)"),
            CapabilityScope::DeviceExtensions => write!(f, "device extension(s)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceManagerError {
    /// A required extension or layer is not reported by the driver.
    /// Carries every missing name, never just the first one found.
    #[error("cannot create a Vulkan device because the following required {scope} are not supported: {}", .missing.join(", "))]
    Configuration {
        scope: CapabilityScope,
        missing: Vec<String>,
    },

    /// No physical adapter passed the selection predicates. The report lists,
    /// per rejected adapter, its name and every predicate that failed.
    #[error("cannot find a Vulkan device that supports all the required extensions and properties.{report}")]
    Selection { report: String },

    /// A native call returned a non-success status during bring-up.
    #[error("{what} failed, error code = {code}")]
    Driver { what: &'static str, code: vk::Result },

    /// Acquire or present returned a status this subsystem cannot recover
    /// from; the only way out is an externally triggered resize.
    #[error("{what} returned {code} mid-frame")]
    FatalRuntime { what: &'static str, code: vk::Result },

    /// The rendering-hardware-interface collaborator reported a failure.
    #[error(transparent)]
    Rhi(#[from] anyhow::Error),
}

impl DeviceManagerError {
    pub fn severity(&self) -> MessageSeverity {
        match self {
            DeviceManagerError::FatalRuntime { .. } => MessageSeverity::Fatal,
            _ => MessageSeverity::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_names_every_missing_item() {
        let err = DeviceManagerError::Configuration {
            scope: CapabilityScope::DeviceExtensions,
            missing: vec!["VK_KHR_swapchain".to_string(), "X".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("VK_KHR_swapchain"));
        assert!(text.contains("X"));
        assert!(text.contains("device extension(s)"));
    }

    #[test]
    fn rhi_failures_surface_transparently_at_error_severity() {
        let err = DeviceManagerError::from(anyhow::anyhow!("device removed"));
        assert!(matches!(err, DeviceManagerError::Rhi(_)));
        assert_eq!(err.to_string(), "device removed");
        assert_eq!(err.severity(), MessageSeverity::Error);
    }

    #[test]
    fn fatal_runtime_is_reported_as_fatal() {
        let err = DeviceManagerError::FatalRuntime {
            what: "vkAcquireNextImageKHR",
            code: vk::Result::ERROR_DEVICE_LOST,
        };
        assert_eq!(err.severity(), MessageSeverity::Fatal);
    }
}
