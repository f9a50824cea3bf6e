// =============================================================================
// CONFIGURATION - Device creation parameters
// =============================================================================
//
// This module holds every recognized knob for device bring-up and frame
// pacing, loadable from a TOML file. Provides sensible defaults if the file
// is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

use crate::message::MessageSeverity;

/// Root parameter structure handed to the device manager at construction.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DeviceCreationParameters {
    pub application_name: String,
    pub swap_chain: SwapChainConfig,
    pub features: FeatureConfig,
    pub debug: DebugConfig,
    pub extensions: ExtensionConfig,
}

/// Swap chain and frame pacing settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SwapChainConfig {
    pub format: String,
    pub back_buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub max_frames_in_flight: usize,
}

impl Default for SwapChainConfig {
    fn default() -> Self {
        Self {
            format: "rgba8_srgb".to_string(),
            back_buffer_count: 3,
            width: 1280,
            height: 720,
            vsync: true,
            max_frames_in_flight: 2,
        }
    }
}

/// Optional queue and extension-group requests.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FeatureConfig {
    pub enable_compute_queue: bool,
    pub enable_copy_queue: bool,
    pub enable_ray_tracing_extensions: bool,
}

/// Debug runtime settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enable_debug_runtime: bool,
    pub enable_validation_layer: bool,
    /// Validation message id numbers that are dropped before they reach the
    /// message sink.
    pub ignored_message_ids: Vec<i32>,
    /// Severity used for informational enumeration of enabled capabilities.
    pub info_log_severity: MessageSeverity,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enable_debug_runtime: false,
            enable_validation_layer: false,
            ignored_message_ids: Vec::new(),
            info_log_severity: MessageSeverity::Info,
        }
    }
}

/// User-requested extensions and layers, merged into the built-in sets
/// before negotiation.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ExtensionConfig {
    pub required_instance: Vec<String>,
    pub optional_instance: Vec<String>,
    pub required_layers: Vec<String>,
    pub optional_layers: Vec<String>,
    pub required_device: Vec<String>,
    pub optional_device: Vec<String>,
}

impl DeviceCreationParameters {
    /// Load parameters from a file, falling back to defaults if not found.
    pub fn load() -> Self {
        Self::load_from_path("device.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load device.toml: {}. Using defaults.", e);
            DeviceCreationParameters::default()
        })
    }

    /// Load parameters from a specific path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(DeviceCreationParameters::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let params: DeviceCreationParameters = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded device parameters from {:?}", path);
        log::debug!("Parameters: {:?}", params);

        Ok(params)
    }

    /// Get the requested swap chain format as a Vulkan enum.
    pub fn swap_chain_format(&self) -> vk::Format {
        match self.swap_chain.format.to_lowercase().as_str() {
            "rgba8_unorm" => vk::Format::R8G8B8A8_UNORM,
            "bgra8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "rgba8_srgb" | "srgba8_unorm" => vk::Format::R8G8B8A8_SRGB,
            "bgra8_srgb" | "sbgra8_unorm" => vk::Format::B8G8R8A8_SRGB,
            _ => {
                log::warn!(
                    "Unknown swap chain format '{}', defaulting to rgba8_srgb",
                    self.swap_chain.format
                );
                vk::Format::R8G8B8A8_SRGB
            }
        }
    }

    /// Requested back buffer extent.
    pub fn back_buffer_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.swap_chain.width,
            height: self.swap_chain.height,
        }
    }

    /// Frames-in-flight cap, never below one.
    pub fn max_frames_in_flight(&self) -> usize {
        self.swap_chain.max_frames_in_flight.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let params = DeviceCreationParameters::default();
        assert_eq!(params.swap_chain_format(), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(params.swap_chain.back_buffer_count, 3);
        assert_eq!(params.max_frames_in_flight(), 2);
        assert!(!params.features.enable_compute_queue);
    }

    #[test]
    fn parses_overrides_from_toml() {
        let params: DeviceCreationParameters = toml::from_str(
            r#"
            application_name = "demo"

            [swap_chain]
            format = "bgra8_unorm"
            back_buffer_count = 2
            vsync = false
            max_frames_in_flight = 3

            [features]
            enable_compute_queue = true

            [debug]
            enable_debug_runtime = true
            ignored_message_ids = [42]
            info_log_severity = "warning"

            [extensions]
            required_device = ["VK_KHR_ray_query"]
            "#,
        )
        .unwrap();

        assert_eq!(params.application_name, "demo");
        assert_eq!(params.swap_chain_format(), vk::Format::B8G8R8A8_UNORM);
        assert_eq!(params.swap_chain.back_buffer_count, 2);
        assert!(!params.swap_chain.vsync);
        assert_eq!(params.max_frames_in_flight(), 3);
        assert!(params.features.enable_compute_queue);
        assert!(params.debug.enable_debug_runtime);
        assert_eq!(params.debug.ignored_message_ids, vec![42]);
        assert_eq!(params.debug.info_log_severity, MessageSeverity::Warning);
        assert_eq!(params.extensions.required_device, vec!["VK_KHR_ray_query"]);
    }

    #[test]
    fn unknown_format_falls_back() {
        let mut params = DeviceCreationParameters::default();
        params.swap_chain.format = "r5g6b5".to_string();
        assert_eq!(params.swap_chain_format(), vk::Format::R8G8B8A8_SRGB);
    }

    #[test]
    fn frames_in_flight_never_zero() {
        let mut params = DeviceCreationParameters::default();
        params.swap_chain.max_frames_in_flight = 0;
        assert_eq!(params.max_frames_in_flight(), 1);
    }
}
