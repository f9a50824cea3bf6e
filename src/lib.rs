//! Vulkan device bring-up and frame pacing for a windowed renderer.
//!
//! The entry point is [`VulkanDeviceManager`]: feed it
//! [`DeviceCreationParameters`] and a [`RenderDeviceFactory`] and it
//! negotiates extensions and layers, selects an adapter, builds the logical
//! device and swap chain, and drives the per-frame acquire/present loop
//! with a bounded number of frames in flight.

pub mod config;
pub mod error;
pub mod message;
pub mod rhi;
pub mod vulkan;

use anyhow::Result;

pub use config::DeviceCreationParameters;
pub use error::{CapabilityScope, DeviceManagerError};
pub use message::{LogMessageSink, MessageSeverity, MessageSink};
pub use rhi::{
    CommandListHandle, CommandQueue, DeviceDesc, EventQueryHandle, RenderDevice,
    RenderDeviceFactory, ResourceState, TextureDesc, TextureHandle,
};
pub use vulkan::swapchain::PresentOutcome;
pub use vulkan::VulkanDeviceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsApi {
    Vulkan,
}

/// Backend-independent face of a device manager. The windowing layer talks
/// to this; everything Vulkan-specific stays behind it.
pub trait DeviceManager {
    fn graphics_api(&self) -> GraphicsApi;

    /// The renderer device, once bring-up has completed.
    fn render_device(&mut self) -> Option<&mut (dyn RenderDevice + 'static)>;

    /// Acquires the next back buffer and orders this frame's graphics work
    /// after the acquire.
    fn begin_frame(&mut self) -> Result<()>;

    /// Presents the current back buffer and throttles the CPU to the
    /// configured frames-in-flight bound. A [`PresentOutcome::Stale`] result
    /// means the caller should resize the swap chain.
    fn present(&mut self) -> Result<PresentOutcome>;

    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()>;

    fn current_back_buffer(&self) -> Option<TextureHandle>;
    fn back_buffer(&self, index: u32) -> Option<TextureHandle>;
    fn current_back_buffer_index(&self) -> u32;
    fn back_buffer_count(&self) -> u32;

    /// Human-readable adapter name, empty before device creation and after
    /// destruction.
    fn renderer_string(&self) -> &str;
}
