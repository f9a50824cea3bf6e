// Swap chain lifecycle
//
// The swap chain is created whole and destroyed whole; resize is
// destroy-then-recreate with no incremental path. Every native image is
// wrapped as a renderer texture pinned to the "ready to present" state.

use anyhow::Result;
use ash::vk;

use super::adapter::QueueFamilyAssignment;
use crate::error::DeviceManagerError;
use crate::rhi::{RenderDevice, ResourceState, TextureDesc, TextureHandle};

/// The presentable ring as the renderer sees it: one wrapped texture per
/// native image, plus the current-image cursor. Kept separate from the raw
/// swap chain handle so the create/destroy bookkeeping is testable against
/// any render device.
pub struct BackBufferRing {
    wrappers: Vec<TextureHandle>,
    current_index: u32,
}

impl BackBufferRing {
    /// Wraps every native image as a renderer texture pinned to the
    /// presentable state. The cursor starts at zero.
    pub fn wrap(
        native_images: &[vk::Image],
        width: u32,
        height: u32,
        format: vk::Format,
        rhi: &mut dyn RenderDevice,
    ) -> Result<Self> {
        let mut wrappers = Vec::with_capacity(native_images.len());
        for &image in native_images {
            let desc = back_buffer_desc(width, height, format);
            wrappers.push(rhi.create_handle_for_native_texture(&desc, image)?);
        }
        Ok(Self {
            wrappers,
            current_index: 0,
        })
    }

    /// Idle-waits the render device, then destroys every wrapper. The wait
    /// comes first: a resize can arrive while GPU work referencing a back
    /// buffer is still outstanding.
    pub fn destroy(self, rhi: &mut dyn RenderDevice) {
        rhi.wait_idle();
        for wrapper in self.wrappers {
            rhi.destroy_texture(wrapper);
        }
    }

    pub fn record_acquired(&mut self, index: u32) {
        self.current_index = index;
    }

    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    pub fn count(&self) -> u32 {
        self.wrappers.len() as u32
    }

    pub fn get(&self, index: u32) -> Option<TextureHandle> {
        self.wrappers.get(index as usize).copied()
    }

    pub fn current(&self) -> Option<TextureHandle> {
        self.get(self.current_index)
    }
}

/// Owned exclusively by the device manager; recreated wholesale on resize.
pub struct SwapchainState {
    loader: ash::extensions::khr::Swapchain,
    handle: vk::SwapchainKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    ring: BackBufferRing,
}

/// Result of a present call the caller must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// The surface no longer matches the swap chain; the caller is expected
    /// to trigger a resize.
    Stale,
}

impl SwapchainState {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        instance: &ash::Instance,
        device: &ash::Device,
        surface: vk::SurfaceKHR,
        format: vk::Format,
        back_buffer_count: u32,
        extent: vk::Extent2D,
        vsync: bool,
        assignment: &QueueFamilyAssignment,
        rhi: &mut dyn RenderDevice,
    ) -> Result<Self> {
        let surface_format = vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let queues = sharing_families(assignment.graphics, assignment.present);
        let concurrent = queues.len() > 1;

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(back_buffer_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
            )
            .image_sharing_mode(if concurrent {
                vk::SharingMode::CONCURRENT
            } else {
                vk::SharingMode::EXCLUSIVE
            })
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode_for(vsync))
            .clipped(true);
        if concurrent {
            create_info = create_info.queue_family_indices(&queues);
        }

        let loader = ash::extensions::khr::Swapchain::new(instance, device);
        let handle = unsafe { loader.create_swapchain(&create_info, None) }.map_err(|code| {
            DeviceManagerError::Driver {
                what: "vkCreateSwapchainKHR",
                code,
            }
        })?;

        let native_images = unsafe { loader.get_swapchain_images(handle) }.map_err(|code| {
            DeviceManagerError::Driver {
                what: "vkGetSwapchainImagesKHR",
                code,
            }
        })?;

        log::info!(
            "Created swap chain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            native_images.len(),
            surface_format.format
        );

        let ring = BackBufferRing::wrap(&native_images, extent.width, extent.height, format, rhi)?;

        Ok(Self {
            loader,
            handle,
            surface_format,
            extent,
            ring,
        })
    }

    /// Tears the ring down (idle-waiting first), then destroys the native
    /// swap chain.
    pub fn destroy(self, rhi: &mut dyn RenderDevice) {
        self.ring.destroy(rhi);
        unsafe { self.loader.destroy_swapchain(self.handle, None) };
    }

    /// Acquires the next presentable image with an unbounded timeout,
    /// signaling `semaphore` on completion, and records it as current.
    /// Anything short of full success is a fatal invariant violation: the
    /// surrounding renderer has no mid-frame recovery policy.
    pub fn acquire(&mut self, semaphore: vk::Semaphore) -> Result<(), DeviceManagerError> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, false)) => {
                self.ring.record_acquired(index);
                Ok(())
            }
            Ok((_, true)) => Err(DeviceManagerError::FatalRuntime {
                what: "vkAcquireNextImageKHR",
                code: vk::Result::SUBOPTIMAL_KHR,
            }),
            Err(code) => Err(DeviceManagerError::FatalRuntime {
                what: "vkAcquireNextImageKHR",
                code,
            }),
        }
    }

    /// Presents the current image on `queue`, waiting on `semaphore`.
    pub fn present(
        &self,
        queue: vk::Queue,
        semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome, DeviceManagerError> {
        let wait_semaphores = [semaphore];
        let swapchains = [self.handle];
        let image_indices = [self.ring.current_index()];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(code) => Err(DeviceManagerError::FatalRuntime {
                what: "vkQueuePresentKHR",
                code,
            }),
        }
    }

    pub fn current_index(&self) -> u32 {
        self.ring.current_index()
    }

    pub fn back_buffer_count(&self) -> u32 {
        self.ring.count()
    }

    pub fn back_buffer(&self, index: u32) -> Option<TextureHandle> {
        self.ring.get(index)
    }

    pub fn current_back_buffer(&self) -> Option<TextureHandle> {
        self.ring.current()
    }
}

/// One-time remap applied at bring-up: sampling-oriented RGBA orderings are
/// substituted with the BGRA orderings the presentation engine expects.
/// Never applied per-resize.
pub fn normalize_format(format: vk::Format) -> vk::Format {
    match format {
        vk::Format::R8G8B8A8_SRGB => vk::Format::B8G8R8A8_SRGB,
        vk::Format::R8G8B8A8_UNORM => vk::Format::B8G8R8A8_UNORM,
        other => other,
    }
}

pub fn present_mode_for(vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        vk::PresentModeKHR::FIFO
    } else {
        vk::PresentModeKHR::IMMEDIATE
    }
}

/// Deduplicated set of families the swap chain images are shared across.
/// More than one entry means concurrent sharing mode.
pub fn sharing_families(graphics: u32, present: u32) -> Vec<u32> {
    if graphics == present {
        vec![graphics]
    } else {
        vec![graphics, present]
    }
}

/// Descriptor for one wrapped back buffer. The initial state is pinned so
/// the wrapper never transitions the image away from the presentable state
/// on its own initiative.
pub fn back_buffer_desc(width: u32, height: u32, format: vk::Format) -> TextureDesc {
    TextureDesc {
        width,
        height,
        format,
        debug_name: "swap chain image".to_string(),
        initial_state: ResourceState::Present,
        keep_initial_state: true,
        is_render_target: true,
    }
}
