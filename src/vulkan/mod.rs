// Vulkan device manager - capability-negotiated bring-up and frame pacing
//
// Lifecycle: Uninitialized -> InstanceReady -> DeviceReady -> SwapchainReady
// -> (resize: destroy + recreate swap chain) -> Destroyed. Each stage is
// held in an Option so a partially constructed manager tears down cleanly,
// and a failed transition leaves the machine in its last good state.

pub mod adapter;
pub mod debug;
pub mod extensions;
pub mod frame;
pub mod swapchain;

use std::collections::HashSet;
use std::ffi::CString;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk;
use once_cell::sync::OnceCell;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::config::DeviceCreationParameters;
use crate::error::{CapabilityScope, DeviceManagerError};
use crate::message::{LogMessageSink, MessageSeverity, MessageSink};
use crate::rhi::{
    CommandListHandle, CommandQueue, DeviceDesc, RenderDevice, RenderDeviceFactory, TextureHandle,
    ValidationRenderDevice,
};
use crate::{DeviceManager, GraphicsApi};

use adapter::{AdapterFacts, AdapterRequirements, QueueFamilyAssignment, QueueFamilyInfo, SurfaceCaps};
use debug::{DebugContext, DebugMessenger};
use extensions::{
    negotiate, ray_tracing_extensions, to_cstring_pointers, vk_name_to_string, ExtensionSet,
    VALIDATION_LAYER_NAME,
};
use frame::InFlightFrames;
use swapchain::{normalize_format, PresentOutcome, SwapchainState};

// The dynamic entry points are loaded once per process; later managers
// reuse them instead of reloading the library.
static VULKAN_ENTRY: OnceCell<ash::Entry> = OnceCell::new();

fn vulkan_entry() -> Result<&'static ash::Entry> {
    VULKAN_ENTRY.get_or_try_init(|| {
        unsafe { ash::Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")
    })
}

pub struct VulkanDeviceManager {
    params: DeviceCreationParameters,
    factory: Box<dyn RenderDeviceFactory>,
    sink: Arc<dyn MessageSink>,

    enabled_extensions: ExtensionSet,
    optional_extensions: ExtensionSet,
    // Normalized once at bring-up, reused across every resize.
    swap_chain_format: vk::Format,

    instance: Option<ash::Instance>,
    debug_messenger: Option<DebugMessenger>,
    surface: Option<vk::SurfaceKHR>,
    surface_loader: Option<ash::extensions::khr::Surface>,
    physical_device: Option<vk::PhysicalDevice>,
    queue_assignment: Option<QueueFamilyAssignment>,
    device: Option<ash::Device>,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,
    present_queue: vk::Queue,
    renderer_string: String,

    rhi: Option<Box<dyn RenderDevice>>,
    swap_chain: Option<SwapchainState>,
    barrier_command_list: Option<CommandListHandle>,
    present_semaphore: Option<vk::Semaphore>,
    frames: InFlightFrames,
}

impl VulkanDeviceManager {
    pub fn new(params: DeviceCreationParameters, factory: Box<dyn RenderDeviceFactory>) -> Self {
        Self::with_message_sink(params, factory, Arc::new(LogMessageSink))
    }

    pub fn with_message_sink(
        params: DeviceCreationParameters,
        factory: Box<dyn RenderDeviceFactory>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            params,
            factory,
            sink,
            enabled_extensions: ExtensionSet::default(),
            optional_extensions: ExtensionSet::default(),
            swap_chain_format: vk::Format::UNDEFINED,
            instance: None,
            debug_messenger: None,
            surface: None,
            surface_loader: None,
            physical_device: None,
            queue_assignment: None,
            device: None,
            graphics_queue: vk::Queue::null(),
            compute_queue: vk::Queue::null(),
            transfer_queue: vk::Queue::null(),
            present_queue: vk::Queue::null(),
            renderer_string: String::new(),
            rhi: None,
            swap_chain: None,
            barrier_command_list: None,
            present_semaphore: None,
            frames: InFlightFrames::new(),
        }
    }

    /// Full bring-up: instance, surface, adapter selection, logical device,
    /// renderer device wrapper, swap chain, per-frame synchronization
    /// objects. On failure the manager stays in its last good state and can
    /// be destroyed safely.
    pub fn create_device_and_swap_chain(
        &mut self,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<()> {
        self.try_create(display_handle, window_handle)
            .map_err(|e| self.fail(e))
    }

    fn try_create(
        &mut self,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<()> {
        self.enabled_extensions = ExtensionSet::baseline_required();
        self.optional_extensions = ExtensionSet::baseline_optional();

        let user = &self.params.extensions;
        self.enabled_extensions
            .instance
            .extend(user.required_instance.iter().cloned());
        self.optional_extensions
            .instance
            .extend(user.optional_instance.iter().cloned());
        self.enabled_extensions
            .layers
            .extend(user.required_layers.iter().cloned());
        self.optional_extensions
            .layers
            .extend(user.optional_layers.iter().cloned());
        self.enabled_extensions
            .device
            .extend(user.required_device.iter().cloned());
        self.optional_extensions
            .device
            .extend(user.optional_device.iter().cloned());

        if self.params.debug.enable_debug_runtime {
            self.enabled_extensions
                .instance
                .insert(extensions::cstr_to_string(
                    ash::extensions::ext::DebugUtils::name(),
                ));
            self.enabled_extensions
                .layers
                .insert(VALIDATION_LAYER_NAME.to_string());
        }

        // The surface extensions the target window system needs are
        // required by definition.
        for name in surface_extension_names(&display_handle)? {
            self.enabled_extensions.instance.insert(name);
        }

        let entry = vulkan_entry()?;

        self.create_instance(entry)?;

        if self.params.debug.enable_debug_runtime {
            let context = Box::new(DebugContext {
                sink: Arc::clone(&self.sink),
                ignored_message_ids: self.params.debug.ignored_message_ids.clone(),
            });
            let instance = self.instance.as_ref().context("instance not created")?;
            self.debug_messenger = Some(DebugMessenger::install(entry, instance, context)?);
        }

        self.swap_chain_format = normalize_format(self.params.swap_chain_format());

        self.create_window_surface(entry, display_handle, window_handle)?;
        self.pick_physical_device()?;
        self.create_logical_device()?;
        self.create_render_device()?;
        self.create_swap_chain_internal()?;

        let rhi = self.rhi.as_mut().context("render device not created")?;
        self.barrier_command_list =
            Some(rhi.create_command_list().map_err(DeviceManagerError::Rhi)?);

        let device = self.device.as_ref().context("device not created")?;
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }.map_err(
            |code| DeviceManagerError::Driver {
                what: "vkCreateSemaphore",
                code,
            },
        )?;
        self.present_semaphore = Some(semaphore);

        Ok(())
    }

    fn create_instance(&mut self, entry: &ash::Entry) -> Result<()> {
        let available_extensions: HashSet<String> = entry
            .enumerate_instance_extension_properties(None)
            .map_err(|code| DeviceManagerError::Driver {
                what: "vkEnumerateInstanceExtensionProperties",
                code,
            })?
            .iter()
            .map(|ext| vk_name_to_string(&ext.extension_name))
            .collect();

        negotiate(
            &mut self.enabled_extensions.instance,
            &self.optional_extensions.instance,
            &available_extensions,
            CapabilityScope::InstanceExtensions,
        )?;
        self.log_enabled("instance extensions", &self.enabled_extensions.instance);

        let available_layers: HashSet<String> = entry
            .enumerate_instance_layer_properties()
            .map_err(|code| DeviceManagerError::Driver {
                what: "vkEnumerateInstanceLayerProperties",
                code,
            })?
            .iter()
            .map(|layer| vk_name_to_string(&layer.layer_name))
            .collect();

        negotiate(
            &mut self.enabled_extensions.layers,
            &self.optional_extensions.layers,
            &available_layers,
            CapabilityScope::Layers,
        )?;
        self.log_enabled("layers", &self.enabled_extensions.layers);

        let (_ext_storage, ext_pointers) = to_cstring_pointers(&self.enabled_extensions.instance);
        let (_layer_storage, layer_pointers) = to_cstring_pointers(&self.enabled_extensions.layers);

        let app_name = CString::new(self.params.application_name.as_str())
            .context("application name contains an embedded NUL")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .api_version(vk::API_VERSION_1_2);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&ext_pointers)
            .enabled_layer_names(&layer_pointers);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|code| {
            DeviceManagerError::Driver {
                what: "vkCreateInstance",
                code,
            }
        })?;

        self.instance = Some(instance);
        Ok(())
    }

    fn create_window_surface(
        &mut self,
        entry: &ash::Entry,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<()> {
        let instance = self.instance.as_ref().context("instance not created")?;

        let result = match (display_handle, window_handle) {
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance =
                    handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(hwnd);
                let loader = ash::extensions::khr::Win32Surface::new(entry, instance);
                unsafe { loader.create_win32_surface(&create_info, None) }
            }
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
                let dpy = display
                    .display
                    .map(|d| d.as_ptr())
                    .unwrap_or(std::ptr::null_mut());
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy as *mut _)
                    .window(window.window);
                let loader = ash::extensions::khr::XlibSurface::new(entry, instance);
                unsafe { loader.create_xlib_surface(&create_info, None) }
            }
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr())
                    .surface(window.surface.as_ptr());
                let loader = ash::extensions::khr::WaylandSurface::new(entry, instance);
                unsafe { loader.create_wayland_surface(&create_info, None) }
            }
            _ => bail!("unsupported window system: cannot create a presentable surface"),
        };

        let surface = result.map_err(|code| DeviceManagerError::Driver {
            what: "creating a window surface",
            code,
        })?;

        self.surface_loader = Some(ash::extensions::khr::Surface::new(entry, instance));
        self.surface = Some(surface);
        Ok(())
    }

    fn pick_physical_device(&mut self) -> Result<()> {
        let instance = self.instance.as_ref().context("instance not created")?;

        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|code| {
            DeviceManagerError::Driver {
                what: "vkEnumeratePhysicalDevices",
                code,
            }
        })?;

        let mut candidates = Vec::with_capacity(devices.len());
        for &physical_device in &devices {
            candidates.push(self.gather_adapter_facts(physical_device)?);
        }

        let requirements = AdapterRequirements {
            required_device_extensions: self.enabled_extensions.device.clone(),
            surface_format: self.swap_chain_format,
            back_buffer_count: self.params.swap_chain.back_buffer_count,
            extent: self.params.back_buffer_extent(),
            need_compute_queue: self.params.features.enable_compute_queue,
            need_transfer_queue: self.params.features.enable_copy_queue,
        };

        let (index, assignment) = adapter::select_adapter(&candidates, &requirements)?;

        self.physical_device = Some(devices[index]);
        self.queue_assignment = Some(assignment);
        Ok(())
    }

    fn gather_adapter_facts(&self, physical_device: vk::PhysicalDevice) -> Result<AdapterFacts> {
        let instance = self.instance.as_ref().context("instance not created")?;
        let surface_loader = self
            .surface_loader
            .as_ref()
            .context("surface not created")?;
        let surface = self.surface.context("surface not created")?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };

        let extensions: HashSet<String> =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .map_err(|code| DeviceManagerError::Driver {
                    what: "vkEnumerateDeviceExtensionProperties",
                    code,
                })?
                .iter()
                .map(|ext| vk_name_to_string(&ext.extension_name))
                .collect();

        let caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(|code| DeviceManagerError::Driver {
            what: "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
            code,
        })?;

        let surface_formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)
        }
        .map_err(|code| DeviceManagerError::Driver {
            what: "vkGetPhysicalDeviceSurfaceFormatsKHR",
            code,
        })?
        .iter()
        .map(|f| f.format)
        .collect();

        let family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        self.sink.message(
            self.params.debug.info_log_severity,
            &format!(
                "Physical device has {} queue families",
                family_properties.len()
            ),
        );

        let queue_families = family_properties
            .iter()
            .enumerate()
            .map(|(index, family)| {
                let supports_present = unsafe {
                    surface_loader.get_physical_device_surface_support(
                        physical_device,
                        index as u32,
                        surface,
                    )
                }
                .unwrap_or(false);
                QueueFamilyInfo {
                    flags: family.queue_flags,
                    queue_count: family.queue_count,
                    supports_present,
                }
            })
            .collect();

        Ok(AdapterFacts {
            name: vk_name_to_string(&properties.device_name),
            device_type: properties.device_type,
            extensions,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            texture_compression_bc: features.texture_compression_bc == vk::TRUE,
            surface_caps: SurfaceCaps {
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                min_image_extent: caps.min_image_extent,
                max_image_extent: caps.max_image_extent,
            },
            surface_formats,
            queue_families,
        })
    }

    fn create_logical_device(&mut self) -> Result<()> {
        let instance = self.instance.as_ref().context("instance not created")?;
        let physical_device = self.physical_device.context("no adapter selected")?;
        let assignment = self.queue_assignment.context("no adapter selected")?;

        // Device-scope negotiation runs against the chosen adapter only.
        let available: HashSet<String> =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .map_err(|code| DeviceManagerError::Driver {
                    what: "vkEnumerateDeviceExtensionProperties",
                    code,
                })?
                .iter()
                .map(|ext| vk_name_to_string(&ext.extension_name))
                .collect();

        negotiate(
            &mut self.enabled_extensions.device,
            &self.optional_extensions.device,
            &available,
            CapabilityScope::DeviceExtensions,
        )?;

        if self.params.features.enable_ray_tracing_extensions {
            for name in ray_tracing_extensions() {
                if available.contains(&name) {
                    self.enabled_extensions.device.insert(name);
                }
            }
        }

        self.log_enabled("device extensions", &self.enabled_extensions.device);

        let enabled = &self.enabled_extensions.device;
        let accel_struct_supported = enabled.contains("VK_KHR_acceleration_structure");
        let buffer_address_supported = enabled.contains("VK_KHR_buffer_device_address");
        let ray_pipeline_supported = enabled.contains("VK_KHR_ray_tracing_pipeline");
        let ray_query_supported = enabled.contains("VK_KHR_ray_query");
        let meshlets_supported = enabled.contains("VK_NV_mesh_shader");
        let vrs_supported = enabled.contains("VK_KHR_fragment_shading_rate");

        let need_compute = self.params.features.enable_compute_queue;
        let need_transfer = self.params.features.enable_copy_queue;

        let queue_priority = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = assignment
            .unique_families(need_compute, need_transfer)
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priority)
                    .build()
            })
            .collect();

        let mut accel_struct_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true);
        let mut buffer_address_features =
            vk::PhysicalDeviceBufferDeviceAddressFeaturesEXT::builder().buffer_device_address(true);
        let mut ray_pipeline_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
            .ray_tracing_pipeline(true)
            .ray_traversal_primitive_culling(true);
        let mut ray_query_features =
            vk::PhysicalDeviceRayQueryFeaturesKHR::builder().ray_query(true);
        let mut meshlet_features = vk::PhysicalDeviceMeshShaderFeaturesNV::builder()
            .task_shader(true)
            .mesh_shader(true);
        let mut vrs_features = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::builder()
            .pipeline_fragment_shading_rate(true)
            .primitive_fragment_shading_rate(true)
            .attachment_fragment_shading_rate(true);

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .timeline_semaphore(true);

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .shader_image_gather_extended(true)
            .sampler_anisotropy(true)
            .tessellation_shader(true)
            .texture_compression_bc(true)
            .geometry_shader(true)
            .image_cube_array(true)
            .dual_src_blend(true);

        let (_ext_storage, ext_pointers) = to_cstring_pointers(&self.enabled_extensions.device);
        let (_layer_storage, layer_pointers) = to_cstring_pointers(&self.enabled_extensions.layers);

        // Feature blocks are chained only when their gating extension was
        // actually enabled.
        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_features(&device_features)
            .enabled_extension_names(&ext_pointers)
            .enabled_layer_names(&layer_pointers)
            .push_next(&mut vulkan12_features);
        if accel_struct_supported {
            create_info = create_info.push_next(&mut accel_struct_features);
        }
        if buffer_address_supported {
            create_info = create_info.push_next(&mut buffer_address_features);
        }
        if ray_pipeline_supported {
            create_info = create_info.push_next(&mut ray_pipeline_features);
        }
        if ray_query_supported {
            create_info = create_info.push_next(&mut ray_query_features);
        }
        if meshlets_supported {
            create_info = create_info.push_next(&mut meshlet_features);
        }
        if vrs_supported {
            create_info = create_info.push_next(&mut vrs_features);
        }

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|code| DeviceManagerError::Driver {
                what: "vkCreateDevice",
                code,
            })?;

        self.graphics_queue = unsafe { device.get_device_queue(assignment.graphics, 0) };
        if need_compute {
            if let Some(family) = assignment.compute {
                self.compute_queue = unsafe { device.get_device_queue(family, 0) };
            }
        }
        if need_transfer {
            if let Some(family) = assignment.transfer {
                self.transfer_queue = unsafe { device.get_device_queue(family, 0) };
            }
        }
        self.present_queue = unsafe { device.get_device_queue(assignment.present, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        self.renderer_string = vk_name_to_string(&properties.device_name);
        self.sink.message(
            self.params.debug.info_log_severity,
            &format!("Created Vulkan device: {}", self.renderer_string),
        );

        self.device = Some(device);
        Ok(())
    }

    fn create_render_device(&mut self) -> Result<()> {
        let instance = self.instance.as_ref().context("instance not created")?;
        let physical_device = self.physical_device.context("no adapter selected")?;
        let device = self.device.as_ref().context("device not created")?;
        let assignment = self.queue_assignment.context("no adapter selected")?;

        let need_compute = self.params.features.enable_compute_queue;
        let need_transfer = self.params.features.enable_copy_queue;

        let mut instance_extensions: Vec<String> =
            self.enabled_extensions.instance.iter().cloned().collect();
        instance_extensions.sort();
        let mut device_extensions: Vec<String> =
            self.enabled_extensions.device.iter().cloned().collect();
        device_extensions.sort();

        let desc = DeviceDesc {
            instance: instance.clone(),
            physical_device,
            device: device.clone(),
            graphics_queue: self.graphics_queue,
            graphics_queue_index: assignment.graphics,
            compute_queue: need_compute.then_some(self.compute_queue),
            compute_queue_index: if need_compute { assignment.compute } else { None },
            transfer_queue: need_transfer.then_some(self.transfer_queue),
            transfer_queue_index: if need_transfer { assignment.transfer } else { None },
            instance_extensions,
            device_extensions,
        };

        let render_device = self
            .factory
            .create_render_device(desc)
            .map_err(DeviceManagerError::Rhi)?;
        self.rhi = Some(if self.params.debug.enable_validation_layer {
            Box::new(ValidationRenderDevice::new(render_device))
        } else {
            render_device
        });
        Ok(())
    }

    /// Creates the swap chain, implicitly destroying any existing one
    /// first. The format was normalized once at bring-up.
    fn create_swap_chain_internal(&mut self) -> Result<()> {
        self.destroy_swap_chain_internal();

        let instance = self.instance.as_ref().context("instance not created")?;
        let device = self.device.as_ref().context("device not created")?;
        let surface = self.surface.context("surface not created")?;
        let assignment = self.queue_assignment.context("no adapter selected")?;
        let rhi = self.rhi.as_mut().context("render device not created")?;

        let swap_chain = SwapchainState::create(
            instance,
            device,
            surface,
            self.swap_chain_format,
            self.params.swap_chain.back_buffer_count,
            self.params.back_buffer_extent(),
            self.params.swap_chain.vsync,
            &assignment,
            rhi.as_mut(),
        )?;

        self.swap_chain = Some(swap_chain);
        Ok(())
    }

    /// Destroys the back-buffer wrappers and the swap chain. The ring
    /// idle-waits the render device before any wrapper goes away.
    /// Idempotent when no swap chain exists.
    fn destroy_swap_chain_internal(&mut self) {
        if let Some(swap_chain) = self.swap_chain.take() {
            if let Some(rhi) = self.rhi.as_mut() {
                swap_chain.destroy(rhi.as_mut());
            }
        }
    }

    /// Reverse-order teardown. Every step is guarded so a partially
    /// constructed manager tears down cleanly.
    pub fn destroy(&mut self) {
        if let Some(device) = &self.device {
            let _ = unsafe { device.device_wait_idle() };
        }

        self.destroy_swap_chain_internal();

        if let Some(semaphore) = self.present_semaphore.take() {
            if let Some(device) = &self.device {
                unsafe { device.destroy_semaphore(semaphore, None) };
            }
        }

        if let Some(list) = self.barrier_command_list.take() {
            if let Some(rhi) = self.rhi.as_mut() {
                rhi.release_command_list(list);
            }
        }

        self.frames.clear();
        self.rhi = None;
        self.renderer_string.clear();

        if let Some(messenger) = self.debug_messenger.take() {
            messenger.destroy();
        }

        if let Some(device) = self.device.take() {
            unsafe { device.destroy_device(None) };
        }

        if let Some(surface) = self.surface.take() {
            if let Some(loader) = &self.surface_loader {
                unsafe { loader.destroy_surface(surface, None) };
            }
        }
        self.surface_loader = None;

        if let Some(instance) = self.instance.take() {
            unsafe { instance.destroy_instance(None) };
        }

        self.physical_device = None;
        self.queue_assignment = None;
        self.graphics_queue = vk::Queue::null();
        self.compute_queue = vk::Queue::null();
        self.transfer_queue = vk::Queue::null();
        self.present_queue = vk::Queue::null();
    }

    fn fail(&self, err: anyhow::Error) -> anyhow::Error {
        let severity = err
            .downcast_ref::<DeviceManagerError>()
            .map(DeviceManagerError::severity)
            .unwrap_or(MessageSeverity::Error);
        self.sink.message(severity, &format!("{:#}", err));
        err
    }

    fn log_enabled(&self, what: &str, names: &HashSet<String>) {
        let severity = self.params.debug.info_log_severity;
        self.sink
            .message(severity, &format!("Enabled Vulkan {}:", what));
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        for name in sorted {
            self.sink.message(severity, &format!("    {}", name));
        }
    }

    pub fn is_instance_extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.instance.contains(name)
    }

    pub fn is_device_extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.device.contains(name)
    }

    pub fn is_layer_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.layers.contains(name)
    }

    pub fn enabled_instance_extensions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.enabled_extensions.instance.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn enabled_device_extensions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.enabled_extensions.device.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn enabled_layers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.enabled_extensions.layers.iter().cloned().collect();
        names.sort();
        names
    }
}

impl DeviceManager for VulkanDeviceManager {
    fn graphics_api(&self) -> GraphicsApi {
        GraphicsApi::Vulkan
    }

    fn render_device(&mut self) -> Option<&mut (dyn RenderDevice + 'static)> {
        self.rhi.as_deref_mut()
    }

    /// Acquires the next back buffer and orders all graphics work submitted
    /// this frame after the acquire, without blocking the CPU on the GPU.
    fn begin_frame(&mut self) -> Result<()> {
        let result = (|| -> Result<()> {
            let semaphore = self
                .present_semaphore
                .context("swap chain not created")?;
            let swap_chain = self
                .swap_chain
                .as_mut()
                .context("swap chain not created")?;

            swap_chain.acquire(semaphore)?;

            let rhi = self.rhi.as_mut().context("render device not created")?;
            rhi.queue_wait_for_semaphore(CommandQueue::Graphics, semaphore, 0)
                .map_err(DeviceManagerError::Rhi)?;
            Ok(())
        })();
        result.map_err(|e| self.fail(e))
    }

    /// Signals present-after-render ordering on the graphics queue, flushes
    /// it through the barrier command list, presents, then enforces the
    /// frames-in-flight bound.
    fn present(&mut self) -> Result<PresentOutcome> {
        let result = (|| -> Result<PresentOutcome> {
            let semaphore = self
                .present_semaphore
                .context("swap chain not created")?;

            {
                let rhi = self.rhi.as_mut().context("render device not created")?;
                rhi.queue_signal_semaphore(CommandQueue::Graphics, semaphore, 0)
                    .map_err(DeviceManagerError::Rhi)?;

                // An otherwise-empty submission, purely to force the queued
                // semaphore signal to execute.
                let barrier = self
                    .barrier_command_list
                    .context("barrier command list not created")?;
                rhi.open_command_list(barrier).map_err(DeviceManagerError::Rhi)?;
                rhi.close_command_list(barrier).map_err(DeviceManagerError::Rhi)?;
                rhi.execute_command_list(barrier)
                    .map_err(DeviceManagerError::Rhi)?;
            }

            let swap_chain = self
                .swap_chain
                .as_ref()
                .context("swap chain not created")?;
            let outcome = swap_chain.present(self.present_queue, semaphore)?;

            let device = self.device.as_ref().context("device not created")?;
            if self.params.debug.enable_debug_runtime {
                // Debug runtimes expect the application to synchronize with
                // the GPU around presentation.
                unsafe { device.queue_wait_idle(self.present_queue) }.map_err(|code| {
                    DeviceManagerError::Driver {
                        what: "vkQueueWaitIdle",
                        code,
                    }
                })?;
            } else if cfg!(not(target_os = "windows")) && self.params.swap_chain.vsync {
                unsafe { device.queue_wait_idle(self.present_queue) }.map_err(|code| {
                    DeviceManagerError::Driver {
                        what: "vkQueueWaitIdle",
                        code,
                    }
                })?;
            }

            // Throttling runs every frame regardless of the debug-runtime
            // and vsync paths above.
            let rhi = self.rhi.as_mut().context("render device not created")?;
            self.frames
                .throttle(rhi.as_mut(), self.params.max_frames_in_flight())
                .map_err(DeviceManagerError::Rhi)?;

            Ok(outcome)
        })();
        result.map_err(|e| self.fail(e))
    }

    /// Externally triggered: waits for the device to go idle, destroys the
    /// swap chain wholesale and recreates it at the new extent.
    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()> {
        if self.device.is_none() {
            self.sink.message(
                MessageSeverity::Info,
                "resize_swap_chain called before device creation, ignoring",
            );
            return Ok(());
        }
        self.params.swap_chain.width = width;
        self.params.swap_chain.height = height;
        self.destroy_swap_chain_internal();
        self.create_swap_chain_internal().map_err(|e| self.fail(e))
    }

    fn current_back_buffer(&self) -> Option<TextureHandle> {
        self.swap_chain
            .as_ref()
            .and_then(|sc| sc.current_back_buffer())
    }

    fn back_buffer(&self, index: u32) -> Option<TextureHandle> {
        self.swap_chain.as_ref().and_then(|sc| sc.back_buffer(index))
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.swap_chain
            .as_ref()
            .map(|sc| sc.current_index())
            .unwrap_or(0)
    }

    fn back_buffer_count(&self) -> u32 {
        self.swap_chain
            .as_ref()
            .map(|sc| sc.back_buffer_count())
            .unwrap_or(0)
    }

    fn renderer_string(&self) -> &str {
        &self.renderer_string
    }
}

impl Drop for VulkanDeviceManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Instance extensions the target window system needs before a surface can
/// be created from its raw handles.
fn surface_extension_names(display_handle: &RawDisplayHandle) -> Result<Vec<String>> {
    let surface = extensions::cstr_to_string(ash::extensions::khr::Surface::name());
    let platform = match display_handle {
        RawDisplayHandle::Windows(_) => {
            extensions::cstr_to_string(ash::extensions::khr::Win32Surface::name())
        }
        RawDisplayHandle::Xlib(_) => {
            extensions::cstr_to_string(ash::extensions::khr::XlibSurface::name())
        }
        RawDisplayHandle::Wayland(_) => {
            extensions::cstr_to_string(ash::extensions::khr::WaylandSurface::name())
        }
        other => bail!("unsupported window system: {:?}", other),
    };
    Ok(vec![surface, platform])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::testing::RecordingDevice;
    use std::sync::Mutex;

    struct CapturingSink(Mutex<Vec<(MessageSeverity, String)>>);

    impl MessageSink for CapturingSink {
        fn message(&self, severity: MessageSeverity, text: &str) {
            self.0.lock().unwrap().push((severity, text.to_string()));
        }
    }

    struct RecordingFactory;

    impl RenderDeviceFactory for RecordingFactory {
        fn create_render_device(&self, _desc: DeviceDesc) -> Result<Box<dyn RenderDevice>> {
            Ok(Box::<RecordingDevice>::default())
        }
    }

    #[test]
    fn resize_before_bring_up_is_reported_not_silent() {
        let sink = Arc::new(CapturingSink(Mutex::new(Vec::new())));
        let mut manager = VulkanDeviceManager::with_message_sink(
            DeviceCreationParameters::default(),
            Box::new(RecordingFactory),
            sink.clone(),
        );
        manager.resize_swap_chain(640, 480).unwrap();

        let messages = sink.0.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, MessageSeverity::Info);
    }

    #[test]
    fn surface_extensions_follow_the_window_system() {
        let xlib = RawDisplayHandle::Xlib(raw_window_handle::XlibDisplayHandle::new(None, 0));
        let names = surface_extension_names(&xlib).unwrap();
        assert_eq!(
            names,
            vec!["VK_KHR_surface".to_string(), "VK_KHR_xlib_surface".to_string()]
        );

        let windows = RawDisplayHandle::Windows(raw_window_handle::WindowsDisplayHandle::new());
        let names = surface_extension_names(&windows).unwrap();
        assert_eq!(names[1], "VK_KHR_win32_surface");
    }
}
