// Rendering-hardware-interface boundary
//
// The device manager consumes the renderer's device object through this
// narrow contract: command-list open/close/execute, wrapping native swap
// chain images as textures, completion markers (event queries) for frame
// throttling, and queue-scoped semaphore waits/signals. Command recording,
// resource creation and pipeline state live on the other side of this
// boundary and are none of our business.

use std::collections::HashSet;

use anyhow::{bail, Result};
use ash::vk;

/// Queues the render device can address when scheduling semaphores and
/// completion markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandQueue {
    Graphics,
    Compute,
    Transfer,
}

/// State a wrapped texture is in when handed over. With
/// `keep_initial_state` set the wrapper must never transition the texture
/// away from this state on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    RenderTarget,
    Present,
}

/// Description attached to a native image wrapped as a renderer texture.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub debug_name: String,
    pub initial_state: ResourceState,
    pub keep_initial_state: bool,
    pub is_render_target: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandListHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventQueryHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// The opaque renderer device object, as seen from the device manager.
pub trait RenderDevice {
    fn create_command_list(&mut self) -> Result<CommandListHandle>;
    fn open_command_list(&mut self, list: CommandListHandle) -> Result<()>;
    fn close_command_list(&mut self, list: CommandListHandle) -> Result<()>;
    fn execute_command_list(&mut self, list: CommandListHandle) -> Result<()>;
    fn release_command_list(&mut self, list: CommandListHandle);

    fn create_handle_for_native_texture(
        &mut self,
        desc: &TextureDesc,
        image: vk::Image,
    ) -> Result<TextureHandle>;
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Blocks until the GPU has drained every queue. Called before objects
    /// the GPU may still reference are destroyed.
    fn wait_idle(&mut self);

    fn create_event_query(&mut self) -> Result<EventQueryHandle>;
    fn reset_event_query(&mut self, query: EventQueryHandle) -> Result<()>;
    /// Arms the query to fire when all work currently submitted to `queue`
    /// has completed on the GPU.
    fn set_event_query(&mut self, query: EventQueryHandle, queue: CommandQueue) -> Result<()>;
    /// Blocks the calling thread until the query has fired.
    fn wait_event_query(&mut self, query: EventQueryHandle) -> Result<()>;

    fn queue_wait_for_semaphore(
        &mut self,
        queue: CommandQueue,
        semaphore: vk::Semaphore,
        value: u64,
    ) -> Result<()>;
    fn queue_signal_semaphore(
        &mut self,
        queue: CommandQueue,
        semaphore: vk::Semaphore,
        value: u64,
    ) -> Result<()>;
}

/// Everything the renderer needs to construct its device object around the
/// raw Vulkan handles the manager created.
pub struct DeviceDesc {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_index: u32,
    pub compute_queue: Option<vk::Queue>,
    pub compute_queue_index: Option<u32>,
    pub transfer_queue: Option<vk::Queue>,
    pub transfer_queue_index: Option<u32>,
    pub instance_extensions: Vec<String>,
    pub device_extensions: Vec<String>,
}

/// Factory the surrounding renderer supplies; called exactly once, after the
/// logical device is created.
pub trait RenderDeviceFactory {
    fn create_render_device(&self, desc: DeviceDesc) -> Result<Box<dyn RenderDevice>>;
}

/// Bookkeeping wrapper that validates handle usage before forwarding to the
/// wrapped device. Installed when `enable_validation_layer` is set; all
/// subsequent operations go through whichever wrapper is outermost.
pub struct ValidationRenderDevice {
    inner: Box<dyn RenderDevice>,
    live_lists: HashSet<CommandListHandle>,
    open_lists: HashSet<CommandListHandle>,
    live_queries: HashSet<EventQueryHandle>,
    live_textures: HashSet<TextureHandle>,
}

impl ValidationRenderDevice {
    pub fn new(inner: Box<dyn RenderDevice>) -> Self {
        Self {
            inner,
            live_lists: HashSet::new(),
            open_lists: HashSet::new(),
            live_queries: HashSet::new(),
            live_textures: HashSet::new(),
        }
    }
}

impl RenderDevice for ValidationRenderDevice {
    fn create_command_list(&mut self) -> Result<CommandListHandle> {
        let list = self.inner.create_command_list()?;
        self.live_lists.insert(list);
        Ok(list)
    }

    fn open_command_list(&mut self, list: CommandListHandle) -> Result<()> {
        if !self.live_lists.contains(&list) {
            bail!("open_command_list: unknown command list {:?}", list);
        }
        if !self.open_lists.insert(list) {
            bail!("open_command_list: command list {:?} is already open", list);
        }
        self.inner.open_command_list(list)
    }

    fn close_command_list(&mut self, list: CommandListHandle) -> Result<()> {
        if !self.open_lists.remove(&list) {
            bail!("close_command_list: command list {:?} is not open", list);
        }
        self.inner.close_command_list(list)
    }

    fn execute_command_list(&mut self, list: CommandListHandle) -> Result<()> {
        if !self.live_lists.contains(&list) {
            bail!("execute_command_list: unknown command list {:?}", list);
        }
        if self.open_lists.contains(&list) {
            bail!("execute_command_list: command list {:?} is still open", list);
        }
        self.inner.execute_command_list(list)
    }

    fn release_command_list(&mut self, list: CommandListHandle) {
        if !self.live_lists.remove(&list) {
            log::error!("release_command_list: unknown command list {:?}", list);
            return;
        }
        self.open_lists.remove(&list);
        self.inner.release_command_list(list);
    }

    fn create_handle_for_native_texture(
        &mut self,
        desc: &TextureDesc,
        image: vk::Image,
    ) -> Result<TextureHandle> {
        let texture = self.inner.create_handle_for_native_texture(desc, image)?;
        self.live_textures.insert(texture);
        Ok(texture)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if !self.live_textures.remove(&texture) {
            log::error!("destroy_texture: unknown texture {:?}", texture);
            return;
        }
        self.inner.destroy_texture(texture);
    }

    fn wait_idle(&mut self) {
        self.inner.wait_idle();
    }

    fn create_event_query(&mut self) -> Result<EventQueryHandle> {
        let query = self.inner.create_event_query()?;
        self.live_queries.insert(query);
        Ok(query)
    }

    fn reset_event_query(&mut self, query: EventQueryHandle) -> Result<()> {
        if !self.live_queries.contains(&query) {
            bail!("reset_event_query: unknown event query {:?}", query);
        }
        self.inner.reset_event_query(query)
    }

    fn set_event_query(&mut self, query: EventQueryHandle, queue: CommandQueue) -> Result<()> {
        if !self.live_queries.contains(&query) {
            bail!("set_event_query: unknown event query {:?}", query);
        }
        self.inner.set_event_query(query, queue)
    }

    fn wait_event_query(&mut self, query: EventQueryHandle) -> Result<()> {
        if !self.live_queries.contains(&query) {
            bail!("wait_event_query: unknown event query {:?}", query);
        }
        self.inner.wait_event_query(query)
    }

    fn queue_wait_for_semaphore(
        &mut self,
        queue: CommandQueue,
        semaphore: vk::Semaphore,
        value: u64,
    ) -> Result<()> {
        self.inner.queue_wait_for_semaphore(queue, semaphore, value)
    }

    fn queue_signal_semaphore(
        &mut self,
        queue: CommandQueue,
        semaphore: vk::Semaphore,
        value: u64,
    ) -> Result<()> {
        self.inner.queue_signal_semaphore(queue, semaphore, value)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory render device that records every call, used by the frame
    /// pacing and validation tests.
    #[derive(Default)]
    pub struct RecordingDevice {
        next_handle: u64,
        pub created_lists: Vec<CommandListHandle>,
        pub opened_lists: Vec<CommandListHandle>,
        pub closed_lists: Vec<CommandListHandle>,
        pub executed_lists: Vec<CommandListHandle>,
        pub released_lists: Vec<CommandListHandle>,
        pub created_textures: Vec<TextureHandle>,
        pub created_texture_descs: Vec<TextureDesc>,
        pub destroyed_textures: Vec<TextureHandle>,
        /// Destroyed-texture count observed at the time of each idle wait,
        /// so tests can assert the wait-before-destroy ordering.
        pub idle_waits: Vec<usize>,
        pub created_queries: Vec<EventQueryHandle>,
        pub reset_queries: Vec<EventQueryHandle>,
        pub armed_queries: Vec<(EventQueryHandle, CommandQueue)>,
        pub waited_queries: Vec<EventQueryHandle>,
        pub semaphore_waits: Vec<(CommandQueue, vk::Semaphore)>,
        pub semaphore_signals: Vec<(CommandQueue, vk::Semaphore)>,
    }

    impl RecordingDevice {
        fn next(&mut self) -> u64 {
            self.next_handle += 1;
            self.next_handle
        }
    }

    impl RenderDevice for RecordingDevice {
        fn create_command_list(&mut self) -> Result<CommandListHandle> {
            let list = CommandListHandle(self.next());
            self.created_lists.push(list);
            Ok(list)
        }

        fn open_command_list(&mut self, list: CommandListHandle) -> Result<()> {
            self.opened_lists.push(list);
            Ok(())
        }

        fn close_command_list(&mut self, list: CommandListHandle) -> Result<()> {
            self.closed_lists.push(list);
            Ok(())
        }

        fn execute_command_list(&mut self, list: CommandListHandle) -> Result<()> {
            self.executed_lists.push(list);
            Ok(())
        }

        fn release_command_list(&mut self, list: CommandListHandle) {
            self.released_lists.push(list);
        }

        fn create_handle_for_native_texture(
            &mut self,
            desc: &TextureDesc,
            _image: vk::Image,
        ) -> Result<TextureHandle> {
            let texture = TextureHandle(self.next());
            self.created_textures.push(texture);
            self.created_texture_descs.push(desc.clone());
            Ok(texture)
        }

        fn destroy_texture(&mut self, texture: TextureHandle) {
            self.destroyed_textures.push(texture);
        }

        fn wait_idle(&mut self) {
            self.idle_waits.push(self.destroyed_textures.len());
        }

        fn create_event_query(&mut self) -> Result<EventQueryHandle> {
            let query = EventQueryHandle(self.next());
            self.created_queries.push(query);
            Ok(query)
        }

        fn reset_event_query(&mut self, query: EventQueryHandle) -> Result<()> {
            self.reset_queries.push(query);
            Ok(())
        }

        fn set_event_query(&mut self, query: EventQueryHandle, queue: CommandQueue) -> Result<()> {
            self.armed_queries.push((query, queue));
            Ok(())
        }

        fn wait_event_query(&mut self, query: EventQueryHandle) -> Result<()> {
            self.waited_queries.push(query);
            Ok(())
        }

        fn queue_wait_for_semaphore(
            &mut self,
            queue: CommandQueue,
            semaphore: vk::Semaphore,
            _value: u64,
        ) -> Result<()> {
            self.semaphore_waits.push((queue, semaphore));
            Ok(())
        }

        fn queue_signal_semaphore(
            &mut self,
            queue: CommandQueue,
            semaphore: vk::Semaphore,
            _value: u64,
        ) -> Result<()> {
            self.semaphore_signals.push((queue, semaphore));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingDevice;
    use super::*;

    #[test]
    fn validation_rejects_double_open() {
        let mut device = ValidationRenderDevice::new(Box::<RecordingDevice>::default());
        let list = device.create_command_list().unwrap();
        device.open_command_list(list).unwrap();
        assert!(device.open_command_list(list).is_err());
    }

    #[test]
    fn validation_rejects_executing_an_open_list() {
        let mut device = ValidationRenderDevice::new(Box::<RecordingDevice>::default());
        let list = device.create_command_list().unwrap();
        device.open_command_list(list).unwrap();
        assert!(device.execute_command_list(list).is_err());
        device.close_command_list(list).unwrap();
        assert!(device.execute_command_list(list).is_ok());
    }

    #[test]
    fn validation_rejects_unknown_query_handles() {
        let mut device = ValidationRenderDevice::new(Box::<RecordingDevice>::default());
        assert!(device.wait_event_query(EventQueryHandle(42)).is_err());
        let query = device.create_event_query().unwrap();
        assert!(device.wait_event_query(query).is_ok());
    }
}
