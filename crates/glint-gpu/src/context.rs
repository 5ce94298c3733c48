//! GPU context management.
//!
//! The [`Context`] owns everything the control path needs: the logical
//! device, one graphics queue, one command pool with one reusable primary
//! command buffer, the ray-tracing extension loaders resolved once at device
//! creation, and the monotonic fence. Every submission is followed by a
//! blocking fence wait before the command buffer is reused, so a single
//! recording is ever in flight.

use crate::capabilities::{required_ray_tracing_extensions, GpuCapabilities};
use crate::command::{self, CommandPool};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::Allocator;
use crate::sync::TimelineFence;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct Context {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<Allocator>,

    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,

    pub(crate) command_pool: CommandPool,
    pub(crate) cmd: vk::CommandBuffer,

    // Extension entry points, resolved once at device creation and threaded
    // through the context instead of living in file-scope tables.
    pub(crate) accel_loader: ash::khr::acceleration_structure::Device,
    pub(crate) rt_pipeline_loader: ash::khr::ray_tracing_pipeline::Device,

    pub(crate) fence: TimelineFence,
}

impl Context {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Get the graphics queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Get the graphics queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// The reusable primary command buffer.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Acceleration structure extension entry points.
    pub fn accel_loader(&self) -> &ash::khr::acceleration_structure::Device {
        &self.accel_loader
    }

    /// Ray tracing pipeline extension entry points.
    pub fn rt_pipeline_loader(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.rt_pipeline_loader
    }

    /// The context's monotonic fence.
    pub fn fence(&self) -> &TimelineFence {
        &self.fence
    }

    /// Reset the command pool and open the reusable command buffer for
    /// recording.
    ///
    /// # Safety
    /// The previous submission using this buffer must have been waited on.
    pub unsafe fn begin_recording(&self) -> Result<vk::CommandBuffer> {
        self.command_pool.reset(&self.device)?;
        command::begin_command_buffer(&self.device, self.cmd)?;
        Ok(self.cmd)
    }

    /// Close the reusable command buffer and submit it, signalling the next
    /// fence value. Does not wait.
    ///
    /// # Safety
    /// The command buffer must be in recording state.
    pub unsafe fn submit_recorded(&self) -> Result<u64> {
        command::end_command_buffer(&self.device, self.cmd)?;
        command::submit_with_fence(&self.device, self.queue, self.cmd, &self.fence)
    }

    /// Record commands into the reusable command buffer, submit them, and
    /// block until the GPU has finished executing them.
    ///
    /// Returns the fence value the submission signalled. The command pool is
    /// reset first, which is safe because the previous submission was also
    /// waited on before this call.
    pub fn submit_and_wait<F>(&self, record: F) -> Result<u64>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        unsafe {
            let cmd = self.begin_recording()?;
            record(cmd)?;
            let value = self.submit_recorded()?;
            self.fence.wait_blocking(&self.device, value)?;
            Ok(value)
        }
    }

    /// Block until all previously submitted work completes.
    pub fn sync(&self) -> Result<()> {
        unsafe {
            let value = self.fence.last_value();
            if value > 0 {
                self.fence.wait_blocking(&self.device, value)?;
            }
        }
        Ok(())
    }

    /// Wait for the device to be fully idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Free all VkDeviceMemory before destroying the device
            self.allocator.lock().shutdown();

            self.fence.destroy(&self.device);
            self.command_pool.destroy(&self.device);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct ContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Glint".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl ContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    ///
    /// Fails with [`GpuError::RayTracingUnsupported`] when the selected
    /// device lacks the ray-tracing extension set; initialization is never
    /// retried with reduced requirements.
    pub fn build(self) -> Result<Context> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        if !capabilities.meets_requirements() {
            return Err(GpuError::RayTracingUnsupported(capabilities.summary()));
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_family = unsafe { find_graphics_queue_family(&instance, physical_device) }?;

        let (device, queue) =
            unsafe { create_device(&instance, physical_device, queue_family)? };

        let device = Arc::new(device);

        let accel_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);

        let allocator = unsafe { Allocator::new(&instance, device.clone(), physical_device) }?;

        let command_pool = unsafe {
            CommandPool::new(
                &device,
                queue_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }?;
        let cmd = unsafe { command_pool.allocate_command_buffer(&device) }?;

        let fence = unsafe { TimelineFence::new(&device) }?;

        Ok(Context {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            queue_family,
            queue,
            command_pool,
            cmd,
            accel_loader,
            rt_pipeline_loader,
            fence,
        })
    }
}

/// Find a graphics-capable queue family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    queue_families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Create the logical device with the ray-tracing feature chain and retrieve
/// the single graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority));

    let extensions = required_ray_tracing_extensions();
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .timeline_semaphore(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true);

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    let mut accel_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);

    let mut rt_pipeline_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
        .ray_tracing_pipeline(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut accel_features)
        .push_next(&mut rt_pipeline_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let queue = device.get_device_queue(queue_family, 0);

    Ok((device, queue))
}
