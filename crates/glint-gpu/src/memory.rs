//! GPU memory management.

use crate::barrier::ResourceState;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator as VulkanAllocator,
    AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Memory class of an allocation.
///
/// Three classes cover the whole control path: CPU-written upload staging,
/// GPU-only working memory, and GPU-written readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// CPU-writable, GPU-readable staging memory.
    Upload,
    /// GPU-only memory; mapping is forbidden.
    DeviceLocal,
    /// GPU-writable, CPU-readable memory.
    Readback,
}

impl MemoryClass {
    /// Whether host mapping is valid for this class.
    pub const fn host_visible(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }

    const fn location(self) -> MemoryLocation {
        match self {
            Self::Upload => MemoryLocation::CpuToGpu,
            Self::DeviceLocal => MemoryLocation::GpuOnly,
            Self::Readback => MemoryLocation::GpuToCpu,
        }
    }
}

/// GPU memory allocator wrapper.
pub struct Allocator {
    allocator: Option<VulkanAllocator>,
    device: Arc<ash::Device>,
}

impl Allocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = VulkanAllocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Allocate a buffer in the given memory class.
    ///
    /// The buffer starts in `initial_state`; subsequent uses in a different
    /// state must record a transition first.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        class: MemoryClass,
        initial_state: ResourceState,
        name: &str,
    ) -> Result<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: class.location(),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(GpuError::from)?;
        }

        Ok(Buffer {
            buffer,
            allocation: Some(allocation),
            size,
            class,
            state: initial_state,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut Buffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate a device-local 2D image.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        name: &str,
    ) -> Result<Image> {
        let image = unsafe {
            self.device
                .create_image(create_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(GpuError::from)?;
        }

        Ok(Image {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
            state: ResourceState::Undefined,
        })
    }

    /// Free an image allocation.
    pub fn free_image(&mut self, image: &mut Image) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }

    fn inner(&mut self) -> Result<&mut VulkanAllocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation, memory class, and access-state tag.
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub(crate) allocation: Option<Allocation>,
    pub size: u64,
    class: MemoryClass,
    state: ResourceState,
}

impl Buffer {
    /// Memory class the buffer was allocated in.
    pub fn class(&self) -> MemoryClass {
        self.class
    }

    /// Current access-state tag.
    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Update the access-state tag. Called by the barrier helpers after
    /// recording a transition.
    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }

    /// Get the device address of this buffer.
    ///
    /// The buffer must have been created with `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// Map the buffer memory for host access.
    ///
    /// Mapping a device-local buffer is a programmer error and is rejected.
    pub fn mapped_ptr(&self) -> Result<*mut u8> {
        if !self.class.host_visible() {
            return Err(GpuError::InvalidState(
                "cannot map a device-local buffer".to_string(),
            ));
        }
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))
    }

    /// Write typed data into the buffer (Upload class only).
    pub fn write<T: Copy>(&self, data: &[T]) -> Result<()> {
        let ptr = self.mapped_ptr()?;

        let byte_size = std::mem::size_of_val(data);
        if byte_size as u64 > self.size {
            return Err(GpuError::InvalidState(
                "Data too large for buffer".to_string(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr().cast::<u8>(), ptr, byte_size);
        }

        Ok(())
    }

    /// Write raw bytes to the buffer at the given offset.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.mapped_ptr()?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Read raw bytes from the buffer (Readback class) at the given offset.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let ptr = self.mapped_ptr()?;

        let end = offset
            .checked_add(out.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Read range too large for buffer".to_string(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }

        Ok(())
    }
}

/// A GPU image with its allocation and access-state tag.
pub struct Image {
    pub image: vk::Image,
    pub(crate) allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    state: ResourceState,
}

impl Image {
    /// Current access-state tag.
    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_visibility_by_class() {
        assert!(MemoryClass::Upload.host_visible());
        assert!(MemoryClass::Readback.host_visible());
        assert!(!MemoryClass::DeviceLocal.host_visible());
    }

    #[test]
    fn mapping_device_local_is_rejected() {
        let buffer = Buffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 64,
            class: MemoryClass::DeviceLocal,
            state: ResourceState::Undefined,
        };
        assert!(buffer.mapped_ptr().is_err());
        assert!(buffer.write(&[0u8; 4]).is_err());
    }
}
