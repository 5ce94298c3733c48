//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device extensions required for the ray-tracing control path.
pub fn required_ray_tracing_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::deferred_host_operations::NAME,
    ]
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Whole ray-tracing extension set present
    pub supports_ray_tracing: bool,
    /// Buffer device address support (core in 1.2, required for SBT regions)
    pub supports_buffer_device_address: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Shader group handle size from the ray-tracing pipeline properties.
    pub shader_group_handle_size: u32,
    /// Alignment of each record within an SBT region.
    pub shader_group_handle_alignment: u32,
    /// Alignment of each SBT region start address.
    pub shader_group_base_alignment: u32,
    /// Driver limit on pipeline recursion depth.
    pub max_ray_recursion_depth: u32,

    /// Available device extensions.
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut rt_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let supports_ray_tracing = required_ray_tracing_extensions()
            .iter()
            .all(|name| available_extensions.contains(name.to_str().unwrap_or_default()));

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_2 = vk::api_version_major(api_version) >= 1
            && vk::api_version_minor(api_version) >= 2;

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,
            supports_ray_tracing,
            supports_buffer_device_address: has_vulkan_1_2
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            device_local_memory_mb,
            shader_group_handle_size: rt_properties.shader_group_handle_size,
            shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
            shader_group_base_alignment: rt_properties.shader_group_base_alignment,
            max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements for the renderer.
    ///
    /// Ray-tracing support is hard-required; there is no fallback path.
    pub fn meets_requirements(&self) -> bool {
        if !self.supports_ray_tracing {
            return false;
        }
        if !self.supports_buffer_device_address {
            return false;
        }

        // Recursion depth 1 is the pipeline contract
        if self.max_ray_recursion_depth < 1 {
            return false;
        }

        true
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - SBT handle {}B align {}/{}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.shader_group_handle_size,
            self.shader_group_handle_alignment,
            self.shader_group_base_alignment,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn ray_tracing_extension_set() {
        let names = required_ray_tracing_extensions();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&ash::khr::acceleration_structure::NAME));
    }
}
