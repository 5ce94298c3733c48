//! Shader binding table layout and writer.
//!
//! The SBT is one flat host-visible buffer laid out raygen | miss | hit.
//! Record strides within a region are padded to the device's handle
//! alignment and each region starts on the group base alignment. Hit records
//! are ordered `[primary, occlusion]` per mesh, matching the instance
//! records' SBT offset of `index * RAY_TYPE_COUNT`. Primary hit records
//! carry the mesh's vertex and index buffer device addresses directly after
//! the group handle; occlusion records need no geometry and hold the handle
//! alone. The raygen record is also handle-only: the descriptor-heap slot
//! the contract reserves there turned out to be unnecessary and is left
//! unwritten.

use ash::vk;
use glint_core::constants::RAY_TYPE_COUNT;
use glint_gpu::{Buffer, Context, MemoryClass, ResourceState};

use crate::error::Result;
use crate::mesh::GpuMesh;
use crate::pipeline::{RayTracingPipeline, LEADING_GROUP_COUNT};

/// Bytes of shader record data in a primary hit record: vertex buffer
/// address then index buffer address.
pub const HIT_RECORD_DATA_SIZE: u32 = 16;

/// Number of miss records (primary, occlusion).
pub const MISS_RECORD_COUNT: u32 = 2;

/// Align `value` up to a power-of-two `alignment`.
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Byte layout of the shader binding table, derived from the device's
/// handle size and alignments plus the mesh count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    /// Stride of raygen and miss records (handle only).
    pub handle_stride: u32,
    /// Stride of hit records (handle + record data).
    pub hit_stride: u32,
    pub miss_offset: u32,
    pub hit_offset: u32,
    pub hit_record_count: u32,
    pub total_size: u32,
}

impl SbtLayout {
    /// Compute the layout for `mesh_count` meshes.
    pub fn new(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        mesh_count: u32,
    ) -> Self {
        let handle_stride = align_up(handle_size, handle_alignment);
        let hit_stride = align_up(handle_size + HIT_RECORD_DATA_SIZE, handle_alignment);
        let hit_record_count = mesh_count * RAY_TYPE_COUNT;

        let miss_offset = align_up(handle_stride, base_alignment);
        let hit_offset = align_up(miss_offset + MISS_RECORD_COUNT * handle_stride, base_alignment);
        let total_size = hit_offset + hit_record_count * hit_stride;

        Self {
            handle_size,
            handle_stride,
            hit_stride,
            miss_offset,
            hit_offset,
            hit_record_count,
            total_size,
        }
    }

    /// Byte offset of miss record `i`.
    pub fn miss_record_offset(&self, i: u32) -> u32 {
        self.miss_offset + i * self.handle_stride
    }

    /// Byte offset of hit record `i`.
    pub fn hit_record_offset(&self, i: u32) -> u32 {
        self.hit_offset + i * self.hit_stride
    }
}

/// The shader binding table buffer and its dispatch regions.
pub struct ShaderBindingTable {
    buffer: Buffer,
    layout: SbtLayout,
    raygen_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,
    callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Build and fully write the SBT for the given pipeline and meshes.
    ///
    /// All records are written within one mapping of the buffer before any
    /// dispatch can reference it.
    ///
    /// # Safety
    /// The context must be valid; the pipeline must have been created for
    /// exactly `meshes.len()` meshes.
    pub unsafe fn new(
        ctx: &Context,
        pipeline: &RayTracingPipeline,
        meshes: &[GpuMesh],
    ) -> Result<Self> {
        let device = ctx.device();
        let capabilities = ctx.capabilities();

        let layout = SbtLayout::new(
            capabilities.shader_group_handle_size,
            capabilities.shader_group_handle_alignment,
            capabilities.shader_group_base_alignment,
            meshes.len() as u32,
        );

        let handles = ctx.rt_pipeline_loader().get_ray_tracing_shader_group_handles(
            pipeline.handle(),
            0,
            pipeline.group_count(),
            (layout.handle_size * pipeline.group_count()) as usize,
        )?;
        let handle = |group: u32| group_handle(&handles, layout.handle_size, group);

        let buffer = ctx.allocator().lock().create_buffer(
            u64::from(layout.total_size),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryClass::Upload,
            ResourceState::ShaderRead,
            "shader_binding_table",
        )?;

        // One write window for every record.
        let base = buffer.mapped_ptr()?;
        let write = |offset: u32, bytes: &[u8]| {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset as usize), bytes.len());
        };

        write(0, handle(0));
        for miss in 0..MISS_RECORD_COUNT {
            write(layout.miss_record_offset(miss), handle(1 + miss));
        }
        for (i, mesh) in meshes.iter().enumerate() {
            let i = i as u32;
            let primary_group = LEADING_GROUP_COUNT + i * RAY_TYPE_COUNT;

            let primary_offset = layout.hit_record_offset(i * RAY_TYPE_COUNT);
            write(primary_offset, handle(primary_group));
            write(
                primary_offset + layout.handle_size,
                &mesh.vertex_address(device).to_le_bytes(),
            );
            write(
                primary_offset + layout.handle_size + 8,
                &mesh.index_address(device).to_le_bytes(),
            );

            write(
                layout.hit_record_offset(i * RAY_TYPE_COUNT + 1),
                handle(primary_group + 1),
            );
        }

        let address = buffer.device_address(device);
        // Raygen stride and size must be equal (single-record region).
        let raygen_region = vk::StridedDeviceAddressRegionKHR {
            device_address: address,
            stride: u64::from(layout.handle_stride),
            size: u64::from(layout.handle_stride),
        };
        let miss_region = vk::StridedDeviceAddressRegionKHR {
            device_address: address + u64::from(layout.miss_offset),
            stride: u64::from(layout.handle_stride),
            size: u64::from(MISS_RECORD_COUNT * layout.handle_stride),
        };
        let hit_region = vk::StridedDeviceAddressRegionKHR {
            device_address: address + u64::from(layout.hit_offset),
            stride: u64::from(layout.hit_stride),
            size: u64::from(layout.hit_record_count * layout.hit_stride),
        };
        let callable_region = vk::StridedDeviceAddressRegionKHR::default();

        Ok(Self {
            buffer,
            layout,
            raygen_region,
            miss_region,
            hit_region,
            callable_region,
        })
    }

    /// The computed byte layout.
    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Dispatch regions in trace-rays argument order.
    pub fn regions(
        &self,
    ) -> (
        &vk::StridedDeviceAddressRegionKHR,
        &vk::StridedDeviceAddressRegionKHR,
        &vk::StridedDeviceAddressRegionKHR,
        &vk::StridedDeviceAddressRegionKHR,
    ) {
        (
            &self.raygen_region,
            &self.miss_region,
            &self.hit_region,
            &self.callable_region,
        )
    }

    /// Free the SBT buffer.
    ///
    /// # Safety
    /// The context must be valid and no dispatch may still reference the SBT.
    pub unsafe fn destroy(&mut self, ctx: &Context) -> Result<()> {
        ctx.allocator().lock().free_buffer(&mut self.buffer)?;
        Ok(())
    }
}

fn group_handle(handles: &[u8], handle_size: u32, group: u32) -> &[u8] {
    let start = (group * handle_size) as usize;
    &handles[start..start + handle_size as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(0, 64), 0);
    }

    #[test]
    fn layout_for_two_meshes() {
        // Typical device: 32-byte handles, 32/64 alignments.
        let layout = SbtLayout::new(32, 32, 64, 2);
        assert_eq!(layout.handle_stride, 32);
        // 32 + 16 record data, padded back up to the handle alignment.
        assert_eq!(layout.hit_stride, 64);
        assert_eq!(layout.hit_record_count, 4);
        assert_eq!(layout.miss_offset, 64);
        // Miss region ends at 128, already base-aligned.
        assert_eq!(layout.hit_offset, 128);
        assert_eq!(layout.total_size, 128 + 4 * 64);
    }

    #[test]
    fn regions_start_on_base_alignment() {
        for mesh_count in 1..8 {
            let layout = SbtLayout::new(32, 64, 256, mesh_count);
            assert_eq!(layout.miss_offset % 256, 0);
            assert_eq!(layout.hit_offset % 256, 0);
            assert_eq!(layout.hit_record_count, mesh_count * 2);
        }
    }

    #[test]
    fn record_offsets_stride_within_regions() {
        let layout = SbtLayout::new(32, 32, 64, 3);
        assert_eq!(layout.miss_record_offset(1) - layout.miss_record_offset(0), 32);
        assert_eq!(layout.hit_record_offset(1) - layout.hit_record_offset(0), 64);
        // Mesh 2's primary record sits at hit index 4.
        assert_eq!(
            layout.hit_record_offset(4),
            layout.hit_offset + 4 * layout.hit_stride
        );
    }
}
