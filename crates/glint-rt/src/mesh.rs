//! Per-mesh GPU resources and bottom-level acceleration structures.
//!
//! Each mesh is uploaded and built strictly serially, one fence-guarded
//! submission at a time, so peak scratch memory stays bounded by the largest
//! single mesh. The BLAS is built with compaction allowed, its compacted size
//! is read back through a query pool, and the structure is then copied into a
//! tightly sized allocation before the oversized original is destroyed.

use ash::vk;
use glint_core::MeshData;
use glint_gpu::{transition_buffer, Buffer, Context, MemoryClass, ResourceState};

use crate::error::{RenderError, Result};

/// Build progress of a mesh's acceleration structure.
///
/// Transitions happen only in declaration order; driving a mesh out of order
/// is an error. Once `Finalized` the mesh is immutable and only the compacted
/// structure is ever referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlasStage {
    /// Geometry is resident in device-local buffers.
    Uploaded,
    /// Full-size structure built, compacted size known.
    Built,
    /// Copy into the tight allocation is in flight.
    Compacting,
    /// Compacted structure is the sole remaining handle.
    Finalized,
}

impl BlasStage {
    /// The only stage this one may advance to.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Uploaded => Some(Self::Built),
            Self::Built => Some(Self::Compacting),
            Self::Compacting => Some(Self::Finalized),
            Self::Finalized => None,
        }
    }
}

/// A mesh resident on the GPU together with its BLAS.
pub struct GpuMesh {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    vertex_count: u32,
    triangle_count: u32,
    material_id: u32,

    acceleration_structure: vk::AccelerationStructureKHR,
    blas_buffer: Option<Buffer>,
    blas_address: vk::DeviceAddress,
    compacted_size: u64,
    full_size: u64,

    stage: BlasStage,
}

impl GpuMesh {
    /// Upload vertex and index data into device-local buffers.
    ///
    /// Records the staging copies and the barriers to build-input access in
    /// one submission and waits for it, so the staging buffers can be freed
    /// before returning.
    ///
    /// # Safety
    /// The context must be valid.
    pub unsafe fn upload(ctx: &Context, mesh: &MeshData) -> Result<Self> {
        let device = ctx.device();

        let vertex_bytes = mesh.vertex_bytes();
        let index_bytes = mesh.index_bytes();

        let (vertex_upload, index_upload, mut vertex_buffer, mut index_buffer) = {
            let mut allocator = ctx.allocator().lock();

            let vertex_upload = allocator.create_buffer(
                vertex_bytes,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryClass::Upload,
                ResourceState::Undefined,
                "mesh_vertex_upload",
            )?;
            vertex_upload.write(&mesh.vertices)?;

            let index_upload = allocator.create_buffer(
                index_bytes,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryClass::Upload,
                ResourceState::Undefined,
                "mesh_index_upload",
            )?;
            index_upload.write(&mesh.indices)?;

            let device_usage = vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

            let vertex_buffer = allocator.create_buffer(
                vertex_bytes,
                device_usage,
                MemoryClass::DeviceLocal,
                ResourceState::Undefined,
                "mesh_vertex_buffer",
            )?;
            let index_buffer = allocator.create_buffer(
                index_bytes,
                device_usage,
                MemoryClass::DeviceLocal,
                ResourceState::Undefined,
                "mesh_index_buffer",
            )?;

            (vertex_upload, index_upload, vertex_buffer, index_buffer)
        };

        ctx.submit_and_wait(|cmd| {
            transition_buffer(device, cmd, &mut vertex_buffer, ResourceState::CopyDst);
            transition_buffer(device, cmd, &mut index_buffer, ResourceState::CopyDst);

            let vertex_copy = vk::BufferCopy::default().size(vertex_bytes);
            device.cmd_copy_buffer(
                cmd,
                vertex_upload.buffer,
                vertex_buffer.buffer,
                std::slice::from_ref(&vertex_copy),
            );
            let index_copy = vk::BufferCopy::default().size(index_bytes);
            device.cmd_copy_buffer(
                cmd,
                index_upload.buffer,
                index_buffer.buffer,
                std::slice::from_ref(&index_copy),
            );

            transition_buffer(device, cmd, &mut vertex_buffer, ResourceState::AccelBuildInput);
            transition_buffer(device, cmd, &mut index_buffer, ResourceState::AccelBuildInput);
            Ok(())
        })?;

        {
            let mut allocator = ctx.allocator().lock();
            let mut vertex_upload = vertex_upload;
            let mut index_upload = index_upload;
            allocator.free_buffer(&mut vertex_upload)?;
            allocator.free_buffer(&mut index_upload)?;
        }

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count: mesh.vertices.len() as u32,
            triangle_count: mesh.triangle_count(),
            material_id: mesh.material_id,
            acceleration_structure: vk::AccelerationStructureKHR::null(),
            blas_buffer: None,
            blas_address: 0,
            compacted_size: 0,
            full_size: 0,
            stage: BlasStage::Uploaded,
        })
    }

    /// Build the full-size BLAS and read back its compacted size.
    ///
    /// The build allows compaction and writes the compacted size into a
    /// one-slot query pool inside the same submission. Scratch memory is
    /// freed before returning.
    ///
    /// # Safety
    /// The context must be valid and `upload` must have completed.
    pub unsafe fn build_blas(&mut self, ctx: &Context) -> Result<()> {
        self.expect_stage(BlasStage::Uploaded)?;

        let device = ctx.device();
        let accel = ctx.accel_loader();

        let geometry = self.triangle_geometry(device);
        let build_sizes = {
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(build_flags())
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(std::slice::from_ref(&geometry));

            let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
            accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[self.triangle_count],
                &mut sizes,
            );
            sizes
        };

        let (blas_buffer, mut scratch_buffer) = {
            let mut allocator = ctx.allocator().lock();
            let blas_buffer = allocator.create_buffer(
                build_sizes.acceleration_structure_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryClass::DeviceLocal,
                ResourceState::Undefined,
                "blas_buffer",
            )?;
            let scratch_buffer = allocator.create_buffer(
                build_sizes.build_scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryClass::DeviceLocal,
                ResourceState::Undefined,
                "blas_scratch",
            )?;
            (blas_buffer, scratch_buffer)
        };

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(blas_buffer.buffer)
            .offset(0)
            .size(build_sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        let acceleration_structure = accel.create_acceleration_structure(&create_info, None)?;

        let query_pool_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(1);
        let query_pool = device.create_query_pool(&query_pool_info, None)?;

        let scratch_address = scratch_buffer.device_address(device);
        let submit_result = ctx.submit_and_wait(|cmd| {
            device.cmd_reset_query_pool(cmd, query_pool, 0, 1);

            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(build_flags())
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .dst_acceleration_structure(acceleration_structure)
                .geometries(std::slice::from_ref(&geometry))
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch_address,
                });

            let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(self.triangle_count);

            accel.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&build_range)],
            );

            // The compacted-size query reads the finished structure.
            let barrier = vk::MemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
                .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_COPY_KHR)
                .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
            let dependency_info =
                vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
            device.cmd_pipeline_barrier2(cmd, &dependency_info);

            accel.cmd_write_acceleration_structures_properties(
                cmd,
                std::slice::from_ref(&acceleration_structure),
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                query_pool,
                0,
            );
            Ok(())
        });

        let query_result = submit_result.and_then(|_| {
            let mut compacted = [0u64];
            device.get_query_pool_results(
                query_pool,
                0,
                &mut compacted,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
            Ok(compacted[0])
        });

        device.destroy_query_pool(query_pool, None);
        {
            let mut allocator = ctx.allocator().lock();
            allocator.free_buffer(&mut scratch_buffer)?;
        }

        let compacted_size = match query_result {
            Ok(size) => size,
            Err(e) => {
                accel.destroy_acceleration_structure(acceleration_structure, None);
                let mut blas_buffer = blas_buffer;
                ctx.allocator().lock().free_buffer(&mut blas_buffer)?;
                return Err(e.into());
            }
        };

        tracing::debug!(
            triangles = self.triangle_count,
            full_size = build_sizes.acceleration_structure_size,
            compacted_size,
            "built BLAS"
        );

        self.acceleration_structure = acceleration_structure;
        self.blas_buffer = Some(blas_buffer);
        self.full_size = build_sizes.acceleration_structure_size;
        self.compacted_size = compacted_size;
        self.advance(BlasStage::Built)
    }

    /// Copy the BLAS into a tightly sized allocation and drop the original.
    ///
    /// # Safety
    /// The context must be valid and `build_blas` must have completed.
    pub unsafe fn compact(&mut self, ctx: &Context) -> Result<()> {
        self.expect_stage(BlasStage::Built)?;
        self.advance(BlasStage::Compacting)?;

        let accel = ctx.accel_loader();

        let compact_buffer = ctx.allocator().lock().create_buffer(
            self.compacted_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryClass::DeviceLocal,
            ResourceState::Undefined,
            "blas_compact_buffer",
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(compact_buffer.buffer)
            .offset(0)
            .size(self.compacted_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        let compacted = accel.create_acceleration_structure(&create_info, None)?;

        let src = self.acceleration_structure;
        ctx.submit_and_wait(|cmd| {
            let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
                .src(src)
                .dst(compacted)
                .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
            accel.cmd_copy_acceleration_structure(cmd, &copy_info);
            Ok(())
        })?;

        // The oversized structure is dead from here on.
        accel.destroy_acceleration_structure(self.acceleration_structure, None);
        if let Some(mut old) = self.blas_buffer.take() {
            ctx.allocator().lock().free_buffer(&mut old)?;
        }

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(compacted);
        self.blas_address = accel.get_acceleration_structure_device_address(&address_info);
        self.acceleration_structure = compacted;
        self.blas_buffer = Some(compact_buffer);

        tracing::info!(
            full_size = self.full_size,
            compacted_size = self.compacted_size,
            "BLAS compacted"
        );

        self.advance(BlasStage::Finalized)
    }

    /// Current build stage.
    pub fn stage(&self) -> BlasStage {
        self.stage
    }

    /// Material table index the mesh was created with.
    pub fn material_id(&self) -> u32 {
        self.material_id
    }

    /// Number of triangles.
    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    /// Device address of the compacted BLAS. Errors before finalization.
    pub fn blas_address(&self) -> Result<vk::DeviceAddress> {
        if self.stage != BlasStage::Finalized {
            return Err(RenderError::StageOrder(format!(
                "BLAS address requested in stage {:?}",
                self.stage
            )));
        }
        Ok(self.blas_address)
    }

    /// Device address of the vertex buffer.
    pub fn vertex_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        self.vertex_buffer.device_address(device)
    }

    /// Device address of the index buffer.
    pub fn index_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        self.index_buffer.device_address(device)
    }

    fn triangle_geometry(
        &self,
        device: &ash::Device,
    ) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertex_buffer.device_address(device),
            })
            .vertex_stride(std::mem::size_of::<[f32; 3]>() as u64)
            .max_vertex(self.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.index_buffer.device_address(device),
            });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
    }

    fn expect_stage(&self, stage: BlasStage) -> Result<()> {
        if self.stage != stage {
            return Err(RenderError::StageOrder(format!(
                "expected stage {:?}, found {:?}",
                stage, self.stage
            )));
        }
        Ok(())
    }

    fn advance(&mut self, to: BlasStage) -> Result<()> {
        if self.stage.next() != Some(to) {
            return Err(RenderError::StageOrder(format!(
                "{:?} -> {to:?}",
                self.stage
            )));
        }
        self.stage = to;
        Ok(())
    }

    /// Destroy the BLAS and free all mesh buffers.
    ///
    /// # Safety
    /// The context must be valid and the mesh must not be in use on the GPU.
    pub unsafe fn destroy(&mut self, ctx: &Context) -> Result<()> {
        if self.acceleration_structure != vk::AccelerationStructureKHR::null() {
            ctx.accel_loader()
                .destroy_acceleration_structure(self.acceleration_structure, None);
            self.acceleration_structure = vk::AccelerationStructureKHR::null();
        }
        let mut allocator = ctx.allocator().lock();
        if let Some(mut blas_buffer) = self.blas_buffer.take() {
            allocator.free_buffer(&mut blas_buffer)?;
        }
        allocator.free_buffer(&mut self.vertex_buffer)?;
        allocator.free_buffer(&mut self.index_buffer)?;
        Ok(())
    }
}

const fn build_flags() -> vk::BuildAccelerationStructureFlagsKHR {
    vk::BuildAccelerationStructureFlagsKHR::from_raw(
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION.as_raw(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_advance_in_one_order() {
        assert_eq!(BlasStage::Uploaded.next(), Some(BlasStage::Built));
        assert_eq!(BlasStage::Built.next(), Some(BlasStage::Compacting));
        assert_eq!(BlasStage::Compacting.next(), Some(BlasStage::Finalized));
        assert_eq!(BlasStage::Finalized.next(), None);
    }

    #[test]
    fn build_flags_allow_compaction() {
        let flags = build_flags();
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE));
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
    }
}
