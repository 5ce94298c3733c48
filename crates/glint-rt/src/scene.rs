//! Top-level acceleration structure and scene-wide GPU buffers.
//!
//! The TLAS holds one instance per mesh. Each record carries an identity
//! transform, the full 0xFF visibility mask, the mesh's material id in the
//! custom index (hit shaders use it to index the material buffer), and a
//! shader binding table offset of `instance index * RAY_TYPE_COUNT` so every
//! instance owns a consecutive pair of hit records.

use ash::vk;
use glint_core::constants::RAY_TYPE_COUNT;
use glint_core::Material;
use glint_gpu::{transition_buffer, Buffer, Context, MemoryClass, ResourceState};

use crate::error::{RenderError, Result};
use crate::mesh::{BlasStage, GpuMesh};

/// Build progress of the TLAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasStage {
    /// Instance records written, structure not yet built.
    Pending,
    /// Build submission fenced; the handle is usable.
    Built,
}

/// Build one TLAS instance record.
///
/// The transform is the row-major 3x4 identity; mask 0xFF makes the instance
/// visible to every ray.
pub fn instance_record(
    index: u32,
    blas_address: vk::DeviceAddress,
    material_id: u32,
) -> vk::AccelerationStructureInstanceKHR {
    let transform = vk::TransformMatrixKHR {
        matrix: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ],
    };

    vk::AccelerationStructureInstanceKHR {
        transform,
        instance_custom_index_and_mask: vk::Packed24_8::new(material_id, 0xFF),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            index * RAY_TYPE_COUNT,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

/// Top-level acceleration structure over the scene's meshes.
pub struct Tlas {
    acceleration_structure: vk::AccelerationStructureKHR,
    buffer: Buffer,
    // Consumed by the build on the GPU timeline; must outlive the TLAS.
    instance_buffer: Buffer,
    stage: TlasStage,
}

impl Tlas {
    /// Build the TLAS over a slice of finalized meshes.
    ///
    /// The instance buffer stays host-visible and alive for the lifetime of
    /// the structure. Returns with the build already fenced.
    ///
    /// # Safety
    /// The context must be valid.
    pub unsafe fn build(ctx: &Context, meshes: &[GpuMesh]) -> Result<Self> {
        if meshes.is_empty() {
            return Err(RenderError::InvalidState(
                "cannot build a TLAS over zero meshes".to_string(),
            ));
        }
        if let Some(mesh) = meshes.iter().find(|m| m.stage() != BlasStage::Finalized) {
            return Err(RenderError::StageOrder(format!(
                "TLAS build requires finalized meshes, found {:?}",
                mesh.stage()
            )));
        }

        let device = ctx.device();
        let accel = ctx.accel_loader();

        let instances: Vec<vk::AccelerationStructureInstanceKHR> = meshes
            .iter()
            .enumerate()
            .map(|(i, mesh)| Ok(instance_record(i as u32, mesh.blas_address()?, mesh.material_id())))
            .collect::<Result<_>>()?;

        let instance_bytes = std::mem::size_of_val(instances.as_slice()) as u64;
        let instance_buffer = ctx.allocator().lock().create_buffer(
            instance_bytes,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryClass::Upload,
            ResourceState::AccelBuildInput,
            "tlas_instance_buffer",
        )?;

        // vk::AccelerationStructureInstanceKHR contains bitfield unions, so
        // the write goes through a raw copy rather than a Pod cast.
        let ptr = instance_buffer.mapped_ptr()?;
        std::ptr::copy_nonoverlapping(
            instances.as_ptr().cast::<u8>(),
            ptr,
            instance_bytes as usize,
        );

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_buffer.device_address(device),
                    }),
            });

        let instance_count = meshes.len() as u32;
        let build_sizes = {
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
                .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(std::slice::from_ref(&geometry));

            let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
            accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
                &mut sizes,
            );
            sizes
        };

        let (buffer, mut scratch_buffer) = {
            let mut allocator = ctx.allocator().lock();
            let buffer = allocator.create_buffer(
                build_sizes.acceleration_structure_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryClass::DeviceLocal,
                ResourceState::Undefined,
                "tlas_buffer",
            )?;
            let scratch_buffer = allocator.create_buffer(
                build_sizes.build_scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryClass::DeviceLocal,
                ResourceState::Undefined,
                "tlas_scratch",
            )?;
            (buffer, scratch_buffer)
        };

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(build_sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        let acceleration_structure = accel.create_acceleration_structure(&create_info, None)?;

        let scratch_address = scratch_buffer.device_address(device);
        ctx.submit_and_wait(|cmd| {
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
                .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .dst_acceleration_structure(acceleration_structure)
                .geometries(std::slice::from_ref(&geometry))
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch_address,
                });

            let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(instance_count);

            accel.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&build_range)],
            );
            Ok(())
        })?;

        ctx.allocator().lock().free_buffer(&mut scratch_buffer)?;

        Ok(Self {
            acceleration_structure,
            buffer,
            instance_buffer,
            stage: TlasStage::Built,
        })
    }

    /// Build stage; `Built` for any value returned from [`Tlas::build`].
    pub fn stage(&self) -> TlasStage {
        self.stage
    }

    /// The acceleration structure handle for descriptor writes.
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.acceleration_structure
    }

    /// Destroy the TLAS and its buffers.
    ///
    /// # Safety
    /// The context must be valid and the TLAS must not be in use on the GPU.
    pub unsafe fn destroy(&mut self, ctx: &Context) -> Result<()> {
        ctx.accel_loader()
            .destroy_acceleration_structure(self.acceleration_structure, None);
        self.acceleration_structure = vk::AccelerationStructureKHR::null();
        let mut allocator = ctx.allocator().lock();
        allocator.free_buffer(&mut self.buffer)?;
        allocator.free_buffer(&mut self.instance_buffer)?;
        Ok(())
    }
}

/// Upload the material table into a device-local storage buffer.
///
/// Hit shaders index this buffer by the instance custom index, so the record
/// order must match the scene's material table.
///
/// # Safety
/// The context must be valid.
pub unsafe fn upload_materials(ctx: &Context, materials: &[Material]) -> Result<Buffer> {
    let device = ctx.device();
    let byte_size = std::mem::size_of_val(materials) as u64;

    let (upload, mut buffer) = {
        let mut allocator = ctx.allocator().lock();
        let upload = allocator.create_buffer(
            byte_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryClass::Upload,
            ResourceState::Undefined,
            "material_upload",
        )?;
        upload.write(materials)?;

        let buffer = allocator.create_buffer(
            byte_size,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryClass::DeviceLocal,
            ResourceState::Undefined,
            "material_buffer",
        )?;
        (upload, buffer)
    };

    ctx.submit_and_wait(|cmd| {
        transition_buffer(device, cmd, &mut buffer, ResourceState::CopyDst);
        let copy = vk::BufferCopy::default().size(byte_size);
        device.cmd_copy_buffer(cmd, upload.buffer, buffer.buffer, std::slice::from_ref(&copy));
        transition_buffer(device, cmd, &mut buffer, ResourceState::ShaderRead);
        Ok(())
    })?;

    let mut upload = upload;
    ctx.allocator().lock().free_buffer(&mut upload)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_offsets_stride_by_ray_type_count() {
        // Two meshes, three materials: records at offsets 0 and 2.
        let records = [
            instance_record(0, 0x1000, 0),
            instance_record(1, 0x2000, 2),
        ];
        assert_eq!(
            records[0]
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            0
        );
        assert_eq!(
            records[1]
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            2
        );
    }

    #[test]
    fn record_carries_material_id_and_full_mask() {
        let record = instance_record(3, 0xABCD, 7);
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 7);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xFF);
        let handle = unsafe { record.acceleration_structure_reference.device_handle };
        assert_eq!(handle, 0xABCD);
    }

    #[test]
    fn record_transform_is_identity() {
        let record = instance_record(0, 0, 0);
        let m = record.transform.matrix;
        for row in 0..3 {
            for col in 0..4 {
                let expected = if row == col { 1.0 } else { 0.0 };
                assert_eq!(m[row * 4 + col], expected);
            }
        }
    }
}
