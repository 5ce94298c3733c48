//! Ray tracing pipeline and hit group layout.
//!
//! The pipeline is built from one shader module with five entry points. Group
//! order is load-bearing for the shader binding table: group 0 is the ray
//! generation shader, groups 1 and 2 are the primary and occlusion miss
//! shaders, and each mesh then contributes a pair of triangle hit groups
//! (primary, occlusion) that all reference the same two hit-shader stages.

use ash::vk;
use glint_gpu::{Context, DescriptorSetLayoutBuilder, GpuError};

use crate::error::Result;
use crate::shaders::{
    self, ShaderBlob, AO_MISS_ENTRY, CLOSEST_HIT_ENTRY, MISS_ENTRY, OCCLUSION_HIT_ENTRY,
    RAYGEN_ENTRY,
};

// Stage indices within the pipeline's stage array.
const STAGE_RAYGEN: u32 = 0;
const STAGE_MISS: u32 = 1;
const STAGE_AO_MISS: u32 = 2;
const STAGE_CLOSEST_HIT: u32 = 3;
const STAGE_OCCLUSION_HIT: u32 = 4;

/// Number of non-hit groups preceding the per-mesh hit groups.
pub const LEADING_GROUP_COUNT: u32 = 3;

/// Total shader group count for a scene with `mesh_count` meshes.
pub fn shader_group_count(mesh_count: u32) -> u32 {
    LEADING_GROUP_COUNT + mesh_count * glint_core::constants::RAY_TYPE_COUNT
}

/// Ray tracing pipeline with its layout and fixed-slot descriptor layout.
pub struct RayTracingPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    group_count: u32,
}

impl RayTracingPipeline {
    /// Create the pipeline for a scene with `mesh_count` meshes.
    ///
    /// Recursion depth is 1: hit shaders trace occlusion rays but nothing
    /// recurses further. Payload and attribute sizes are the fixed shader
    /// contract in [`crate::shaders`] and are not validated here.
    ///
    /// # Safety
    /// The context must be valid.
    pub unsafe fn new(ctx: &Context, blob: &ShaderBlob, mesh_count: u32) -> Result<Self> {
        let device = ctx.device();

        // Fixed descriptor slots written in full each frame:
        // [0] output image, [1] accumulation image, [2] TLAS,
        // [3] material buffer, [4] view parameters.
        let descriptor_set_layout = DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::RAYGEN_KHR)
            .storage_image(1, vk::ShaderStageFlags::RAYGEN_KHR)
            .acceleration_structure(
                2,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )
            .storage_buffer(3, vk::ShaderStageFlags::CLOSEST_HIT_KHR)
            .uniform_buffer(4, vk::ShaderStageFlags::RAYGEN_KHR)
            .build(device)?;

        let layouts = [descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&layouts);
        let layout = device.create_pipeline_layout(&layout_info, None)?;

        let module_info = vk::ShaderModuleCreateInfo::default().code(blob.code());
        let module = device.create_shader_module(&module_info, None)?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::RAYGEN_KHR)
                .module(module)
                .name(RAYGEN_ENTRY),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::MISS_KHR)
                .module(module)
                .name(MISS_ENTRY),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::MISS_KHR)
                .module(module)
                .name(AO_MISS_ENTRY),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR)
                .module(module)
                .name(CLOSEST_HIT_ENTRY),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR)
                .module(module)
                .name(OCCLUSION_HIT_ENTRY),
        ];

        let group_count = shader_group_count(mesh_count);
        let mut shader_groups = Vec::with_capacity(group_count as usize);
        shader_groups.push(general_group(STAGE_RAYGEN));
        shader_groups.push(general_group(STAGE_MISS));
        shader_groups.push(general_group(STAGE_AO_MISS));
        for _ in 0..mesh_count {
            shader_groups.push(triangles_hit_group(STAGE_CLOSEST_HIT));
            shader_groups.push(triangles_hit_group(STAGE_OCCLUSION_HIT));
        }

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&shader_stages)
            .groups(&shader_groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout);

        let pipeline_result = ctx.rt_pipeline_loader().create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        );

        device.destroy_shader_module(module, None);

        let pipeline = match pipeline_result {
            Ok(pipelines) => pipelines[0],
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(descriptor_set_layout, None);
                return Err(
                    GpuError::PipelineCreation(format!("ray tracing pipeline: {e:?}")).into(),
                );
            }
        };

        tracing::debug!(
            mesh_count,
            group_count,
            payload_bytes = shaders::PAYLOAD_SIZE,
            attribute_bytes = shaders::ATTRIBUTE_SIZE,
            "created ray tracing pipeline"
        );

        Ok(Self {
            pipeline,
            layout,
            descriptor_set_layout,
            group_count,
        })
    }

    /// The pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// The pipeline layout.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// The fixed-slot descriptor set layout.
    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_set_layout
    }

    /// Total number of shader groups.
    pub fn group_count(&self) -> u32 {
        self.group_count
    }

    /// Destroy the pipeline objects.
    ///
    /// # Safety
    /// The context must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&mut self, ctx: &Context) {
        let device = ctx.device();
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        self.pipeline = vk::Pipeline::null();
    }
}

fn general_group(stage: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(stage)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

fn triangles_hit_group(closest_hit_stage: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(closest_hit_stage)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_count_scales_with_meshes() {
        assert_eq!(shader_group_count(0), 3);
        assert_eq!(shader_group_count(1), 5);
        // Two meshes: raygen + two miss + four hit groups.
        assert_eq!(shader_group_count(2), 7);
    }

    #[test]
    fn hit_group_wiring() {
        let group = triangles_hit_group(STAGE_CLOSEST_HIT);
        assert_eq!(group.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(group.closest_hit_shader, STAGE_CLOSEST_HIT);
        assert_eq!(group.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(group.intersection_shader, vk::SHADER_UNUSED_KHR);
    }
}
