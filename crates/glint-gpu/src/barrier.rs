//! Resource-state tags and transition barriers.
//!
//! Every buffer and image carries a [`ResourceState`] tag describing the
//! access the last recorded commands left it in. Any operation needing
//! different access must record a transition first; the tag is updated at
//! record time, not at GPU completion, because barriers order the command
//! stream rather than signal the host.

use ash::vk;

use crate::memory::{Buffer, Image};

/// Current access state of a buffer or image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Freshly allocated, contents undefined.
    Undefined,
    /// Destination of a transfer copy.
    CopyDst,
    /// Source of a transfer copy.
    CopySrc,
    /// Read-only input to shader stages (vertex/index/material data).
    ShaderRead,
    /// Storage read/write from ray-tracing shaders (GENERAL layout).
    General,
    /// Read-only input to an acceleration-structure build.
    AccelBuildInput,
}

impl ResourceState {
    /// Pipeline stages the state participates in.
    pub const fn stage_mask(self) -> vk::PipelineStageFlags2 {
        match self {
            Self::Undefined => vk::PipelineStageFlags2::TOP_OF_PIPE,
            Self::CopyDst | Self::CopySrc => vk::PipelineStageFlags2::TRANSFER,
            Self::ShaderRead | Self::General => vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            Self::AccelBuildInput => vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        }
    }

    /// Memory accesses the state performs.
    pub const fn access_mask(self) -> vk::AccessFlags2 {
        match self {
            Self::Undefined => vk::AccessFlags2::NONE,
            Self::CopyDst => vk::AccessFlags2::TRANSFER_WRITE,
            Self::CopySrc => vk::AccessFlags2::TRANSFER_READ,
            Self::ShaderRead => vk::AccessFlags2::SHADER_READ,
            Self::General => vk::AccessFlags2::from_raw(
                vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
                    | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
            ),
            Self::AccelBuildInput => vk::AccessFlags2::SHADER_READ,
        }
    }

    /// Image layout corresponding to the state. Only meaningful for images.
    pub const fn image_layout(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::CopyDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::CopySrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::General | Self::AccelBuildInput => vk::ImageLayout::GENERAL,
        }
    }
}

/// Record a buffer state transition and update the buffer's tag.
///
/// A no-op when the buffer is already in `new_state`.
///
/// # Safety
/// The device must be valid and the command buffer in recording state.
pub unsafe fn transition_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: &mut Buffer,
    new_state: ResourceState,
) {
    let old_state = buffer.state();
    if old_state == new_state {
        return;
    }

    let barrier = vk::BufferMemoryBarrier2::default()
        .src_stage_mask(old_state.stage_mask())
        .src_access_mask(old_state.access_mask())
        .dst_stage_mask(new_state.stage_mask())
        .dst_access_mask(new_state.access_mask())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer.buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE);

    let dependency_info =
        vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));

    device.cmd_pipeline_barrier2(cmd, &dependency_info);
    buffer.set_state(new_state);
}

/// Record an image state/layout transition and update the image's tag.
///
/// A no-op when the image is already in `new_state`.
///
/// # Safety
/// The device must be valid and the command buffer in recording state.
pub unsafe fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: &mut Image,
    new_state: ResourceState,
) {
    let old_state = image.state();
    if old_state == new_state {
        return;
    }

    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(old_state.stage_mask())
        .src_access_mask(old_state.access_mask())
        .dst_stage_mask(new_state.stage_mask())
        .dst_access_mask(new_state.access_mask())
        .old_layout(old_state.image_layout())
        .new_layout(new_state.image_layout())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image.image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let dependency_info =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));

    device.cmd_pipeline_barrier2(cmd, &dependency_info);
    image.set_state(new_state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_states_map_to_transfer() {
        assert_eq!(
            ResourceState::CopyDst.stage_mask(),
            vk::PipelineStageFlags2::TRANSFER
        );
        assert_eq!(
            ResourceState::CopyDst.access_mask(),
            vk::AccessFlags2::TRANSFER_WRITE
        );
        assert_eq!(
            ResourceState::CopySrc.image_layout(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
    }

    #[test]
    fn general_state_is_storage_read_write() {
        let access = ResourceState::General.access_mask();
        assert!(access.contains(vk::AccessFlags2::SHADER_STORAGE_READ));
        assert!(access.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE));
        assert_eq!(
            ResourceState::General.image_layout(),
            vk::ImageLayout::GENERAL
        );
    }

    #[test]
    fn undefined_has_no_access() {
        assert_eq!(ResourceState::Undefined.access_mask(), vk::AccessFlags2::NONE);
        assert_eq!(
            ResourceState::Undefined.image_layout(),
            vk::ImageLayout::UNDEFINED
        );
    }
}
