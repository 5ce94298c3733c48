//! Per-frame render targets, descriptor writes, and readback.
//!
//! `FrameTargets` owns the RGBA8 output image the raygen shader writes, the
//! RGBA32F accumulation image for progressive refinement, and the readback
//! buffer the output is copied into. The copy pads each row to the 256-byte
//! transfer pitch; [`copy_rows`] strips that padding on the host.

use ash::vk;
use glint_gpu::{
    descriptors, transition_image, Buffer, Context, Image, MemoryClass, ResourceState,
};

use crate::error::{RenderError, Result};
use crate::sbt::align_up;

/// Row pitch granularity for image-to-buffer copies.
pub const ROW_PITCH_ALIGNMENT: u32 = 256;

const BYTES_PER_PIXEL: u32 = 4;

/// Bytes per padded readback row for an image of the given width.
pub const fn padded_row_bytes(width: u32) -> u32 {
    align_up(width * BYTES_PER_PIXEL, ROW_PITCH_ALIGNMENT)
}

/// Strip row padding from a readback buffer.
///
/// Degenerates to one tight copy when the padded and tight strides match.
pub fn copy_rows(src: &[u8], padded_stride: usize, tight_stride: usize, rows: usize) -> Vec<u8> {
    if padded_stride == tight_stride {
        return src[..tight_stride * rows].to_vec();
    }
    let mut out = vec![0u8; tight_stride * rows];
    for row in 0..rows {
        let src_start = row * padded_stride;
        let dst_start = row * tight_stride;
        out[dst_start..dst_start + tight_stride]
            .copy_from_slice(&src[src_start..src_start + tight_stride]);
    }
    out
}

/// Phases of one frame, entered strictly in declaration order and wrapping
/// back to `Idle` once the pixels are host-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Recording,
    Submitted,
    Synced,
    ReadBack,
}

impl FramePhase {
    /// The phase that follows this one.
    pub fn next(self) -> Self {
        match self {
            Self::Idle => Self::Recording,
            Self::Recording => Self::Submitted,
            Self::Submitted => Self::Synced,
            Self::Synced => Self::ReadBack,
            Self::ReadBack => Self::Idle,
        }
    }

    /// Advance to `to`, erroring on any out-of-order jump.
    pub fn advance(&mut self, to: Self) -> Result<()> {
        if self.next() != to {
            return Err(RenderError::StageOrder(format!("{self:?} -> {to:?}")));
        }
        *self = to;
        Ok(())
    }
}

/// Render targets and readback storage for one output resolution.
pub struct FrameTargets {
    output: Image,
    output_view: vk::ImageView,
    accum: Image,
    accum_view: vk::ImageView,
    readback: Buffer,
    width: u32,
    height: u32,
}

impl FrameTargets {
    /// Allocate targets for the given resolution.
    ///
    /// # Safety
    /// The context must be valid.
    pub unsafe fn new(ctx: &Context, width: u32, height: u32) -> Result<Self> {
        let device = ctx.device();
        let extent = vk::Extent3D {
            width,
            height,
            depth: 1,
        };

        let (output, accum, readback) = {
            let mut allocator = ctx.allocator().lock();

            let output = allocator.create_image(
                &image_info(
                    vk::Format::R8G8B8A8_UNORM,
                    extent,
                    vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
                ),
                "frame_output",
            )?;
            let accum = allocator.create_image(
                &image_info(
                    vk::Format::R32G32B32A32_SFLOAT,
                    extent,
                    vk::ImageUsageFlags::STORAGE,
                ),
                "frame_accum",
            )?;
            let readback = allocator.create_buffer(
                u64::from(padded_row_bytes(width)) * u64::from(height),
                vk::BufferUsageFlags::TRANSFER_DST,
                MemoryClass::Readback,
                ResourceState::Undefined,
                "frame_readback",
            )?;
            (output, accum, readback)
        };

        let output_view = create_view(device, &output)?;
        let accum_view = create_view(device, &accum)?;

        Ok(Self {
            output,
            output_view,
            accum,
            accum_view,
            readback,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel count of one frame.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Rewrite every descriptor slot for this frame.
    ///
    /// Slot order is load-bearing; shaders address the set by position, so
    /// all five slots are written in full before each dispatch.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn write_descriptors(
        &self,
        device: &ash::Device,
        set: vk::DescriptorSet,
        tlas: vk::AccelerationStructureKHR,
        material_buffer: &Buffer,
        view_buffer: &Buffer,
    ) {
        descriptors::write_storage_image(device, set, 0, self.output_view);
        descriptors::write_storage_image(device, set, 1, self.accum_view);
        descriptors::write_acceleration_structure(device, set, 2, tlas);
        descriptors::write_storage_buffer(device, set, 3, material_buffer.buffer, material_buffer.size);
        descriptors::write_uniform_buffer(device, set, 4, view_buffer.buffer, view_buffer.size);
    }

    /// Transition both storage images to shader-writable layout.
    ///
    /// # Safety
    /// The command buffer must be in recording state.
    pub unsafe fn transition_for_dispatch(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        transition_image(device, cmd, &mut self.output, ResourceState::General);
        transition_image(device, cmd, &mut self.accum, ResourceState::General);
    }

    /// Record the output-image copy into the readback buffer.
    ///
    /// The copy pads rows to [`ROW_PITCH_ALIGNMENT`]; the image is returned
    /// to shader-writable layout afterwards so the next frame needs no
    /// special casing.
    ///
    /// # Safety
    /// The command buffer must be in recording state and the output image
    /// must have been written by a prior dispatch.
    pub unsafe fn record_readback(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        transition_image(device, cmd, &mut self.output, ResourceState::CopySrc);

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            // Row length is in texels, not bytes.
            .buffer_row_length(padded_row_bytes(self.width) / BYTES_PER_PIXEL)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            });

        device.cmd_copy_image_to_buffer(
            cmd,
            self.output.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            self.readback.buffer,
            std::slice::from_ref(&region),
        );

        transition_image(device, cmd, &mut self.output, ResourceState::General);
    }

    /// Copy the fenced readback contents into a tightly packed RGBA8 array.
    pub fn read_pixels(&self) -> Result<Vec<u8>> {
        let padded = padded_row_bytes(self.width) as usize;
        let mut staged = vec![0u8; padded * self.height as usize];
        self.readback.read_bytes(0, &mut staged)?;

        let tight = (self.width * BYTES_PER_PIXEL) as usize;
        Ok(copy_rows(&staged, padded, tight, self.height as usize))
    }

    /// Destroy images, views, and the readback buffer.
    ///
    /// # Safety
    /// The context must be valid and the targets must not be in use.
    pub unsafe fn destroy(&mut self, ctx: &Context) -> Result<()> {
        let device = ctx.device();
        device.destroy_image_view(self.output_view, None);
        device.destroy_image_view(self.accum_view, None);
        let mut allocator = ctx.allocator().lock();
        allocator.free_image(&mut self.output)?;
        allocator.free_image(&mut self.accum)?;
        allocator.free_buffer(&mut self.readback)?;
        Ok(())
    }
}

fn image_info(
    format: vk::Format,
    extent: vk::Extent3D,
    usage: vk::ImageUsageFlags,
) -> vk::ImageCreateInfo<'static> {
    vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(extent)
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .initial_layout(vk::ImageLayout::UNDEFINED)
}

unsafe fn create_view(device: &ash::Device, image: &Image) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image.image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(image.format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = device
        .create_image_view(&view_info, None)
        .map_err(glint_gpu::GpuError::from)?;
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_bytes_pad_to_transfer_pitch() {
        // 64 texels are tight; 100 texels round up to 512 bytes.
        assert_eq!(padded_row_bytes(64), 256);
        assert_eq!(padded_row_bytes(100), 512);
        assert_eq!(padded_row_bytes(320), 1280);
    }

    #[test]
    fn copy_rows_strips_padding() {
        let rows = 3;
        let tight = 12;
        let padded = 16;
        let mut src = vec![0u8; padded * rows];
        for row in 0..rows {
            for byte in 0..tight {
                src[row * padded + byte] = (row * tight + byte) as u8;
            }
            // Poison the padding so a correct copy never sees it.
            for byte in tight..padded {
                src[row * padded + byte] = 0xEE;
            }
        }

        let out = copy_rows(&src, padded, tight, rows);
        let expected: Vec<u8> = (0..(tight * rows) as u8).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn copy_rows_tight_is_memcpy() {
        let src: Vec<u8> = (0..48).collect();
        let out = copy_rows(&src, 16, 16, 3);
        assert_eq!(out, src);
    }

    #[test]
    fn frame_phases_cycle_in_order() {
        let mut phase = FramePhase::Idle;
        for next in [
            FramePhase::Recording,
            FramePhase::Submitted,
            FramePhase::Synced,
            FramePhase::ReadBack,
            FramePhase::Idle,
        ] {
            phase.advance(next).unwrap();
        }
        assert_eq!(phase, FramePhase::Idle);
    }

    #[test]
    fn frame_phase_rejects_skips() {
        let mut phase = FramePhase::Idle;
        assert!(phase.advance(FramePhase::Synced).is_err());
        assert_eq!(phase, FramePhase::Idle);
    }
}
