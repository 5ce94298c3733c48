//! Camera view-parameter packing.
//!
//! The raygen shader reconstructs primary rays from an image-plane basis:
//! the camera position, the per-pixel step vectors `dir_du`/`dir_dv` scaled
//! to the full plane, and the direction to the top-left corner. The packed
//! layout is five 16-byte rows with the frame counter in the first word of
//! the last row.

use glam::Vec3;

use crate::sbt::align_up;

/// Uniform-buffer placement granularity the packed block is padded to.
pub const UNIFORM_ALIGNMENT: u32 = 256;

/// View parameters as the raygen shader reads them.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ViewParams {
    pub cam_pos: [f32; 4],
    pub dir_du: [f32; 4],
    pub dir_dv: [f32; 4],
    pub dir_top_left: [f32; 4],
    pub frame_id: u32,
    pub _pad: [u32; 3],
}

impl ViewParams {
    /// Packed size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Buffer size after padding to the uniform placement granularity.
    pub const BUFFER_SIZE: u64 = align_up(Self::SIZE as u32, UNIFORM_ALIGNMENT) as u64;

    /// Pack the image-plane basis for a camera.
    ///
    /// `dir` and `up` need not be unit length; the plane spans
    /// `2 * tan(fovy / 2)` vertically and scales horizontally by the aspect
    /// ratio.
    pub fn pack(
        pos: Vec3,
        dir: Vec3,
        up: Vec3,
        fovy_degrees: f32,
        width: u32,
        height: u32,
        frame_id: u32,
    ) -> Self {
        let dir = dir.normalize();
        let plane_height = 2.0 * (fovy_degrees.to_radians() * 0.5).tan();
        let plane_width = plane_height * width as f32 / height as f32;

        let dir_du = dir.cross(up).normalize() * plane_width;
        let dir_dv = dir_du.cross(dir).normalize() * plane_height;
        let dir_top_left = dir - 0.5 * dir_du - 0.5 * dir_dv;

        Self {
            cam_pos: pos.extend(0.0).to_array(),
            dir_du: dir_du.extend(0.0).to_array(),
            dir_dv: dir_dv.extend(0.0).to_array(),
            dir_top_left: dir_top_left.extend(0.0).to_array(),
            frame_id,
            _pad: [0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn packed_size_and_alignment() {
        assert_eq!(ViewParams::SIZE, 80);
        assert_eq!(ViewParams::BUFFER_SIZE, 256);
    }

    #[test]
    fn frame_id_sits_in_fifth_row() {
        let params = ViewParams::pack(
            Vec3::ZERO,
            Vec3::NEG_Z,
            Vec3::Y,
            65.0,
            1280,
            720,
            42,
        );
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(&bytes[64..68], &42u32.to_ne_bytes());
    }

    #[test]
    fn ninety_degree_fov_spans_two_units() {
        let params = ViewParams::pack(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 90.0, 100, 100, 0);
        let dv = Vec3::from_slice(&params.dir_dv[..3]);
        let du = Vec3::from_slice(&params.dir_du[..3]);
        assert_relative_eq!(dv.length(), 2.0, epsilon = 1e-5);
        assert_relative_eq!(du.length(), 2.0, epsilon = 1e-5);
    }

    #[test]
    fn aspect_scales_horizontal_span() {
        let params = ViewParams::pack(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 90.0, 200, 100, 0);
        let du = Vec3::from_slice(&params.dir_du[..3]);
        assert_relative_eq!(du.length(), 4.0, epsilon = 1e-5);
    }

    #[test]
    fn top_left_centers_the_plane() {
        let params = ViewParams::pack(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 90.0, 100, 100, 0);
        let du = Vec3::from_slice(&params.dir_du[..3]);
        let dv = Vec3::from_slice(&params.dir_dv[..3]);
        let top_left = Vec3::from_slice(&params.dir_top_left[..3]);
        let center = top_left + 0.5 * du + 0.5 * dv;
        assert_relative_eq!(center.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(center.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(center.z, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn repacking_same_camera_is_bit_identical() {
        let a = ViewParams::pack(Vec3::splat(1.0), Vec3::X, Vec3::Y, 65.0, 640, 480, 3);
        let mut b = ViewParams::pack(Vec3::splat(1.0), Vec3::X, Vec3::Y, 65.0, 640, 480, 4);
        assert_ne!(a, b);
        b.frame_id = 3;
        assert_eq!(bytemuck::bytes_of(&a), bytemuck::bytes_of(&b));
    }
}
