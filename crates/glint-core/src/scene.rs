//! Scene description consumed by render backends.

use glam::Vec3;

use crate::error::{Error, Result};

/// Triangle mesh data on the host.
///
/// Positions are tightly packed 3-float vertices; indices are triangle
/// triplets into the vertex array.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    /// Vertex positions.
    pub vertices: Vec<[f32; 3]>,
    /// Triangle indices.
    pub indices: Vec<[u32; 3]>,
    /// Index into [`Scene::materials`].
    pub material_id: u32,
}

impl MeshData {
    /// Create a mesh from positions and triangle indices.
    pub fn new(vertices: Vec<[f32; 3]>, indices: Vec<[u32; 3]>, material_id: u32) -> Self {
        Self {
            vertices,
            indices,
            material_id,
        }
    }

    /// Number of triangles.
    pub fn triangle_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Byte size of the vertex array.
    pub fn vertex_bytes(&self) -> u64 {
        (self.vertices.len() * std::mem::size_of::<[f32; 3]>()) as u64
    }

    /// Byte size of the index array.
    pub fn index_bytes(&self) -> u64 {
        (self.indices.len() * std::mem::size_of::<[u32; 3]>()) as u64
    }
}

/// Fixed-layout material parameter record (64 bytes).
///
/// The layout is a shader contract: hit shaders index a structured buffer of
/// these records by the instance's material id.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Material {
    pub base_color: [f32; 3],
    pub metallic: f32,

    pub specular: f32,
    pub roughness: f32,
    pub specular_tint: f32,
    pub anisotropy: f32,

    pub sheen: f32,
    pub sheen_tint: f32,
    pub clearcoat: f32,
    pub clearcoat_gloss: f32,

    pub ior: f32,
    pub specular_transmission: f32,
    pub _pad: [f32; 2],
}

impl Material {
    /// Size in bytes of one record.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// A matte material with the given base color.
    pub fn matte(base_color: Vec3) -> Self {
        Self {
            base_color: base_color.to_array(),
            roughness: 1.0,
            specular: 0.5,
            ior: 1.5,
            ..Self::zeroed()
        }
    }

    fn zeroed() -> Self {
        bytemuck::Zeroable::zeroed()
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::matte(Vec3::splat(0.9))
    }
}

/// A renderable scene: meshes plus the material table they index.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub meshes: Vec<MeshData>,
    pub materials: Vec<Material>,
}

impl Scene {
    /// Validate that every mesh references an existing material and carries
    /// at least one triangle.
    pub fn validate(&self) -> Result<()> {
        if self.meshes.is_empty() {
            return Err(Error::InvalidScene("scene has no meshes".to_string()));
        }
        for (i, mesh) in self.meshes.iter().enumerate() {
            if mesh.vertices.is_empty() || mesh.indices.is_empty() {
                return Err(Error::InvalidScene(format!("mesh {i} is empty")));
            }
            if mesh.material_id as usize >= self.materials.len() {
                return Err(Error::InvalidScene(format!(
                    "mesh {i} references material {} but only {} exist",
                    mesh.material_id,
                    self.materials.len()
                )));
            }
            let vertex_count = mesh.vertices.len() as u32;
            if let Some(tri) = mesh
                .indices
                .iter()
                .find(|tri| tri.iter().any(|&v| v >= vertex_count))
            {
                return Err(Error::InvalidScene(format!(
                    "mesh {i} has out-of-range index in triangle {tri:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Statistics returned from one render call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderStats {
    /// Wall-clock seconds from submission to sync completion.
    pub render_time: f64,
    /// Rays traced per second (pixel count / render time).
    pub rays_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_triangle(material_id: u32) -> MeshData {
        MeshData::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0, 1, 2]],
            material_id,
        )
    }

    #[test]
    fn material_record_size() {
        assert_eq!(Material::SIZE, 64);
    }

    #[test]
    fn material_field_offsets() {
        // base_color at 0, metallic at 12, ior at 40
        let m = Material {
            base_color: [1.0, 2.0, 3.0],
            metallic: 4.0,
            ior: 5.0,
            ..Material::default()
        };
        let bytes = bytemuck::bytes_of(&m);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &4.0f32.to_ne_bytes());
        assert_eq!(&bytes[40..44], &5.0f32.to_ne_bytes());
    }

    #[test]
    fn validate_accepts_well_formed_scene() {
        let scene = Scene {
            meshes: vec![unit_triangle(0), unit_triangle(1)],
            materials: vec![Material::default(), Material::default()],
        };
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_material() {
        let scene = Scene {
            meshes: vec![unit_triangle(3)],
            materials: vec![Material::default()],
        };
        assert!(scene.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_index() {
        let mut mesh = unit_triangle(0);
        mesh.indices.push([0, 1, 7]);
        let scene = Scene {
            meshes: vec![mesh],
            materials: vec![Material::default()],
        };
        assert!(scene.validate().is_err());
    }

    #[test]
    fn mesh_byte_sizes() {
        let mesh = unit_triangle(0);
        assert_eq!(mesh.vertex_bytes(), 36);
        assert_eq!(mesh.index_bytes(), 12);
        assert_eq!(mesh.triangle_count(), 1);
    }
}
