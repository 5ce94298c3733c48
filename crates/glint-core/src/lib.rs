//! Core types for the Glint renderer.
//!
//! This crate provides the scene description consumed by render backends:
//! - Triangle mesh data (positions + indices + material id)
//! - Fixed-layout material parameter records
//! - Render statistics returned from a frame

pub mod error;
pub mod scene;

pub use error::{Error, Result};
pub use scene::{Material, MeshData, RenderStats, Scene};

/// Renderer-wide constants shared between host code and shader bytecode.
pub mod constants {
    /// Number of ray types traced per instance (primary, occlusion).
    ///
    /// Instance *i*'s hit-group records start at SBT index
    /// `i * RAY_TYPE_COUNT`; this constant is the sole addressing link
    /// between the TLAS instance table and the shader binding table.
    pub const RAY_TYPE_COUNT: u32 = 2;
    /// SBT index of the primary ray type within an instance's records.
    pub const PRIMARY_RAY: u32 = 0;
    /// SBT index of the occlusion ray type within an instance's records.
    pub const OCCLUSION_RAY: u32 = 1;
}
