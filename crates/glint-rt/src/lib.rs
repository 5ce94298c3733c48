//! Hardware ray tracing control path for the Glint renderer.
//!
//! This crate drives `VK_KHR_ray_tracing_pipeline` end to end:
//! - Per-mesh upload and BLAS build with compaction ([`mesh`])
//! - TLAS assembly over the instance table ([`scene`])
//! - Pipeline and hit-group construction ([`pipeline`])
//! - Shader binding table layout and writing ([`sbt`])
//! - View-parameter packing ([`camera`])
//! - Render targets, the fixed descriptor slots, and readback ([`frame`])
//! - The [`RenderBackend`] contract and its serial frame loop ([`backend`])
//!
//! Shader bytecode is an opaque input; the entry-point names and payload
//! layout it must honor live in [`shaders`].

pub mod backend;
pub mod camera;
pub mod error;
pub mod frame;
pub mod mesh;
pub mod pipeline;
pub mod sbt;
pub mod scene;
pub mod shaders;

pub use backend::{RenderBackend, VulkanBackend};
pub use camera::ViewParams;
pub use error::{RenderError, Result};
pub use frame::{copy_rows, padded_row_bytes, FramePhase, FrameTargets};
pub use mesh::{BlasStage, GpuMesh};
pub use pipeline::RayTracingPipeline;
pub use sbt::{align_up, SbtLayout, ShaderBindingTable};
pub use scene::{instance_record, Tlas, TlasStage};
pub use shaders::ShaderBlob;
