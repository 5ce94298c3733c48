//! Vulkan abstraction layer for the Glint renderer.
//!
//! This crate provides:
//! - Vulkan instance and device management with ray-tracing capability checks
//! - Memory allocation via gpu-allocator, with explicit resource-state tags
//! - State-transition barriers derived from those tags
//! - Command buffer management around one reusable primary command buffer
//! - A monotonic timeline fence for host/GPU synchronization
//! - Descriptor set management

pub mod barrier;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod sync;

pub use barrier::{transition_buffer, transition_image, ResourceState};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::CommandPool;
pub use context::{Context, ContextBuilder};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder};
pub use error::{GpuError, Result};
pub use memory::{Allocator, Buffer, Image, MemoryClass};
pub use sync::{TimelineFence, WaitOutcome};
