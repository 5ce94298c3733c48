//! Render-path error types.

use thiserror::Error;

/// Errors from the ray tracing control path.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Error from the Vulkan abstraction layer.
    #[error(transparent)]
    Gpu(#[from] glint_gpu::GpuError),

    /// Scene data failed validation.
    #[error(transparent)]
    Scene(#[from] glint_core::Error),

    /// Shader bytecode was rejected.
    #[error("Invalid shader bytecode: {0}")]
    InvalidShader(String),

    /// A build or frame stage was driven out of order.
    #[error("Invalid stage transition: {0}")]
    StageOrder(String),

    /// Operation requires state that has not been set up yet.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<ash::vk::Result> for RenderError {
    fn from(err: ash::vk::Result) -> Self {
        Self::Gpu(glint_gpu::GpuError::Vulkan(err))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
