//! Shader bytecode handling and the shader contract.
//!
//! The renderer consumes one opaque SPIR-V blob containing all five entry
//! points. Entry names, payload size, and attribute size are a fixed contract
//! between the host and the bytecode; they are not introspected or validated
//! at runtime.

use std::ffi::CStr;

use crate::error::{RenderError, Result};

/// Ray generation entry point.
pub const RAYGEN_ENTRY: &CStr = c"RayGen";
/// Primary-ray miss entry point.
pub const MISS_ENTRY: &CStr = c"Miss";
/// Occlusion-ray miss entry point.
pub const AO_MISS_ENTRY: &CStr = c"AOMiss";
/// Primary-ray closest-hit entry point.
pub const CLOSEST_HIT_ENTRY: &CStr = c"ClosestHit";
/// Occlusion-ray closest-hit entry point.
pub const OCCLUSION_HIT_ENTRY: &CStr = c"OcclusionHit";

/// Ray payload size in bytes (8 floats).
pub const PAYLOAD_SIZE: u32 = 8 * 4;
/// Hit attribute size in bytes (2 floats, triangle barycentrics).
pub const ATTRIBUTE_SIZE: u32 = 2 * 4;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// An opaque SPIR-V module holding all ray tracing entry points.
#[derive(Clone)]
pub struct ShaderBlob {
    words: Vec<u32>,
}

impl ShaderBlob {
    /// Wrap raw SPIR-V bytes.
    ///
    /// The byte length must be a multiple of 4 and the module must open with
    /// the SPIR-V magic number; nothing else is inspected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(RenderError::InvalidShader(format!(
                "byte length {} is not a non-zero multiple of 4",
                bytes.len()
            )));
        }

        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if words[0] != SPIRV_MAGIC {
            return Err(RenderError::InvalidShader(format!(
                "bad magic number {:#010x}",
                words[0]
            )));
        }

        Ok(Self { words })
    }

    /// The module as SPIR-V words.
    pub fn code(&self) -> &[u32] {
        &self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_minimal_module() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let blob = ShaderBlob::from_bytes(&bytes).unwrap();
        assert_eq!(blob.code()[0], SPIRV_MAGIC);
        assert_eq!(blob.code().len(), 5);
    }

    #[test]
    fn rejects_unaligned_length() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0xFF];
        assert!(ShaderBlob::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 8];
        assert!(ShaderBlob::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(ShaderBlob::from_bytes(&[]).is_err());
    }
}
