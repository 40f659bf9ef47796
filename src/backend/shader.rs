// Shader module loading
//
// Vulkan consumes SPIR-V. build.rs compiles shaders/*.vert|frag with glslc;
// the resulting .spv files are read at pipeline build time.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::DeviceContext;

/// Decode SPIR-V bytes into aligned words, checking the magic number
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V")
}

/// Load SPIR-V shader from bytes and create a shader module
pub fn create_shader_module(device: &DeviceContext, code: &[u8]) -> Result<vk::ShaderModule> {
    let words = spirv_words(code)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

pub fn load_shader_module(device: &DeviceContext, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?} (is glslc installed?)", path))?;
    create_shader_module(device, &bytes).with_context(|| format!("Shader {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_truncated_or_foreign_bytes() {
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
        assert!(spirv_words(b"#version 450").is_err());
    }

    #[test]
    fn decodes_little_endian_words() {
        let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }
}
