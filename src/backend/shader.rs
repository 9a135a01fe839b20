// Shader artifact loading
//
// The pipeline consumes two precompiled SPIR-V artifacts read from fixed
// relative paths at startup. Nothing is compiled at runtime.

use anyhow::Result;
use ash::{util, vk};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::VulkanDevice;

pub const VERTEX_SHADER_PATH: &str = "shaders/shader.vert.spv";
pub const FRAGMENT_SHADER_PATH: &str = "shaders/shader.frag.spv";

/// A shader artifact that is absent, unreadable, or empty is a setup error.
#[derive(Debug, Error)]
pub enum ShaderLoadError {
    #[error("failed to read shader artifact {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("shader artifact {} is empty", path.display())]
    Empty { path: PathBuf },
}

/// Read a SPIR-V artifact into properly aligned words.
pub fn read_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>, ShaderLoadError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| ShaderLoadError::Io {
        path: path.to_owned(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(ShaderLoadError::Empty {
            path: path.to_owned(),
        });
    }
    util::read_spv(&mut io::Cursor::new(bytes)).map_err(|source| ShaderLoadError::Io {
        path: path.to_owned(),
        source,
    })
}

pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
    let module = unsafe { device.create_shader_module(&create_info, None)? };
    Ok(module)
}

/// The vertex/fragment module pair, alive until shutdown.
pub struct ShaderSet {
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderSet {
    pub fn load(device: Arc<VulkanDevice>) -> Result<Self> {
        let vertex_code = read_spirv(VERTEX_SHADER_PATH)?;
        let fragment_code = read_spirv(FRAGMENT_SHADER_PATH)?;

        let vertex = create_shader_module(&device.device, &vertex_code)?;
        let fragment = match create_shader_module(&device.device, &fragment_code) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.device.destroy_shader_module(vertex, None) };
                return Err(e);
            }
        };

        Ok(Self {
            vertex,
            fragment,
            device,
        })
    }
}

impl Drop for ShaderSet {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.vertex, None);
            self.device.device.destroy_shader_module(self.fragment, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("trigon-shader-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn missing_artifact_is_an_io_error() {
        let err = read_spirv("shaders/does-not-exist.spv").unwrap_err();
        assert!(matches!(err, ShaderLoadError::Io { .. }));
    }

    #[test]
    fn empty_artifact_is_rejected() {
        let path = temp_path("empty.spv");
        fs::write(&path, []).unwrap();
        let err = read_spirv(&path).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(matches!(err, ShaderLoadError::Empty { .. }));
    }

    #[test]
    fn reads_words_from_little_endian_bytes() {
        let path = temp_path("magic.spv");
        let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        let words = read_spirv(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn truncated_artifact_is_an_io_error() {
        let path = temp_path("truncated.spv");
        fs::write(&path, [0x03, 0x02, 0x23]).unwrap();
        let err = read_spirv(&path).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(matches!(err, ShaderLoadError::Io { .. }));
    }
}
