// Vertex buffer upload
//
// One host-visible, host-coherent buffer sized exactly to the mesh, written
// through a mapped pointer once at startup. No staging pass.

use anyhow::{Context, Result};
use ash::vk;
use std::mem::size_of;
use std::sync::Arc;
use thiserror::Error;

use super::vertex::{Vertex, VERTICES};
use super::VulkanDevice;

/// No advertised memory type satisfied the filter and the requested flags.
#[derive(Debug, Error)]
#[error("no suitable memory type (type bits {type_bits:#b}, required {required:?})")]
pub struct NoSuitableMemoryError {
    pub type_bits: u32,
    pub required: vk::MemoryPropertyFlags,
}

/// Linear scan over the advertised memory types: the index must be allowed
/// by the requirement bits and its flags must contain every requested flag.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, NoSuitableMemoryError> {
    for i in 0..memory_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(required);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    Err(NoSuitableMemoryError {
        type_bits: type_filter,
        required,
    })
}

/// The fixed mesh on the GPU, bound on every frame.
pub struct VertexBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pub vertex_count: u32,
    device: Arc<VulkanDevice>,
}

impl VertexBuffer {
    /// Create, allocate, bind, and fill the buffer. Handles start null so a
    /// failure at any step drops exactly what exists, buffer before memory.
    pub fn upload(device: Arc<VulkanDevice>) -> Result<Self> {
        let mut staged = Self {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            vertex_count: VERTICES.len() as u32,
            device,
        };

        let size = (size_of::<Vertex>() * VERTICES.len()) as vk::DeviceSize;
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        staged.buffer = unsafe {
            staged
                .device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create vertex buffer")?
        };

        let requirements = unsafe {
            staged
                .device
                .device
                .get_buffer_memory_requirements(staged.buffer)
        };

        let memory_type_index = find_memory_type(
            &staged.device.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        staged.memory = unsafe {
            staged
                .device
                .device
                .allocate_memory(&alloc_info, None)
                .context("Failed to allocate vertex buffer memory")?
        };

        unsafe {
            staged
                .device
                .device
                .bind_buffer_memory(staged.buffer, staged.memory, 0)
                .context("Failed to bind vertex buffer memory")?;

            let ptr = staged
                .device
                .device
                .map_memory(staged.memory, 0, size, vk::MemoryMapFlags::empty())
                .context("Failed to map vertex buffer memory")? as *mut Vertex;
            ptr.copy_from_nonoverlapping(VERTICES.as_ptr(), VERTICES.len());
            staged.device.device.unmap_memory(staged.memory);
        }

        Ok(staged)
    }
}

impl Drop for VertexBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = f;
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_first_type_matching_filter_and_flags() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, HOST, HOST]);
        assert_eq!(find_memory_type(&props, 0b111, HOST).unwrap(), 1);
    }

    #[test]
    fn respects_the_type_filter_bits() {
        let props = memory_properties(&[HOST, HOST]);
        // Index 0 is excluded by the filter even though its flags match
        assert_eq!(find_memory_type(&props, 0b10, HOST).unwrap(), 1);
    }

    #[test]
    fn requires_a_flag_superset_not_an_overlap() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        let err = find_memory_type(&props, 0b1, HOST).unwrap_err();
        assert_eq!(err.type_bits, 0b1);
        assert_eq!(err.required, HOST);
    }

    #[test]
    fn extra_flags_on_the_type_are_fine() {
        let combined = HOST | vk::MemoryPropertyFlags::HOST_CACHED;
        let props = memory_properties(&[combined]);
        assert_eq!(find_memory_type(&props, 0b1, HOST).unwrap(), 0);
    }

    #[test]
    fn no_match_reports_the_request() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert!(find_memory_type(&props, 0b1, HOST).is_err());
    }
}
