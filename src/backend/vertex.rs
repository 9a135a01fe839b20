// Vertex definition and the fixed mesh this harness draws
//
// Two triangles, interleaved position + color, uploaded once at startup

use ash::vk;
use glam::{Vec2, Vec3};
use std::mem::{offset_of, size_of};

/// A single vertex: 2D position plus RGB color, interleaved.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub pos: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(pos: Vec2, color: Vec3) -> Self {
        Self { pos, color }
    }

    /// Binding 0, per-vertex rate, stride = one interleaved vertex.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    /// Location 0: position, location 1: color.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, pos) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32)
                .build(),
        ]
    }
}

/// The mesh: two clockwise-wound triangles sharing an edge.
pub const VERTICES: [Vertex; 6] = [
    Vertex::new(Vec2::new(0.0, -0.5), Vec3::new(1.0, 0.0, 1.0)),
    Vertex::new(Vec2::new(0.5, 0.5), Vec3::new(1.0, 1.0, 0.0)),
    Vertex::new(Vec2::new(-0.5, 0.5), Vec3::new(0.0, 0.0, 1.0)),
    Vertex::new(Vec2::new(0.5, -0.5), Vec3::new(0.0, 1.0, 0.0)),
    Vertex::new(Vec2::new(0.5, 0.5), Vec3::new(1.0, 1.0, 0.0)),
    Vertex::new(Vec2::new(-0.5, 0.5), Vec3::new(0.0, 0.0, 1.0)),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_tightly_interleaved() {
        assert_eq!(size_of::<Vertex>(), 20);
        assert_eq!(offset_of!(Vertex, pos), 0);
        assert_eq!(offset_of!(Vertex, color), 8);
    }

    #[test]
    fn binding_matches_vertex_stride() {
        let binding = Vertex::binding_description();
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.stride, 20);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);
    }

    #[test]
    fn attributes_cover_position_and_color() {
        let attrs = Vertex::attribute_descriptions();
        assert_eq!(attrs[0].location, 0);
        assert_eq!(attrs[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].location, 1);
        assert_eq!(attrs[1].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attrs[1].offset, 8);
        assert!(attrs.iter().all(|a| a.binding == 0));
    }

    #[test]
    fn mesh_is_two_triangles() {
        assert_eq!(VERTICES.len(), 6);
        // Both triangles share the bottom edge
        assert_eq!(VERTICES[1].pos, VERTICES[4].pos);
        assert_eq!(VERTICES[2].pos, VERTICES[5].pos);
    }
}
