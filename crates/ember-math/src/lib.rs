// SPDX-License-Identifier: CEPL-1.0
//! Value types shared between the app and the renderer.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::{offset_of, size_of};

pub use glam;

/// 16-bit index into a vertex buffer.
pub type Index = u16;

/// 2D position + RGB color. Layout is mirrored by the pipeline's vertex input.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub const STRIDE: u32 = size_of::<Vertex>() as u32;
    pub const POS_OFFSET: u32 = offset_of!(Vertex, pos) as u32;
    pub const COLOR_OFFSET: u32 = offset_of!(Vertex, color) as u32;

    pub const fn new(pos: [f32; 2], color: [f32; 3]) -> Self {
        Self { pos, color }
    }

    pub fn from_glam(pos: Vec2, color: Vec3) -> Self {
        Self {
            pos: pos.to_array(),
            color: color.to_array(),
        }
    }
}

/// Axis-aligned quad around `center`, corners red, green, blue and white.
/// With [`QUAD_INDICES`] both triangles wind clockwise on screen.
pub fn quad(center: Vec2, half_extent: Vec2) -> [Vertex; 4] {
    let corners = [
        (Vec2::new(-1.0, -1.0), Vec3::X),
        (Vec2::new(1.0, -1.0), Vec3::Y),
        (Vec2::new(1.0, 1.0), Vec3::Z),
        (Vec2::new(-1.0, 1.0), Vec3::ONE),
    ];
    corners.map(|(dir, color)| Vertex::from_glam(center + dir * half_extent, color))
}

pub const QUAD_INDICES: [Index; 6] = [0, 1, 2, 2, 3, 0];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(Vertex::STRIDE, 20);
        assert_eq!(Vertex::POS_OFFSET, 0);
        assert_eq!(Vertex::COLOR_OFFSET, 8);
        assert_eq!(Vertex::COLOR_OFFSET, 2 * size_of::<f32>() as u32);
    }

    #[test]
    fn quad_indices_stay_in_range() {
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < 4));
    }

    #[test]
    fn unit_quad_corners() {
        let v = quad(Vec2::ZERO, Vec2::splat(0.5));
        assert_eq!(v[0], Vertex::new([-0.5, -0.5], [1.0, 0.0, 0.0]));
        assert_eq!(v[2], Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0]));
        assert_eq!(v[3].color, [1.0, 1.0, 1.0]);

        let shifted = quad(Vec2::new(1.0, 0.0), Vec2::splat(0.25));
        assert_eq!(shifted[1].pos, [1.25, -0.25]);
    }

    #[test]
    fn vertex_bytes_match_fields() {
        let v = Vertex::from_glam(Vec2::new(1.0, 2.0), Vec3::new(3.0, 4.0, 5.0));
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&v));
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
