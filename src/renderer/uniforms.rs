//! GPU uniform layouts shared by the generated shaders.

use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Mat3, Mat4, Vec3, Vec4};

use crate::resources::MAX_MORPH_TARGETS;
use crate::scene::{Camera, LightKind, UniformValue, packed_uniform_size, pack_uniforms};

use super::layer_data::LayerLight;

/// Group 0, binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view_projection: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    /// `w` carries the light range in distance passes.
    pub camera_position: [f32; 4],
    pub ambient: [f32; 4],
    pub fog_color: [f32; 4],
    pub fog_params: [f32; 4],
}

impl FrameUniforms {
    #[must_use]
    pub fn from_camera(camera: &Camera, ambient: Vec3, fog: Option<(Vec4, f32, f32)>) -> Self {
        let (fog_color, fog_params) = match fog {
            Some((color, start, end)) => (color.to_array(), [start, end, 0.0, 0.0]),
            None => ([0.0; 4], [0.0; 4]),
        };
        Self {
            view_projection: camera.view_projection_matrix().to_cols_array_2d(),
            view: camera.view_matrix().to_cols_array_2d(),
            camera_position: camera.position().extend(1.0).to_array(),
            ambient: ambient.extend(1.0).to_array(),
            fog_color,
            fog_params,
        }
    }

    /// Uniforms for rendering from a light or probe viewpoint.
    #[must_use]
    pub fn from_view_projection(view_projection: Mat4, position: Vec3, range: f32) -> Self {
        Self {
            view_projection: view_projection.to_cols_array_2d(),
            view: Mat4::IDENTITY.to_cols_array_2d(),
            camera_position: position.extend(range).to_array(),
            ambient: [0.0; 4],
            fog_color: [0.0; 4],
            fog_params: [0.0; 4],
        }
    }
}

/// One element of the group 0, binding 1 light array.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightUniform {
    pub position_range: [f32; 4],
    /// `w` is `cos(outer)` for spot lights.
    pub direction_cone: [f32; 4],
    pub color_brightness: [f32; 4],
    /// Bias, factor, `cos(inner)`, map size.
    pub shadow_params: [f32; 4],
    pub light_view_projection: [[f32; 4]; 4],
}

impl LightUniform {
    #[must_use]
    pub fn from_light(light: &LayerLight, view_projection: Mat4, map_size: u32) -> Self {
        let l = &light.light;
        let (range, cos_outer, cos_inner) = match l.kind {
            LightKind::Directional => (0.0, -1.0, -1.0),
            LightKind::Point { range } => (range, -1.0, -1.0),
            LightKind::Spot { range, inner, outer } => (range, outer.cos(), inner.cos()),
        };
        Self {
            position_range: light.position.extend(range).to_array(),
            direction_cone: light.direction.extend(cos_outer).to_array(),
            color_brightness: l.color.extend(l.brightness).to_array(),
            shadow_params: [l.shadow_bias, l.shadow_factor, cos_inner, map_size as f32],
            light_view_projection: view_projection.to_cols_array_2d(),
        }
    }
}

/// Group 2, binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectUniforms {
    pub model: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
    /// Opacity, reflection probe index (-1 for none).
    pub params: [f32; 4],
    /// Morph target weights, four per row.
    pub morph_weights: [[f32; 4]; 2],
}

impl ObjectUniforms {
    #[must_use]
    pub fn new(world: &Affine3A, opacity: f32, probe: Option<usize>, morph_weights: &[f32]) -> Self {
        let model = Mat4::from(*world);
        let normal = Mat3::from(world.matrix3).inverse().transpose();
        let mut weights = [[0.0; 4]; 2];
        for (i, &w) in morph_weights.iter().take(MAX_MORPH_TARGETS).enumerate() {
            weights[i / 4][i % 4] = w;
        }
        Self {
            model: model.to_cols_array_2d(),
            normal_matrix: Mat4::from_mat3(normal).to_cols_array_2d(),
            params: [opacity, probe.map_or(-1.0, |p| p as f32), 0.0, 0.0],
            morph_weights: weights,
        }
    }
}

/// Eight map transforms at group 1, binding 1.
#[must_use]
pub fn map_transform_bytes(transforms: &[Mat3]) -> Vec<u8> {
    let mut out = Vec::with_capacity(transforms.len() * 64);
    for t in transforms {
        out.extend_from_slice(bytemuck::bytes_of(&Mat4::from_mat3(*t).to_cols_array()));
    }
    out
}

/// Effect uniforms: the texel size header followed by packed properties.
#[must_use]
pub fn effect_uniform_bytes(size: (u32, u32), values: &[(String, UniformValue)]) -> Vec<u8> {
    let (w, h) = (size.0.max(1) as f32, size.1.max(1) as f32);
    let header = [1.0 / w, 1.0 / h, w, h];
    let body = if values.is_empty() { 0 } else { packed_uniform_size(values) };
    let mut out = vec![0u8; 16 + body];
    out[..16].copy_from_slice(bytemuck::bytes_of(&header));
    pack_uniforms(values, &mut out[16..]);
    out
}
