use glam::Vec3;

use super::NodeId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Directional,
    Point {
        range: f32,
    },
    /// Cone angles are half-angles in radians.
    Spot {
        range: f32,
        inner: f32,
        outer: f32,
    },
}

impl LightKind {
    /// Range for point and spot lights; `None` for directional.
    #[must_use]
    pub fn range(&self) -> Option<f32> {
        match *self {
            Self::Directional => None,
            Self::Point { range } | Self::Spot { range, .. } => Some(range),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub ambient: Vec3,
    /// A light with brightness <= 0 is disabled.
    pub brightness: f32,

    pub cast_shadow: bool,
    pub shadow_bias: f32,
    pub shadow_factor: f32,
    /// Overrides the renderer's default shadow map size when set.
    pub shadow_map_size: Option<u32>,

    /// Restricts the light to the subtree rooted at this node.
    pub scope: Option<NodeId>,
}

impl Light {
    fn with_kind(kind: LightKind, color: Vec3, brightness: f32) -> Self {
        Self {
            kind,
            color,
            ambient: Vec3::ZERO,
            brightness,
            cast_shadow: false,
            shadow_bias: 0.005,
            shadow_factor: 1.0,
            shadow_map_size: None,
            scope: None,
        }
    }

    #[must_use]
    pub fn new_directional(color: Vec3, brightness: f32) -> Self {
        Self::with_kind(LightKind::Directional, color, brightness)
    }

    #[must_use]
    pub fn new_point(color: Vec3, brightness: f32, range: f32) -> Self {
        Self::with_kind(LightKind::Point { range }, color, brightness)
    }

    #[must_use]
    pub fn new_spot(color: Vec3, brightness: f32, range: f32, inner: f32, outer: f32) -> Self {
        Self::with_kind(LightKind::Spot { range, inner, outer }, color, brightness)
    }

    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.brightness > 0.0
    }

    #[inline]
    #[must_use]
    pub fn is_directional(&self) -> bool {
        matches!(self.kind, LightKind::Directional)
    }
}
