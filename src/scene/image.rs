use bitflags::bitflags;
use glam::{Mat3, Vec2};

use super::TextureDataId;
use crate::settings::MipMode;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageFlags: u8 {
        /// Source or sampling state changed; the GPU texture must be re-resolved.
        const DIRTY = 1 << 0;
        /// UV transform inputs changed; the cached matrix is stale.
        const TRANSFORM_DIRTY = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureSource {
    Path(String),
    Data(TextureDataId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tiling {
    #[default]
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

impl Tiling {
    #[must_use]
    pub fn to_wgpu(self) -> wgpu::AddressMode {
        match self {
            Self::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            Self::Repeat => wgpu::AddressMode::Repeat,
            Self::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MappingMode {
    #[default]
    Uv,
    Environment,
    LightProbe,
}

/// A texture reference with its own UV transform and sampling state.
#[derive(Debug, Clone)]
pub struct Image {
    source: TextureSource,

    scale: Vec2,
    /// Degrees, counter-clockwise.
    rotation: f32,
    pivot: Vec2,
    position: Vec2,

    pub tiling: Tiling,
    pub filter: wgpu::FilterMode,
    pub mapping: MappingMode,
    /// `None` uses the renderer default.
    pub mip_mode: Option<MipMode>,
    pub premultiplied_alpha: bool,

    flags: ImageFlags,
    cached_transform: Mat3,
}

impl Image {
    #[must_use]
    pub fn new(source: TextureSource) -> Self {
        Self {
            source,
            scale: Vec2::ONE,
            rotation: 0.0,
            pivot: Vec2::ZERO,
            position: Vec2::ZERO,
            tiling: Tiling::Repeat,
            filter: wgpu::FilterMode::Linear,
            mapping: MappingMode::Uv,
            mip_mode: None,
            premultiplied_alpha: false,
            flags: ImageFlags::all(),
            cached_transform: Mat3::IDENTITY,
        }
    }

    #[must_use]
    pub fn from_path(path: impl Into<String>) -> Self {
        Self::new(TextureSource::Path(path.into()))
    }

    #[must_use]
    pub fn source(&self) -> &TextureSource {
        &self.source
    }

    pub fn set_source(&mut self, source: TextureSource) {
        if self.source != source {
            self.source = source;
            self.flags.insert(ImageFlags::DIRTY);
        }
    }

    pub fn set_scale(&mut self, scale: Vec2) {
        self.scale = scale;
        self.flags.insert(ImageFlags::TRANSFORM_DIRTY);
    }

    pub fn set_rotation(&mut self, degrees: f32) {
        self.rotation = degrees;
        self.flags.insert(ImageFlags::TRANSFORM_DIRTY);
    }

    pub fn set_pivot(&mut self, pivot: Vec2) {
        self.pivot = pivot;
        self.flags.insert(ImageFlags::TRANSFORM_DIRTY);
    }

    pub fn set_position(&mut self, position: Vec2) {
        self.position = position;
        self.flags.insert(ImageFlags::TRANSFORM_DIRTY);
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> ImageFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.flags.is_empty()
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.flags.insert(ImageFlags::DIRTY);
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.flags.remove(ImageFlags::DIRTY);
    }

    /// UV transform, recomputed only when its inputs changed.
    pub fn texture_transform(&mut self) -> Mat3 {
        if self.flags.contains(ImageFlags::TRANSFORM_DIRTY) {
            self.cached_transform = Mat3::from_translation(self.position + self.pivot)
                * Mat3::from_angle(self.rotation.to_radians())
                * Mat3::from_scale(self.scale)
                * Mat3::from_translation(-self.pivot);
            self.flags.remove(ImageFlags::TRANSFORM_DIRTY);
        }
        self.cached_transform
    }

    /// True when sampling can skip the UV transform.
    #[must_use]
    pub fn has_identity_transform(&mut self) -> bool {
        self.texture_transform().abs_diff_eq(Mat3::IDENTITY, 1e-6)
    }

    #[must_use]
    pub fn sampler_key(&self) -> (wgpu::FilterMode, wgpu::AddressMode) {
        (self.filter, self.tiling.to_wgpu())
    }
}
