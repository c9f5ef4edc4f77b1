//! Renderer Settings
//!
//! Configuration consumed by [`Renderer::new`](crate::renderer::Renderer::new)
//! and adjustable at runtime through
//! [`Renderer::set_settings`](crate::renderer::Renderer::set_settings).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lumen::settings::{RendererSettings, TonemapMode};
//!
//! let settings = RendererSettings {
//!     tonemap_mode: TonemapMode::Aces,
//!     max_lights_per_object: 8,
//!     ..Default::default()
//! };
//!
//! // Or from a JSON document; missing fields keep their defaults.
//! let settings = RendererSettings::from_json_str(r#"{ "shadow_map_size": 2048 }"#)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::Result;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Tonemapping operator applied in the material shaders.
///
/// Part of the shader key, so switching it creates new variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TonemapMode {
    #[default]
    None,
    Linear,
    Aces,
    HejlDawson,
    Filmic,
}

impl TonemapMode {
    #[inline]
    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Linear => 1,
            Self::Aces => 2,
            Self::HejlDawson => 3,
            Self::Filmic => 4,
        }
    }
}

/// Color space of the final output target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputColorSpace {
    #[default]
    Srgb,
    Linear,
}

/// Shadow filtering technique for directional and spot lights.
///
/// | Technique | Targets | Requires |
/// |-----------|---------|----------|
/// | `Vsm`     | depth + RG moments, blurred | float render targets |
/// | `Pcf`     | depth only | nothing |
///
/// `Vsm` falls back to `Pcf` when the backend lacks float render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShadowTechnique {
    #[default]
    Vsm,
    Pcf,
}

/// How texture mip chains are built when the caller does not say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MipMode {
    /// Single level.
    #[default]
    None,
    /// Box-filtered chain generated on upload.
    Generated,
    /// Chain prepared for environment lighting (image-based lighting).
    Bsdf,
}

// ---------------------------------------------------------------------------
// RendererSettings
// ---------------------------------------------------------------------------

/// Global renderer configuration.
///
/// # Fields
///
/// | Field                          | Description                                  | Default          |
/// |--------------------------------|----------------------------------------------|------------------|
/// | `max_lights_per_object`        | Lights assigned to one renderable            | 15               |
/// | `light_culling`                | Drop point/spot lights out of range          | `false`          |
/// | `shadow_map_size`              | Default shadow map resolution                | 1024             |
/// | `shadow_technique`             | Shadow filtering                             | `Vsm`            |
/// | `texture_mip_mode`             | Default mip mode for images                  | `None`           |
/// | `effect_texture_idle_frames`   | Frames before an unused effect target dies   | 1                |
/// | `arena_slab_size`              | Small-allocation slab size (bytes)           | 64 KiB           |
/// | `arena_large_threshold`        | Allocations above this go to the large tier  | 8 KiB            |
/// | `color_format`                 | Main color target format                     | `Rgba16Float`    |
/// | `depth_format`                 | Depth target format                          | `Depth32Float`   |
/// | `output_color_space`           | Output color space                           | `Srgb`           |
/// | `tonemap_mode`                 | Tonemapping operator                         | `None`           |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    // === Lighting ===
    pub max_lights_per_object: usize,
    /// Spatial light culling. Purely a performance option: with it disabled
    /// every light in the layer reaches every object it is not excluded from.
    pub light_culling: bool,

    // === Shadows ===
    pub shadow_map_size: u32,
    pub shadow_technique: ShadowTechnique,

    // === Resources ===
    pub texture_mip_mode: MipMode,
    pub effect_texture_idle_frames: u32,

    // === Per-frame arena ===
    pub arena_slab_size: usize,
    pub arena_large_threshold: usize,

    // === Output ===
    #[serde(with = "format_serde")]
    pub color_format: wgpu::TextureFormat,
    #[serde(with = "format_serde")]
    pub depth_format: wgpu::TextureFormat,
    pub output_color_space: OutputColorSpace,
    pub tonemap_mode: TonemapMode,
}

/// Maximum number of lights a single shader variant can address.
pub const MAX_LIGHTS: usize = 15;

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            max_lights_per_object: MAX_LIGHTS,
            light_culling: false,

            shadow_map_size: 1024,
            shadow_technique: ShadowTechnique::Vsm,

            texture_mip_mode: MipMode::None,
            effect_texture_idle_frames: 1,

            arena_slab_size: 64 * 1024,
            arena_large_threshold: 8 * 1024,

            color_format: wgpu::TextureFormat::Rgba16Float,
            depth_format: wgpu::TextureFormat::Depth32Float,
            output_color_space: OutputColorSpace::Srgb,
            tonemap_mode: TonemapMode::None,
        }
    }
}

impl RendererSettings {
    /// Parses settings from JSON. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut settings: Self = serde_json::from_str(json)?;
        settings.sanitize();
        Ok(settings)
    }

    /// Clamps out-of-range values instead of rejecting them.
    pub fn sanitize(&mut self) {
        if self.max_lights_per_object > MAX_LIGHTS {
            log::warn!(
                "max_lights_per_object {} exceeds {MAX_LIGHTS}, clamping",
                self.max_lights_per_object
            );
            self.max_lights_per_object = MAX_LIGHTS;
        }
        if !self.shadow_map_size.is_power_of_two() {
            let size = self.shadow_map_size.max(1).next_power_of_two();
            log::warn!(
                "shadow_map_size {} is not a power of two, using {size}",
                self.shadow_map_size
            );
            self.shadow_map_size = size;
        }
        self.arena_large_threshold = self.arena_large_threshold.min(self.arena_slab_size);
    }

    /// Returns `true` if switching from `self` to `other` changes generated
    /// shader source, which requires dropping every cached pipeline.
    #[must_use]
    pub fn invalidates_pipelines(&self, other: &Self) -> bool {
        self.output_color_space != other.output_color_space
            || self.tonemap_mode != other.tonemap_mode
            || self.color_format != other.color_format
            || self.depth_format != other.depth_format
            || self.shadow_technique != other.shadow_technique
    }
}

/// `wgpu::TextureFormat` has no serde support without wgpu's `serde`
/// feature, so formats are stored by name.
mod format_serde {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    const FORMATS: &[(&str, wgpu::TextureFormat)] = &[
        ("rgba8unorm", wgpu::TextureFormat::Rgba8Unorm),
        ("rgba8unorm-srgb", wgpu::TextureFormat::Rgba8UnormSrgb),
        ("bgra8unorm", wgpu::TextureFormat::Bgra8Unorm),
        ("bgra8unorm-srgb", wgpu::TextureFormat::Bgra8UnormSrgb),
        ("rgba16float", wgpu::TextureFormat::Rgba16Float),
        ("rgba32float", wgpu::TextureFormat::Rgba32Float),
        ("depth32float", wgpu::TextureFormat::Depth32Float),
        ("depth24plus", wgpu::TextureFormat::Depth24Plus),
    ];

    pub fn serialize<S: Serializer>(
        format: &wgpu::TextureFormat,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let name = FORMATS
            .iter()
            .find(|(_, f)| f == format)
            .map_or("rgba8unorm", |(name, _)| name);
        serializer.serialize_str(name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<wgpu::TextureFormat, D::Error> {
        let name = String::deserialize(deserializer)?;
        FORMATS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
            .map(|&(_, f)| f)
            .ok_or_else(|| D::Error::custom(format!("unknown texture format '{name}'")))
    }
}
