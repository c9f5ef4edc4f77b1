//! Materials
//!
//! Materials are shared by reference: many models may point at one
//! [`MaterialId`](super::MaterialId). Their dirtiness is tracked apart from
//! node flags by a three-state machine:
//!
//! ```text
//!   mark_dirty()          clear_dirty()                update_dirty_for_frame()
//! Clean ─────────▶ Dirty ──────────────▶ DirtyWithinFrame ──────────────────────▶ Clean
//!                    ▲                          │
//!                    └──────── mark_dirty() ────┘
//! ```
//!
//! `is_dirty()` stays true for the rest of the frame after the first
//! preparation clears it, so every layer prepared in that frame still sees
//! the edit. The renderer moves it back to `Clean` at the next frame begin.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use super::ImageId;

pub const MAP_SLOT_COUNT: usize = 8;

/// Texture map slots a material can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapSlot {
    BaseColor = 0,
    Specular = 1,
    Roughness = 2,
    Metalness = 3,
    Normal = 4,
    Emissive = 5,
    Occlusion = 6,
    Opacity = 7,
}

impl MapSlot {
    pub const ALL: [MapSlot; MAP_SLOT_COUNT] = [
        Self::BaseColor,
        Self::Specular,
        Self::Roughness,
        Self::Metalness,
        Self::Normal,
        Self::Emissive,
        Self::Occlusion,
        Self::Opacity,
    ];

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::BaseColor => "base_color",
            Self::Specular => "specular",
            Self::Roughness => "roughness",
            Self::Metalness => "metalness",
            Self::Normal => "normal",
            Self::Emissive => "emissive",
            Self::Occlusion => "occlusion",
            Self::Opacity => "opacity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureChannel {
    #[default]
    R,
    G,
    B,
    A,
}

impl TextureChannel {
    #[inline]
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn swizzle(self) -> &'static str {
        match self {
            Self::R => "r",
            Self::G => "g",
            Self::B => "b",
            Self::A => "a",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureMapSlot {
    pub image: ImageId,
    pub channel: TextureChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AlphaMode {
    /// Blends when opacity < 1 or the base color texture has transparency.
    #[default]
    Default,
    Mask,
    Blend,
    Opaque,
}

impl AlphaMode {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    Back,
    Front,
    None,
}

impl CullMode {
    #[must_use]
    pub fn to_wgpu(self) -> Option<wgpu::Face> {
        match self {
            Self::Back => Some(wgpu::Face::Back),
            Self::Front => Some(wgpu::Face::Front),
            Self::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpecularModel {
    #[default]
    Default,
    KGgx,
    KWard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShadingMode {
    #[default]
    Shaded,
    Unshaded,
}

/// A typed uniform value for custom materials and effects.
///
/// Values are packed into 16-byte slots; a `Mat4` takes four.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl UniformValue {
    #[must_use]
    pub fn wgsl_type(&self) -> &'static str {
        match self {
            Self::Float(_) => "f32",
            Self::Int(_) => "i32",
            Self::Bool(_) => "u32",
            Self::Vec2(_) => "vec2<f32>",
            Self::Vec3(_) => "vec3<f32>",
            Self::Vec4(_) => "vec4<f32>",
            Self::Mat4(_) => "mat4x4<f32>",
        }
    }

    /// Number of 16-byte slots this value occupies.
    #[must_use]
    pub fn slots(&self) -> usize {
        match self {
            Self::Mat4(_) => 4,
            _ => 1,
        }
    }

    /// Writes the value at the start of `dst`, which must hold
    /// `slots() * 16` bytes.
    pub fn write_to(&self, dst: &mut [u8]) {
        match *self {
            Self::Float(v) => dst[..4].copy_from_slice(bytemuck::bytes_of(&v)),
            Self::Int(v) => dst[..4].copy_from_slice(bytemuck::bytes_of(&v)),
            Self::Bool(v) => dst[..4].copy_from_slice(bytemuck::bytes_of(&u32::from(v))),
            Self::Vec2(v) => dst[..8].copy_from_slice(bytemuck::bytes_of(&v.to_array())),
            Self::Vec3(v) => dst[..12].copy_from_slice(bytemuck::bytes_of(&v.to_array())),
            Self::Vec4(v) => dst[..16].copy_from_slice(bytemuck::bytes_of(&v.to_array())),
            Self::Mat4(v) => dst[..64].copy_from_slice(bytemuck::bytes_of(&v.to_cols_array())),
        }
    }
}

/// Packs named values into consecutive 16-byte slots.
#[must_use]
pub fn packed_uniform_size(values: &[(String, UniformValue)]) -> usize {
    values.iter().map(|(_, v)| v.slots() * 16).sum::<usize>().max(16)
}

pub fn pack_uniforms(values: &[(String, UniformValue)], dst: &mut [u8]) {
    let mut offset = 0;
    for (_, value) in values {
        let len = value.slots() * 16;
        value.write_to(&mut dst[offset..offset + len]);
        offset += len;
    }
}

// ============================================================================
// Material kinds
// ============================================================================

/// Metal/roughness parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PrincipledParams {
    pub base_color: Vec4,
    pub metalness: f32,
    pub roughness: f32,
    pub specular_amount: f32,
    pub emissive: Vec3,
    pub normal_strength: f32,
    pub occlusion_amount: f32,
    pub alpha_cutoff: f32,
}

impl Default for PrincipledParams {
    fn default() -> Self {
        Self {
            base_color: Vec4::ONE,
            metalness: 0.0,
            roughness: 0.5,
            specular_amount: 0.5,
            emissive: Vec3::ZERO,
            normal_strength: 1.0,
            occlusion_amount: 1.0,
            alpha_cutoff: 0.5,
        }
    }
}

/// Specular/glossy parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultParams {
    pub diffuse: Vec4,
    pub specular_model: SpecularModel,
    pub specular_tint: Vec3,
    pub specular_amount: f32,
    pub specular_roughness: f32,
    /// Zero disables the fresnel term.
    pub fresnel_power: f32,
    pub ior: f32,
    pub emissive: Vec3,
}

impl Default for DefaultParams {
    fn default() -> Self {
        Self {
            diffuse: Vec4::ONE,
            specular_model: SpecularModel::Default,
            specular_tint: Vec3::ONE,
            specular_amount: 0.0,
            specular_roughness: 0.0,
            fresnel_power: 0.0,
            ior: 1.45,
            emissive: Vec3::ZERO,
        }
    }
}

/// A material whose fragment code comes from a named shader source
/// registered with the shader generator.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMaterial {
    pub shader: String,
    pub properties: Vec<(String, UniformValue)>,
    pub shading: ShadingMode,
    /// The shader source supplies `custom_position` and replaces the
    /// default vertex transform.
    pub overrides_position: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MaterialKind {
    Principled(PrincipledParams),
    Default(DefaultParams),
    Custom(CustomMaterial),
}

impl MaterialKind {
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Principled(_) => 0,
            Self::Default(_) => 1,
            Self::Custom(_) => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaterialDirty {
    #[default]
    Clean,
    Dirty,
    DirtyWithinFrame,
}

// ============================================================================
// Material
// ============================================================================

#[derive(Debug, Clone)]
pub struct Material {
    pub kind: MaterialKind,
    pub maps: [Option<TextureMapSlot>; MAP_SLOT_COUNT],
    pub alpha_mode: AlphaMode,
    pub cull_mode: CullMode,
    pub lighting: bool,
    pub vertex_colors: bool,
    pub opacity: f32,

    dirty: MaterialDirty,
}

impl Material {
    fn with_kind(kind: MaterialKind) -> Self {
        Self {
            kind,
            maps: [None; MAP_SLOT_COUNT],
            alpha_mode: AlphaMode::Default,
            cull_mode: CullMode::Back,
            lighting: true,
            vertex_colors: false,
            opacity: 1.0,
            dirty: MaterialDirty::Dirty,
        }
    }

    #[must_use]
    pub fn principled() -> Self {
        Self::with_kind(MaterialKind::Principled(PrincipledParams::default()))
    }

    #[must_use]
    pub fn specular_glossy() -> Self {
        Self::with_kind(MaterialKind::Default(DefaultParams::default()))
    }

    #[must_use]
    pub fn custom(shader: impl Into<String>) -> Self {
        Self::with_kind(MaterialKind::Custom(CustomMaterial {
            shader: shader.into(),
            properties: Vec::new(),
            shading: ShadingMode::Shaded,
            overrides_position: false,
        }))
    }

    #[must_use]
    pub fn with_map(mut self, slot: MapSlot, image: ImageId, channel: TextureChannel) -> Self {
        self.maps[slot.index()] = Some(TextureMapSlot { image, channel });
        self
    }

    #[must_use]
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    #[must_use]
    pub fn with_alpha_mode(mut self, alpha_mode: AlphaMode) -> Self {
        self.alpha_mode = alpha_mode;
        self
    }

    #[inline]
    #[must_use]
    pub fn map(&self, slot: MapSlot) -> Option<&TextureMapSlot> {
        self.maps[slot.index()].as_ref()
    }

    pub fn set_map(&mut self, slot: MapSlot, map: Option<TextureMapSlot>) {
        self.maps[slot.index()] = map;
    }

    /// Lighting is off for unlit materials and unshaded custom materials.
    #[must_use]
    pub fn uses_lighting(&self) -> bool {
        match &self.kind {
            MaterialKind::Custom(custom) => {
                self.lighting && custom.shading == ShadingMode::Shaded
            }
            _ => self.lighting,
        }
    }

    /// Whether objects using this material sort as transparent, given
    /// whether the bound base color texture carries alpha.
    #[must_use]
    pub fn is_transparent(&self, base_texture_has_alpha: bool) -> bool {
        match self.alpha_mode {
            AlphaMode::Blend => true,
            AlphaMode::Opaque | AlphaMode::Mask => false,
            AlphaMode::Default => {
                let base_alpha = match &self.kind {
                    MaterialKind::Principled(p) => p.base_color.w,
                    MaterialKind::Default(d) => d.diffuse.w,
                    MaterialKind::Custom(_) => 1.0,
                };
                self.opacity < 1.0 || base_alpha < 1.0 || base_texture_has_alpha
            }
        }
    }

    // === Dirty state machine ===

    pub fn mark_dirty(&mut self) {
        self.dirty = MaterialDirty::Dirty;
    }

    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty != MaterialDirty::Clean
    }

    /// Called once the preparation pass has consumed the edit.
    pub fn clear_dirty(&mut self) {
        if self.dirty == MaterialDirty::Dirty {
            self.dirty = MaterialDirty::DirtyWithinFrame;
        }
    }

    /// Called at frame begin for materials cleared during the last frame.
    pub fn update_dirty_for_frame(&mut self) {
        if self.dirty == MaterialDirty::DirtyWithinFrame {
            self.dirty = MaterialDirty::Clean;
        }
    }

    #[inline]
    #[must_use]
    pub fn dirty_state(&self) -> MaterialDirty {
        self.dirty
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::principled()
    }
}

/// GPU layout of the built-in material parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MaterialUniforms {
    pub base_color: [f32; 4],
    /// xyz emissive, w roughness.
    pub emissive_roughness: [f32; 4],
    /// metalness, specular amount, opacity, alpha cutoff.
    pub params: [f32; 4],
    /// xyz specular tint, w fresnel power.
    pub specular: [f32; 4],
    /// ior, normal strength, occlusion amount, unused.
    pub extra: [f32; 4],
}

impl MaterialUniforms {
    #[must_use]
    pub fn from_material(material: &Material) -> Self {
        match &material.kind {
            MaterialKind::Principled(p) => Self {
                base_color: p.base_color.to_array(),
                emissive_roughness: p.emissive.extend(p.roughness).to_array(),
                params: [p.metalness, p.specular_amount, material.opacity, p.alpha_cutoff],
                specular: [1.0, 1.0, 1.0, 0.0],
                extra: [1.5, p.normal_strength, p.occlusion_amount, 0.0],
            },
            MaterialKind::Default(d) => Self {
                base_color: d.diffuse.to_array(),
                emissive_roughness: d.emissive.extend(d.specular_roughness).to_array(),
                params: [0.0, d.specular_amount, material.opacity, 0.5],
                specular: d.specular_tint.extend(d.fresnel_power).to_array(),
                extra: [d.ior, 1.0, 1.0, 0.0],
            },
            MaterialKind::Custom(_) => Self {
                base_color: [1.0; 4],
                emissive_roughness: [0.0; 4],
                params: [0.0, 0.0, material.opacity, 0.5],
                specular: [0.0; 4],
                extra: [0.0; 4],
            },
        }
    }
}
