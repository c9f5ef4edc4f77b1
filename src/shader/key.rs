//! Shader Key
//!
//! A fixed-width bitset describing everything that changes generated shader
//! source for one drawable. Equal keys produce byte-identical source.
//!
//! Properties are laid out once, at first use, by an offset allocator that
//! never lets a property straddle two words:
//!
//! | Group | Properties |
//! |-------|------------|
//! | lighting | `has_lighting`, `has_ibl`, `light_count`, `light{i}` (directional/spot/shadow), specular and fresnel, `specular_model` |
//! | material | `material_kind`, `alpha_mode`, `double_sided`, `overrides_position`, `vertex_colors` |
//! | textures | `image_map{i}` (6 flag bits), `texture_channel{i}` (2 bits) |
//! | geometry | `vertex_attributes`, `bone_count`, `instanced`, `morph_targets`, `morph_normals` |
//! | scene | `tonemap_mode`, `fog`, `ssao`, `receives_shadows`, `reflection_probe` |
//!
//! Texture *identity* never enters the key, only presence and channel. Two
//! materials that differ only in bound images share one pipeline.

use std::fmt;
use std::sync::OnceLock;

use bitflags::bitflags;

use crate::resources::{MorphLayout, VertexAttributes};
use crate::scene::material::{CullMode, MAP_SLOT_COUNT, Material, MaterialKind, SpecularModel};
use crate::scene::TextureChannel;
use crate::settings::{MAX_LIGHTS, TonemapMode};

pub const KEY_WORDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShaderKey(pub [u32; KEY_WORDS]);

impl ShaderKey {
    #[inline]
    #[must_use]
    pub fn words(&self) -> &[u32; KEY_WORDS] {
        &self.0
    }
}

impl fmt::Display for ShaderKey {
    /// Renders `name=value;` for every property.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for property in &ShaderKeyProperties::get().all {
            match property.index {
                Some(i) => write!(f, "{}{i}={};", property.name, property.get(self))?,
                None => write!(f, "{}={};", property.name, property.get(self))?,
            }
        }
        Ok(())
    }
}

// ============================================================================
// Properties
// ============================================================================

/// Position of one property inside the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyProperty {
    pub name: &'static str,
    pub index: Option<u8>,
    word: u8,
    shift: u8,
    bits: u8,
}

impl KeyProperty {
    #[inline]
    fn mask(&self) -> u32 {
        if self.bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.bits) - 1
        }
    }

    #[inline]
    #[must_use]
    pub fn max_value(&self) -> u32 {
        self.mask()
    }

    #[inline]
    #[must_use]
    pub fn get(&self, key: &ShaderKey) -> u32 {
        (key.0[self.word as usize] >> self.shift) & self.mask()
    }

    /// Stores `value`, saturating at the property's width.
    #[inline]
    pub fn set(&self, key: &mut ShaderKey, value: u32) {
        let mask = self.mask();
        let word = &mut key.0[self.word as usize];
        *word = (*word & !(mask << self.shift)) | (value.min(mask) << self.shift);
    }

    #[must_use]
    pub fn bits(&self) -> u32 {
        u32::from(self.bits)
    }

    #[must_use]
    pub fn bit_offset(&self) -> u32 {
        u32::from(self.word) * 32 + u32::from(self.shift)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyBool(KeyProperty);

impl KeyBool {
    #[must_use]
    pub fn get(&self, key: &ShaderKey) -> bool {
        self.0.get(key) != 0
    }

    pub fn set(&self, key: &mut ShaderKey, value: bool) {
        self.0.set(key, u32::from(value));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyUnsigned(KeyProperty);

impl KeyUnsigned {
    #[must_use]
    pub fn get(&self, key: &ShaderKey) -> u32 {
        self.0.get(key)
    }

    pub fn set(&self, key: &mut ShaderKey, value: u32) {
        self.0.set(key, value);
    }

    #[must_use]
    pub fn max_value(&self) -> u32 {
        self.0.max_value()
    }
}

bitflags! {
    /// Per-slot image map bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageMapFlags: u32 {
        const ENABLED            = 1 << 0;
        const ENV_MAP            = 1 << 1;
        const LIGHT_PROBE        = 1 << 2;
        const INVERT_UV          = 1 << 3;
        const PREMULTIPLIED      = 1 << 4;
        const IDENTITY_TRANSFORM = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyImageMap(KeyProperty);

impl KeyImageMap {
    #[must_use]
    pub fn get(&self, key: &ShaderKey) -> ImageMapFlags {
        ImageMapFlags::from_bits_truncate(self.0.get(key))
    }

    pub fn set(&self, key: &mut ShaderKey, flags: ImageMapFlags) {
        self.0.set(key, flags.bits());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyTextureChannel(KeyProperty);

impl KeyTextureChannel {
    #[must_use]
    pub fn get(&self, key: &ShaderKey) -> TextureChannel {
        match self.0.get(key) {
            0 => TextureChannel::R,
            1 => TextureChannel::G,
            2 => TextureChannel::B,
            _ => TextureChannel::A,
        }
    }

    pub fn set(&self, key: &mut ShaderKey, channel: TextureChannel) {
        self.0.set(key, channel.as_u32());
    }
}

bitflags! {
    /// Per-light bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LightKeyFlags: u32 {
        const DIRECTIONAL = 1 << 0;
        const SPOT        = 1 << 1;
        const SHADOW      = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyLightFlags(KeyProperty);

impl KeyLightFlags {
    #[must_use]
    pub fn get(&self, key: &ShaderKey) -> LightKeyFlags {
        LightKeyFlags::from_bits_truncate(self.0.get(key))
    }

    pub fn set(&self, key: &mut ShaderKey, flags: LightKeyFlags) {
        self.0.set(key, flags.bits());
    }
}

struct OffsetAllocator {
    word: u8,
    shift: u8,
    all: Vec<KeyProperty>,
}

impl OffsetAllocator {
    fn alloc(&mut self, name: &'static str, index: Option<u8>, bits: u8) -> KeyProperty {
        if u32::from(self.shift) + u32::from(bits) > 32 {
            self.word += 1;
            self.shift = 0;
        }
        assert!(
            (self.word as usize) < KEY_WORDS,
            "shader key layout exceeds {KEY_WORDS} words at '{name}'"
        );
        let property = KeyProperty {
            name,
            index,
            word: self.word,
            shift: self.shift,
            bits,
        };
        self.shift += bits;
        self.all.push(property);
        property
    }

    fn flag(&mut self, name: &'static str) -> KeyBool {
        KeyBool(self.alloc(name, None, 1))
    }

    fn unsigned(&mut self, name: &'static str, bits: u8) -> KeyUnsigned {
        KeyUnsigned(self.alloc(name, None, bits))
    }
}

/// The static key layout.
pub struct ShaderKeyProperties {
    pub has_lighting: KeyBool,
    pub has_ibl: KeyBool,
    pub light_count: KeyUnsigned,
    pub lights: [KeyLightFlags; MAX_LIGHTS],
    pub specular_enabled: KeyBool,
    pub fresnel_enabled: KeyBool,
    pub specular_model: KeyUnsigned,

    pub material_kind: KeyUnsigned,
    pub alpha_mode: KeyUnsigned,
    pub double_sided: KeyBool,
    pub overrides_position: KeyBool,
    pub vertex_colors: KeyBool,

    pub image_maps: [KeyImageMap; MAP_SLOT_COUNT],
    pub texture_channels: [KeyTextureChannel; MAP_SLOT_COUNT],

    pub vertex_attributes: KeyUnsigned,
    pub bone_count: KeyUnsigned,
    pub instanced: KeyBool,
    pub morph_targets: KeyUnsigned,
    pub morph_normals: KeyUnsigned,

    pub tonemap_mode: KeyUnsigned,
    pub fog: KeyBool,
    pub ssao: KeyBool,
    pub receives_shadows: KeyBool,
    pub reflection_probe: KeyBool,

    all: Vec<KeyProperty>,
}

static PROPERTIES: OnceLock<ShaderKeyProperties> = OnceLock::new();

impl ShaderKeyProperties {
    pub fn get() -> &'static Self {
        PROPERTIES.get_or_init(Self::layout)
    }

    fn layout() -> Self {
        let mut a = OffsetAllocator {
            word: 0,
            shift: 0,
            all: Vec::with_capacity(64),
        };

        let has_lighting = a.flag("has_lighting");
        let has_ibl = a.flag("has_ibl");
        let light_count = a.unsigned("light_count", 4);
        let lights = std::array::from_fn(|i| KeyLightFlags(a.alloc("light", Some(i as u8), 3)));
        let specular_enabled = a.flag("specular_enabled");
        let fresnel_enabled = a.flag("fresnel_enabled");
        let specular_model = a.unsigned("specular_model", 2);

        let material_kind = a.unsigned("material_kind", 2);
        let alpha_mode = a.unsigned("alpha_mode", 2);
        let double_sided = a.flag("double_sided");
        let overrides_position = a.flag("overrides_position");
        let vertex_colors = a.flag("vertex_colors");

        let image_maps =
            std::array::from_fn(|i| KeyImageMap(a.alloc("image_map", Some(i as u8), 6)));
        let texture_channels =
            std::array::from_fn(|i| KeyTextureChannel(a.alloc("texture_channel", Some(i as u8), 2)));

        let vertex_attributes = a.unsigned("vertex_attributes", 8);
        let bone_count = a.unsigned("bone_count", 16);
        let instanced = a.flag("instanced");
        let morph_targets = a.unsigned("morph_targets", 4);
        let morph_normals = a.unsigned("morph_normals", 3);

        let tonemap_mode = a.unsigned("tonemap_mode", 3);
        let fog = a.flag("fog");
        let ssao = a.flag("ssao");
        let receives_shadows = a.flag("receives_shadows");
        let reflection_probe = a.flag("reflection_probe");

        Self {
            has_lighting,
            has_ibl,
            light_count,
            lights,
            specular_enabled,
            fresnel_enabled,
            specular_model,
            material_kind,
            alpha_mode,
            double_sided,
            overrides_position,
            vertex_colors,
            image_maps,
            texture_channels,
            vertex_attributes,
            bone_count,
            instanced,
            morph_targets,
            morph_normals,
            tonemap_mode,
            fog,
            ssao,
            receives_shadows,
            reflection_probe,
            all: a.all,
        }
    }

    pub fn property_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.all.iter().map(|p| p.name)
    }

    #[must_use]
    pub fn properties(&self) -> &[KeyProperty] {
        &self.all
    }
}

// ============================================================================
// Scene-wide features
// ============================================================================

bitflags! {
    /// Scene-wide shader features, shared by every drawable in a layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderFeatures: u32 {
        const IBL               = 1 << 0;
        const SSAO              = 1 << 1;
        const FOG               = 1 << 2;
        const DEPTH_PRE_PASS    = 1 << 3;
        const SHADOW_PCF        = 1 << 4;
        const SHADOW_VSM        = 1 << 5;
        const REFLECTION_PROBES = 1 << 6;
        const LINEAR_OUTPUT     = 1 << 7;
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Image-derived state of one bound map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MapKeyState {
    pub env_map: bool,
    pub light_probe: bool,
    pub invert_uv: bool,
    pub premultiplied: bool,
    pub identity_transform: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LightKeyState {
    pub directional: bool,
    pub spot: bool,
    pub shadow: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ObjectKeyState {
    pub bone_count: u32,
    pub instanced: bool,
    /// Blend shapes the mesh feeds to the vertex stage.
    pub morph: MorphLayout,
    pub receives_shadows: bool,
    pub reflection_probe: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LayerKeyState {
    pub features: ShaderFeatures,
    pub tonemap: TonemapMode,
}

pub struct ShaderKeyResolver;

impl ShaderKeyResolver {
    /// Computes the key for one material on one drawable.
    ///
    /// `maps[i]` is `Some` when slot `i` has a resolvable image; the material
    /// must also reference a map in that slot for it to count as present.
    #[must_use]
    pub fn resolve(
        material: &Material,
        maps: &[Option<MapKeyState>; MAP_SLOT_COUNT],
        lights: &[LightKeyState],
        attributes: VertexAttributes,
        object: &ObjectKeyState,
        layer: &LayerKeyState,
    ) -> ShaderKey {
        let p = ShaderKeyProperties::get();
        let mut key = ShaderKey::default();

        let lit = material.uses_lighting();
        p.has_lighting.set(&mut key, lit);
        p.material_kind.set(&mut key, material.kind.as_u32());
        p.alpha_mode.set(&mut key, material.alpha_mode.as_u32());
        p.double_sided.set(&mut key, material.cull_mode == CullMode::None);
        p.vertex_colors.set(
            &mut key,
            material.vertex_colors && attributes.contains(VertexAttributes::COLOR),
        );

        match &material.kind {
            MaterialKind::Principled(params) => {
                p.specular_enabled.set(&mut key, lit && params.specular_amount > 0.0);
            }
            MaterialKind::Default(params) => {
                p.specular_enabled.set(&mut key, lit && params.specular_amount > 0.0);
                p.fresnel_enabled.set(&mut key, lit && params.fresnel_power > 0.0);
                let model = match params.specular_model {
                    SpecularModel::Default => 0,
                    SpecularModel::KGgx => 1,
                    SpecularModel::KWard => 2,
                };
                p.specular_model.set(&mut key, model);
            }
            MaterialKind::Custom(custom) => {
                p.overrides_position.set(&mut key, custom.overrides_position);
            }
        }

        let mut any_shadow = false;
        if lit {
            let count = lights.len().min(MAX_LIGHTS);
            p.light_count.set(&mut key, count as u32);
            for (slot, light) in p.lights.iter().zip(&lights[..count]) {
                let mut flags = LightKeyFlags::empty();
                flags.set(LightKeyFlags::DIRECTIONAL, light.directional);
                flags.set(LightKeyFlags::SPOT, light.spot);
                flags.set(LightKeyFlags::SHADOW, light.shadow);
                any_shadow |= light.shadow;
                slot.set(&mut key, flags);
            }
            p.has_ibl.set(&mut key, layer.features.contains(ShaderFeatures::IBL));
            p.ssao.set(&mut key, layer.features.contains(ShaderFeatures::SSAO));
            p.reflection_probe.set(&mut key, object.reflection_probe);
        }
        p.receives_shadows.set(&mut key, lit && any_shadow && object.receives_shadows);
        p.fog.set(&mut key, layer.features.contains(ShaderFeatures::FOG));
        p.tonemap_mode.set(&mut key, layer.tonemap.as_u32());

        for (i, slot) in material.maps.iter().enumerate() {
            let (Some(slot), Some(state)) = (slot, maps[i]) else {
                continue;
            };
            let mut flags = ImageMapFlags::ENABLED;
            flags.set(ImageMapFlags::ENV_MAP, state.env_map);
            flags.set(ImageMapFlags::LIGHT_PROBE, state.light_probe);
            flags.set(ImageMapFlags::INVERT_UV, state.invert_uv);
            flags.set(ImageMapFlags::PREMULTIPLIED, state.premultiplied);
            flags.set(ImageMapFlags::IDENTITY_TRANSFORM, state.identity_transform);
            p.image_maps[i].set(&mut key, flags);
            p.texture_channels[i].set(&mut key, slot.channel);
        }

        p.vertex_attributes.set(&mut key, attributes.bits() & 0xFF);
        p.bone_count.set(&mut key, object.bone_count);
        p.instanced.set(&mut key, object.instanced);
        p.morph_targets.set(&mut key, object.morph.targets);
        p.morph_normals.set(&mut key, object.morph.normals);
        key
    }
}

impl ShaderKeyProperties {
    /// Morph layout a key was resolved with.
    #[must_use]
    pub fn morph_layout(&self, key: &ShaderKey) -> MorphLayout {
        MorphLayout {
            targets: self.morph_targets.get(key),
            normals: self.morph_normals.get(key),
        }
    }
}
