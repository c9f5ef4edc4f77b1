//! Shader Code Generator
//!
//! Renders WGSL from `minijinja` templates. Built-in templates are embedded
//! with `rust-embed`; custom material and effect code is registered at
//! runtime with [`ShaderGenerator::add_template_owned`] and pulled into the
//! built-in templates through `{$ include $}`.
//!
//! Template contexts are derived only from the [`ShaderKey`], the scene-wide
//! [`ShaderFeatures`] and the registered source, so equal inputs always render
//! byte-identical source.

use std::borrow::Cow;

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, Error, ErrorKind};
use rust_embed::RustEmbed;
use serde::Serialize;
use smallvec::SmallVec;

use super::key::{ImageMapFlags, LightKeyFlags, ShaderFeatures, ShaderKey, ShaderKeyProperties};
use crate::errors::{LumenError, Result};
use crate::resources::VertexAttributes;
use crate::scene::material::MAP_SLOT_COUNT;
use crate::scene::{MapSlot, UniformValue};

#[derive(RustEmbed)]
#[folder = "src/shader/templates"]
struct ShaderTemplates;

fn template_loader(name: &str) -> std::result::Result<Option<String>, Error> {
    let filename = if std::path::Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wgsl"))
    {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("{name}.wgsl"))
    };

    match ShaderTemplates::get(&filename) {
        Some(file) => match std::str::from_utf8(file.data.as_ref()) {
            Ok(source) => Ok(Some(source.to_owned())),
            Err(e) => Err(Error::new(
                ErrorKind::TemplateNotFound,
                format!("template '{filename}' is not UTF-8: {e}"),
            )),
        },
        None => Ok(None),
    }
}

// ============================================================================
// Binding layout
// ============================================================================

/// Bind group slots used by material variants.
///
/// | Group | Contents |
/// |-------|----------|
/// | 0 | frame uniforms (0), light array (1) |
/// | 1 | material uniforms (0), map transforms (1), map texture/sampler pairs from 2 |
/// | 2 | object uniforms (0) |
/// | 3 | shadow map texture/sampler pairs from 0 |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterialBindingLayout {
    pub lights: bool,
    pub map_transforms: bool,
    /// `(map slot, binding)` of each enabled map.
    pub maps: SmallVec<[(usize, u32); MAP_SLOT_COUNT]>,
    /// `(light index, binding)` of each sampled shadow map.
    pub shadows: SmallVec<[(usize, u32); 4]>,
    /// Group 3 binding of the reflection cube map, after the shadow maps.
    pub reflection: Option<u32>,
    /// Group 3 binding of the layer's equirectangular light probe.
    pub light_probe: Option<u32>,
    /// Group 3 binding of the screen-space AO texture, last.
    pub ao: Option<u32>,
}

impl MaterialBindingLayout {
    #[must_use]
    pub fn from_key(key: &ShaderKey) -> Self {
        let p = ShaderKeyProperties::get();
        let mut layout = Self {
            lights: p.light_count.get(key) > 0,
            ..Default::default()
        };

        let mut binding = 2;
        for (slot, property) in p.image_maps.iter().enumerate() {
            let flags = property.get(key);
            if flags.contains(ImageMapFlags::ENABLED) {
                layout.maps.push((slot, binding));
                binding += 2;
                if !flags.contains(ImageMapFlags::IDENTITY_TRANSFORM) {
                    layout.map_transforms = true;
                }
            }
        }

        let mut binding = 0;
        if p.receives_shadows.get(key) {
            let count = p.light_count.get(key) as usize;
            for (i, property) in p.lights.iter().take(count).enumerate() {
                if property.get(key).contains(LightKeyFlags::SHADOW) {
                    layout.shadows.push((i, binding));
                    binding += 2;
                }
            }
        }
        // Custom materials have no specular amount to weight the probe with.
        if p.reflection_probe.get(key) && p.material_kind.get(key) != 2 {
            layout.reflection = Some(binding);
            binding += 2;
        }
        if p.has_ibl.get(key) && p.has_lighting.get(key) && p.material_kind.get(key) != 2 {
            layout.light_probe = Some(binding);
            binding += 2;
        }
        if p.ssao.get(key) && p.has_lighting.get(key) {
            layout.ao = Some(binding);
        }
        layout
    }
}

// ============================================================================
// Template contexts
// ============================================================================

#[derive(Serialize)]
struct LightContext {
    directional: bool,
    spot: bool,
    receives_shadow: bool,
}

#[derive(Serialize)]
struct MapContext {
    name: &'static str,
    slot: usize,
    binding: u32,
    invert_uv: bool,
    premultiplied: bool,
    identity_transform: bool,
}

#[derive(Serialize)]
struct ShadowContext {
    light: usize,
    binding: u32,
    cube: bool,
    vsm: bool,
}

#[derive(Serialize)]
struct UniformContext<'a> {
    name: &'a str,
    ty: &'static str,
}

#[derive(Serialize)]
struct MaterialContext<'a> {
    source_name: &'a str,
    has_lighting: bool,
    light_count: u32,
    lights_meta: Vec<LightContext>,
    specular_enabled: bool,
    fresnel_enabled: bool,
    material_kind: u32,
    alpha_mode: u32,
    double_sided: bool,
    overrides_position: bool,
    vertex_colors: bool,
    map_transforms: bool,
    maps: Vec<MapContext>,
    shadows: Vec<ShadowContext>,
    reflection_binding: Option<u32>,
    light_probe_binding: Option<u32>,
    ao_binding: Option<u32>,
    has_normal: bool,
    has_uv0: bool,
    has_uv1: bool,
    has_tangent: bool,
    has_color: bool,
    has_joints: bool,
    has_weights: bool,
    instanced: bool,
    morph_targets: u32,
    morph_normals: u32,
    tonemap_mode: u32,
    fog: bool,
    custom_shader: Option<&'a str>,
    custom_uniforms: Vec<UniformContext<'a>>,
}

#[derive(Serialize)]
struct DepthContext<'a> {
    source_name: &'a str,
    output: &'static str,
    overrides_position: bool,
    morph_targets: u32,
    custom_shader: Option<&'a str>,
    custom_uniforms: Vec<UniformContext<'a>>,
}

#[derive(Serialize)]
struct TextureContext<'a> {
    name: &'a str,
    binding: u32,
}

#[derive(Serialize)]
struct FullscreenContext<'a> {
    source_name: &'a str,
    uniforms: Vec<UniformContext<'a>>,
    textures: Vec<TextureContext<'a>>,
    effect_shader: Option<&'a str>,
}

/// What a depth-only variant writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthOutput {
    /// Depth attachment only (PCF shadows, depth pre-pass).
    DepthOnly,
    /// Depth and squared depth, for variance shadow maps.
    Moments,
    /// Normalized light distance, for cube shadow maps.
    Distance,
}

/// Texture binding order used by fullscreen passes: texture `i` at binding
/// `1 + 2i`, its sampler right after.
#[must_use]
pub fn fullscreen_texture_binding(index: usize) -> u32 {
    1 + 2 * index as u32
}

// ============================================================================
// Generator
// ============================================================================

pub struct ShaderGenerator {
    env: Environment<'static>,
}

impl Default for ShaderGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderGenerator {
    #[must_use]
    pub fn new() -> Self {
        let mut env = Environment::new();
        match SyntaxConfig::builder()
            .block_delimiters("{$", "$}")
            .variable_delimiters("{{", "}}")
            .build()
        {
            Ok(syntax) => env.set_syntax(syntax),
            Err(err) => log::error!("Shader template syntax rejected: {err}"),
        }
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_undefined_behavior(minijinja::UndefinedBehavior::SemiStrict);
        env.set_loader(template_loader);
        Self { env }
    }

    /// Registers runtime shader code under `name`.
    pub fn add_template_owned(&mut self, name: impl Into<String>, source: impl Into<String>) -> Result<()> {
        self.env.add_template_owned(name.into(), source.into())?;
        Ok(())
    }

    #[must_use]
    pub fn has_template(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    /// Material variant for `key`. `custom_shader` names a registered
    /// template defining `custom_surface` (and `custom_position` when the
    /// key overrides position).
    pub fn generate_material(
        &self,
        source_name: &str,
        key: &ShaderKey,
        features: ShaderFeatures,
        custom_shader: Option<&str>,
        custom_uniforms: &[(String, UniformValue)],
    ) -> Result<String> {
        let p = ShaderKeyProperties::get();
        if let Some(name) = custom_shader {
            self.require(name)?;
        }

        let layout = MaterialBindingLayout::from_key(key);
        let light_count = p.light_count.get(key);
        let receives = p.receives_shadows.get(key);
        let lights_meta = p
            .lights
            .iter()
            .take(light_count as usize)
            .map(|property| {
                let flags = property.get(key);
                LightContext {
                    directional: flags.contains(LightKeyFlags::DIRECTIONAL),
                    spot: flags.contains(LightKeyFlags::SPOT),
                    receives_shadow: receives && flags.contains(LightKeyFlags::SHADOW),
                }
            })
            .collect();

        let maps = layout
            .maps
            .iter()
            .map(|&(slot, binding)| {
                let flags = p.image_maps[slot].get(key);
                MapContext {
                    name: MapSlot::ALL[slot].name(),
                    slot,
                    binding,
                    invert_uv: flags.contains(ImageMapFlags::INVERT_UV),
                    premultiplied: flags.contains(ImageMapFlags::PREMULTIPLIED),
                    identity_transform: flags.contains(ImageMapFlags::IDENTITY_TRANSFORM),
                }
            })
            .collect();

        let shadows = layout
            .shadows
            .iter()
            .map(|&(light, binding)| {
                let flags = p.lights[light].get(key);
                let cube = !flags.intersects(LightKeyFlags::DIRECTIONAL | LightKeyFlags::SPOT);
                ShadowContext {
                    light,
                    binding,
                    cube,
                    vsm: !cube && features.contains(ShaderFeatures::SHADOW_VSM),
                }
            })
            .collect();

        let attributes = VertexAttributes::from_bits_truncate(p.vertex_attributes.get(key));
        let ctx = MaterialContext {
            source_name,
            has_lighting: p.has_lighting.get(key),
            light_count,
            lights_meta,
            specular_enabled: p.specular_enabled.get(key),
            fresnel_enabled: p.fresnel_enabled.get(key),
            material_kind: p.material_kind.get(key),
            alpha_mode: p.alpha_mode.get(key),
            double_sided: p.double_sided.get(key),
            overrides_position: p.overrides_position.get(key) && custom_shader.is_some(),
            vertex_colors: p.vertex_colors.get(key),
            map_transforms: layout.map_transforms,
            maps,
            shadows,
            reflection_binding: layout.reflection,
            light_probe_binding: layout.light_probe,
            ao_binding: layout.ao,
            has_normal: attributes.contains(VertexAttributes::NORMAL),
            has_uv0: attributes.contains(VertexAttributes::UV0),
            has_uv1: attributes.contains(VertexAttributes::UV1),
            has_tangent: attributes.contains(VertexAttributes::TANGENT),
            has_color: attributes.contains(VertexAttributes::COLOR),
            has_joints: attributes.contains(VertexAttributes::JOINTS),
            has_weights: attributes.contains(VertexAttributes::WEIGHTS),
            instanced: p.instanced.get(key),
            morph_targets: p.morph_targets.get(key),
            morph_normals: p.morph_normals.get(key),
            tonemap_mode: p.tonemap_mode.get(key),
            fog: p.fog.get(key),
            custom_shader,
            custom_uniforms: uniform_context(custom_uniforms),
        };
        self.render("material", &ctx)
    }

    /// Depth-only variant used by shadow passes and the depth pre-pass.
    /// Custom code is included only when the key overrides position; its
    /// uniforms are then bound at group 1 as in the material variant.
    pub fn generate_depth(
        &self,
        source_name: &str,
        key: &ShaderKey,
        output: DepthOutput,
        custom_shader: Option<&str>,
        custom_uniforms: &[(String, UniformValue)],
    ) -> Result<String> {
        if let Some(name) = custom_shader {
            self.require(name)?;
        }
        let ctx = DepthContext {
            source_name,
            output: match output {
                DepthOutput::DepthOnly => "depth",
                DepthOutput::Moments => "moments",
                DepthOutput::Distance => "distance",
            },
            overrides_position: ShaderKeyProperties::get().overrides_position.get(key),
            morph_targets: ShaderKeyProperties::get().morph_targets.get(key),
            custom_shader,
            custom_uniforms: uniform_context(custom_uniforms),
        };
        self.render("depth", &ctx)
    }

    /// Fullscreen pass. `effect_shader` names a registered template that
    /// defines `fn effect_main(uv: vec2<f32>) -> vec4<f32>`; without one the
    /// pass copies `input_texture`.
    pub fn generate_fullscreen(
        &self,
        source_name: &str,
        effect_shader: Option<&str>,
        uniforms: &[(String, UniformValue)],
        textures: &[&str],
    ) -> Result<String> {
        if let Some(name) = effect_shader {
            self.require(name)?;
        }
        let ctx = FullscreenContext {
            source_name,
            uniforms: uniform_context(uniforms),
            textures: textures
                .iter()
                .enumerate()
                .map(|(i, name)| TextureContext {
                    name,
                    binding: fullscreen_texture_binding(i),
                })
                .collect(),
            effect_shader,
        };
        self.render("fullscreen", &ctx)
    }

    fn require(&self, name: &str) -> Result<()> {
        if self.has_template(name) {
            Ok(())
        } else {
            Err(LumenError::ShaderNotFound(name.to_owned()))
        }
    }

    fn render<S: Serialize>(&self, template: &str, ctx: &S) -> Result<String> {
        let source = self.env.get_template(template)?.render(ctx)?;
        Ok(format!("// === Generated by lumen ===\n{source}"))
    }
}

fn uniform_context(values: &[(String, UniformValue)]) -> Vec<UniformContext<'_>> {
    values
        .iter()
        .map(|(name, value)| UniformContext {
            name,
            ty: value.wgsl_type(),
        })
        .collect()
}
