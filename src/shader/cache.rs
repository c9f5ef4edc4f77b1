//! Shader Variant Cache
//!
//! Maps `(source, features, key, pipeline state)` to a backend pipeline.
//! Pipelines live in a flat `Vec`; an `FxHashMap` resolves a [`VariantKey`]
//! to its slot. Shader modules are shared between variants whose generated
//! source hashes equal (`xxh3_128`).
//!
//! Entries survive across frames. They are dropped only by
//! [`ShaderCache::invalidate_all`] (a scene-wide dirty event such as an
//! output colour-space change), by re-registering a runtime source, or by
//! [`ShaderCache::release`] when the owning context is torn down.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::xxh3_128;

use super::generator::{DepthOutput, ShaderGenerator};
use super::key::{ShaderFeatures, ShaderKey, ShaderKeyProperties};
use crate::errors::Result;
use crate::hal::{PipelineId, RenderBackend, RenderPipelineDesc, ShaderModuleId, VertexLayoutDesc};
use crate::resources::VertexAttributes;
use crate::scene::{CustomMaterial, UniformValue};
use crate::utils::fx_hash_key;
use crate::utils::interner::{self, Symbol};

pub const PRINCIPLED_SOURCE: &str = "principled";
pub const SPECULAR_GLOSSY_SOURCE: &str = "default";
pub const BLIT_SOURCE: &str = "blit";

// ─── Keys ────────────────────────────────────────────────────────────────────

/// Hashable mirror of `wgpu::BlendComponent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponentKey {
    pub src_factor: wgpu::BlendFactor,
    pub dst_factor: wgpu::BlendFactor,
    pub operation: wgpu::BlendOperation,
}

impl From<wgpu::BlendComponent> for BlendComponentKey {
    fn from(b: wgpu::BlendComponent) -> Self {
        Self {
            src_factor: b.src_factor,
            dst_factor: b.dst_factor,
            operation: b.operation,
        }
    }
}

impl From<BlendComponentKey> for wgpu::BlendComponent {
    fn from(k: BlendComponentKey) -> Self {
        Self {
            src_factor: k.src_factor,
            dst_factor: k.dst_factor,
            operation: k.operation,
        }
    }
}

/// Hashable mirror of `wgpu::BlendState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendStateKey {
    pub color: BlendComponentKey,
    pub alpha: BlendComponentKey,
}

impl From<wgpu::BlendState> for BlendStateKey {
    fn from(b: wgpu::BlendState) -> Self {
        Self {
            color: b.color.into(),
            alpha: b.alpha.into(),
        }
    }
}

impl From<BlendStateKey> for wgpu::BlendState {
    fn from(k: BlendStateKey) -> Self {
        Self {
            color: k.color.into(),
            alpha: k.alpha.into(),
        }
    }
}

/// Fixed-function state that is part of pipeline identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineStateKey {
    /// `None` for depth-only passes.
    pub color_format: Option<wgpu::TextureFormat>,
    pub depth_format: Option<wgpu::TextureFormat>,
    pub depth_write: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub cull_mode: Option<wgpu::Face>,
    pub blend: Option<BlendStateKey>,
    pub topology: wgpu::PrimitiveTopology,
    pub sample_count: u32,
}

impl PipelineStateKey {
    /// Depth-tested, depth-writing, no blending.
    #[must_use]
    pub fn opaque(color: wgpu::TextureFormat, depth: wgpu::TextureFormat) -> Self {
        Self {
            color_format: Some(color),
            depth_format: Some(depth),
            depth_write: true,
            depth_compare: wgpu::CompareFunction::LessEqual,
            cull_mode: Some(wgpu::Face::Back),
            blend: None,
            topology: wgpu::PrimitiveTopology::TriangleList,
            sample_count: 1,
        }
    }

    /// Depth-tested, read-only depth, straight alpha blending.
    #[must_use]
    pub fn transparent(color: wgpu::TextureFormat, depth: wgpu::TextureFormat) -> Self {
        Self {
            depth_write: false,
            blend: Some(wgpu::BlendState::ALPHA_BLENDING.into()),
            ..Self::opaque(color, depth)
        }
    }

    /// Depth-only target, or a float colour target when `color` is given
    /// (variance and distance shadow maps).
    #[must_use]
    pub fn depth_only(color: Option<wgpu::TextureFormat>, depth: wgpu::TextureFormat) -> Self {
        Self {
            color_format: color,
            depth_format: Some(depth),
            depth_write: true,
            depth_compare: wgpu::CompareFunction::LessEqual,
            cull_mode: Some(wgpu::Face::Back),
            blend: None,
            topology: wgpu::PrimitiveTopology::TriangleList,
            sample_count: 1,
        }
    }

    /// Fullscreen triangle, no depth.
    #[must_use]
    pub fn fullscreen(color: wgpu::TextureFormat) -> Self {
        Self {
            color_format: Some(color),
            depth_format: None,
            depth_write: false,
            depth_compare: wgpu::CompareFunction::Always,
            cull_mode: None,
            blend: None,
            topology: wgpu::PrimitiveTopology::TriangleList,
            sample_count: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum VariantKind {
    Material,
    Depth(DepthOutput),
    Fullscreen,
}

/// Full identity of one cached pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantKey {
    source: Symbol,
    kind: VariantKind,
    features: ShaderFeatures,
    key: ShaderKey,
    /// Hash of the runtime uniform/texture layout; 0 for built-in sources.
    layout: u64,
    state: PipelineStateKey,
}

// ─── Cache ───────────────────────────────────────────────────────────────────

struct CachedModule {
    id: ShaderModuleId,
    source: Arc<str>,
    users: u32,
}

struct CachedPipeline {
    id: PipelineId,
    variant: VariantKey,
    module_hash: u128,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderCacheStats {
    pub pipeline_count: usize,
    pub module_count: usize,
    /// Pipelines created over the cache's lifetime.
    pub pipelines_created: u64,
}

pub struct ShaderCache {
    generator: ShaderGenerator,
    pipelines: Vec<CachedPipeline>,
    lookup: FxHashMap<VariantKey, usize>,
    by_id: FxHashMap<PipelineId, usize>,
    modules: FxHashMap<u128, CachedModule>,
    pipelines_created: u64,
}

impl Default for ShaderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            generator: ShaderGenerator::new(),
            pipelines: Vec::new(),
            lookup: FxHashMap::default(),
            by_id: FxHashMap::default(),
            modules: FxHashMap::default(),
            pipelines_created: 0,
        }
    }

    #[must_use]
    pub fn generator(&self) -> &ShaderGenerator {
        &self.generator
    }

    /// Registers (or replaces) runtime shader code. Replacing a source
    /// drops every variant built from it.
    pub fn register_source(
        &mut self,
        backend: &mut dyn RenderBackend,
        name: &str,
        source: impl Into<String>,
    ) -> Result<()> {
        let replaced = self.generator.has_template(name);
        self.generator.add_template_owned(name, source)?;
        if replaced {
            let symbol = interner::intern(name);
            self.retain(backend, |variant| variant.source != symbol);
        }
        Ok(())
    }

    /// Pipeline for a material variant.
    ///
    /// `custom` is the material's custom description, if any; its shader
    /// name selects the registered source and its properties shape the
    /// uniform block.
    pub fn get_or_create_pipeline(
        &mut self,
        backend: &mut dyn RenderBackend,
        key: &ShaderKey,
        features: ShaderFeatures,
        custom: Option<&CustomMaterial>,
        state: PipelineStateKey,
    ) -> Result<PipelineId> {
        let source_name = material_source_name(key, custom);
        let variant = VariantKey {
            source: interner::intern(source_name),
            kind: VariantKind::Material,
            features,
            key: *key,
            layout: custom.map_or(0, |c| uniform_layout_hash(&c.properties, &[])),
            state,
        };
        if let Some(id) = self.lookup_variant(&variant) {
            return Ok(id);
        }

        let wgsl = self.generator.generate_material(
            source_name,
            key,
            features,
            custom.map(|c| c.shader.as_str()),
            custom.map_or(&[], |c| c.properties.as_slice()),
        )?;
        let layout = vertex_layout(key);
        self.create_variant(backend, variant, source_name, wgsl, Some(&layout), Some("fs_main"))
    }

    /// Depth-only variant for shadow maps and the depth pre-pass.
    pub fn get_or_create_depth(
        &mut self,
        backend: &mut dyn RenderBackend,
        key: &ShaderKey,
        output: DepthOutput,
        custom: Option<&CustomMaterial>,
        state: PipelineStateKey,
    ) -> Result<PipelineId> {
        // Only the attribute set and position override matter here.
        let p = ShaderKeyProperties::get();
        let mut depth_key = ShaderKey::default();
        p.vertex_attributes.set(&mut depth_key, p.vertex_attributes.get(key));
        let overrides = custom.is_some_and(|c| c.overrides_position);
        p.overrides_position.set(&mut depth_key, overrides);
        p.morph_targets.set(&mut depth_key, p.morph_targets.get(key));
        p.morph_normals.set(&mut depth_key, p.morph_normals.get(key));

        let custom_shader = custom.filter(|c| c.overrides_position).map(|c| c.shader.as_str());
        let source_name = custom_shader.unwrap_or("depth");
        let variant = VariantKey {
            source: interner::intern(source_name),
            kind: VariantKind::Depth(output),
            features: ShaderFeatures::empty(),
            key: depth_key,
            layout: custom
                .filter(|c| c.overrides_position)
                .map_or(0, |c| uniform_layout_hash(&c.properties, &[])),
            state,
        };
        if let Some(id) = self.lookup_variant(&variant) {
            return Ok(id);
        }

        let custom_uniforms = match custom {
            Some(c) if c.overrides_position => c.properties.as_slice(),
            _ => &[],
        };
        let wgsl = self.generator.generate_depth(
            source_name,
            &depth_key,
            output,
            custom_shader,
            custom_uniforms,
        )?;
        let layout = vertex_layout(key);
        let fragment = (output != DepthOutput::DepthOnly).then_some("fs_main");
        self.create_variant(backend, variant, source_name, wgsl, Some(&layout), fragment)
    }

    /// Fullscreen pass pipeline. `effect_shader` is a registered source
    /// defining `effect_main`; `None` gives the plain blit.
    pub fn get_or_create_fullscreen(
        &mut self,
        backend: &mut dyn RenderBackend,
        effect_shader: Option<&str>,
        uniforms: &[(String, UniformValue)],
        textures: &[&str],
        state: PipelineStateKey,
    ) -> Result<PipelineId> {
        let source_name = effect_shader.unwrap_or(BLIT_SOURCE);
        let variant = VariantKey {
            source: interner::intern(source_name),
            kind: VariantKind::Fullscreen,
            features: ShaderFeatures::empty(),
            key: ShaderKey::default(),
            layout: uniform_layout_hash(uniforms, textures),
            state,
        };
        if let Some(id) = self.lookup_variant(&variant) {
            return Ok(id);
        }

        let wgsl = self
            .generator
            .generate_fullscreen(source_name, effect_shader, uniforms, textures)?;
        self.create_variant(backend, variant, source_name, wgsl, None, Some("fs_main"))
    }

    /// Source the backend compiled for `pipeline`.
    #[must_use]
    pub fn generated_source(&self, pipeline: PipelineId) -> Option<&str> {
        let index = *self.by_id.get(&pipeline)?;
        let hash = self.pipelines[index].module_hash;
        self.modules.get(&hash).map(|m| m.source.as_ref())
    }

    /// Scene-wide dirty event: every variant is rebuilt on next use.
    pub fn invalidate_all(&mut self, backend: &mut dyn RenderBackend) {
        log::debug!("Invalidating {} cached pipelines", self.pipelines.len());
        self.retain(backend, |_| false);
    }

    /// Context teardown.
    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.retain(backend, |_| false);
        debug_assert!(self.modules.is_empty());
    }

    #[must_use]
    pub fn stats(&self) -> ShaderCacheStats {
        ShaderCacheStats {
            pipeline_count: self.pipelines.len(),
            module_count: self.modules.len(),
            pipelines_created: self.pipelines_created,
        }
    }

    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn pipelines_created(&self) -> u64 {
        self.pipelines_created
    }

    fn lookup_variant(&self, variant: &VariantKey) -> Option<PipelineId> {
        let &index = self.lookup.get(variant)?;
        log::trace!("Pipeline cache hit: {}", interner::resolve(variant.source));
        Some(self.pipelines[index].id)
    }

    fn create_variant(
        &mut self,
        backend: &mut dyn RenderBackend,
        variant: VariantKey,
        label: &str,
        wgsl: String,
        vertex_layout: Option<&VertexLayoutDesc>,
        fragment_entry: Option<&str>,
    ) -> Result<PipelineId> {
        let module_hash = xxh3_128(wgsl.as_bytes());
        let module = match self.modules.get_mut(&module_hash) {
            Some(cached) => {
                cached.users += 1;
                cached.id
            }
            None => {
                let id = backend.create_shader_module(label, &wgsl)?;
                self.modules.insert(
                    module_hash,
                    CachedModule {
                        id,
                        source: Arc::from(wgsl),
                        users: 1,
                    },
                );
                id
            }
        };

        let state = variant.state;
        let color_formats: &[wgpu::TextureFormat] = match &state.color_format {
            Some(format) => std::slice::from_ref(format),
            None => &[],
        };
        let desc = RenderPipelineDesc {
            label,
            module,
            vertex_entry: "vs_main",
            fragment_entry,
            vertex_layout,
            topology: state.topology,
            cull_mode: state.cull_mode,
            color_formats,
            blend: state.blend.map(Into::into),
            depth_format: state.depth_format,
            depth_write: state.depth_write,
            depth_compare: state.depth_compare,
            sample_count: state.sample_count,
        };
        let id = match backend.create_render_pipeline(&desc) {
            Ok(id) => id,
            Err(err) => {
                self.release_module(backend, module_hash);
                return Err(err);
            }
        };

        log::debug!("Created pipeline '{label}' ({} cached)", self.pipelines.len() + 1);
        let index = self.pipelines.len();
        self.pipelines.push(CachedPipeline {
            id,
            variant,
            module_hash,
        });
        self.lookup.insert(variant, index);
        self.by_id.insert(id, index);
        self.pipelines_created += 1;
        Ok(id)
    }

    fn release_module(&mut self, backend: &mut dyn RenderBackend, hash: u128) {
        let Some(module) = self.modules.get_mut(&hash) else {
            return;
        };
        module.users = module.users.saturating_sub(1);
        if module.users == 0 {
            backend.destroy_shader_module(module.id);
            self.modules.remove(&hash);
        }
    }

    /// Drops every variant for which `keep` returns false and re-indexes
    /// the survivors.
    fn retain(&mut self, backend: &mut dyn RenderBackend, keep: impl Fn(&VariantKey) -> bool) {
        let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pipelines)
            .into_iter()
            .partition(|p| keep(&p.variant));
        for pipeline in dropped {
            backend.destroy_render_pipeline(pipeline.id);
            self.release_module(backend, pipeline.module_hash);
        }
        self.pipelines = kept;
        self.lookup.clear();
        self.by_id.clear();
        for (index, pipeline) in self.pipelines.iter().enumerate() {
            self.lookup.insert(pipeline.variant, index);
            self.by_id.insert(pipeline.id, index);
        }
    }
}

fn material_source_name<'a>(key: &ShaderKey, custom: Option<&'a CustomMaterial>) -> &'a str {
    match custom {
        Some(custom) => custom.shader.as_str(),
        None if ShaderKeyProperties::get().material_kind.get(key) == 1 => SPECULAR_GLOSSY_SOURCE,
        None => PRINCIPLED_SOURCE,
    }
}

/// Interleaved layout of the meshes a key was resolved for.
fn vertex_layout(key: &ShaderKey) -> VertexLayoutDesc {
    let p = ShaderKeyProperties::get();
    let mut layout = VertexAttributes::from_bits_truncate(p.vertex_attributes.get(key)).layout();
    p.morph_layout(key).extend(&mut layout);
    layout
}

fn uniform_layout_hash(uniforms: &[(String, UniformValue)], textures: &[&str]) -> u64 {
    let uniform_types: Vec<(&str, &str)> = uniforms
        .iter()
        .map(|(name, value)| (name.as_str(), value.wgsl_type()))
        .collect();
    fx_hash_key(&(uniform_types, textures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HeadlessBackend;
    use crate::scene::Material;
    use crate::scene::material::MAP_SLOT_COUNT;
    use crate::shader::key::{LayerKeyState, ObjectKeyState, ShaderKeyResolver};

    fn key_for(material: &Material) -> ShaderKey {
        ShaderKeyResolver::resolve(
            material,
            &[None; MAP_SLOT_COUNT],
            &[],
            VertexAttributes::POSITION | VertexAttributes::NORMAL,
            &ObjectKeyState::default(),
            &LayerKeyState::default(),
        )
    }

    fn state() -> PipelineStateKey {
        PipelineStateKey::opaque(wgpu::TextureFormat::Rgba8UnormSrgb, wgpu::TextureFormat::Depth32Float)
    }

    #[test]
    fn test_same_key_same_pipeline() {
        let mut backend = HeadlessBackend::new();
        let mut cache = ShaderCache::new();
        let key = key_for(&Material::principled());

        let a = cache
            .get_or_create_pipeline(&mut backend, &key, ShaderFeatures::empty(), None, state())
            .unwrap();
        let b = cache
            .get_or_create_pipeline(&mut backend, &key, ShaderFeatures::empty(), None, state())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.pipelines_created(), 1);
        assert!(cache.generated_source(a).unwrap().contains("fn fs_main"));
    }

    #[test]
    fn test_state_shares_module() {
        let mut backend = HeadlessBackend::new();
        let mut cache = ShaderCache::new();
        let key = key_for(&Material::principled());
        let formats = (wgpu::TextureFormat::Rgba8UnormSrgb, wgpu::TextureFormat::Depth32Float);

        let opaque = cache
            .get_or_create_pipeline(&mut backend, &key, ShaderFeatures::empty(), None, state())
            .unwrap();
        let blended = cache
            .get_or_create_pipeline(
                &mut backend,
                &key,
                ShaderFeatures::empty(),
                None,
                PipelineStateKey::transparent(formats.0, formats.1),
            )
            .unwrap();
        assert_ne!(opaque, blended);
        assert_eq!(cache.pipeline_count(), 2);
        assert_eq!(cache.module_count(), 1);
    }

    #[test]
    fn test_invalidate_all_destroys() {
        let mut backend = HeadlessBackend::new();
        let mut cache = ShaderCache::new();
        let key = key_for(&Material::principled());
        cache
            .get_or_create_pipeline(&mut backend, &key, ShaderFeatures::empty(), None, state())
            .unwrap();
        cache
            .get_or_create_fullscreen(
                &mut backend,
                None,
                &[],
                &["input_texture"],
                PipelineStateKey::fullscreen(wgpu::TextureFormat::Rgba8Unorm),
            )
            .unwrap();
        assert_eq!(backend.live_pipelines(), 2);

        cache.invalidate_all(&mut backend);
        assert_eq!(backend.live_pipelines(), 0);
        assert_eq!(backend.live_shader_modules(), 0);
        assert_eq!(cache.stats().pipelines_created, 2);

        cache
            .get_or_create_pipeline(&mut backend, &key, ShaderFeatures::empty(), None, state())
            .unwrap();
        assert_eq!(cache.pipelines_created(), 3);
    }

    #[test]
    fn test_reregister_drops_variants() {
        let mut backend = HeadlessBackend::new();
        let mut cache = ShaderCache::new();
        let body = "fn effect_main(uv: vec2<f32>) -> vec4<f32> { return vec4<f32>(uv, 0.0, 1.0); }";
        cache.register_source(&mut backend, "effect/uv", body).unwrap();
        let fs = PipelineStateKey::fullscreen(wgpu::TextureFormat::Rgba8Unorm);
        cache
            .get_or_create_fullscreen(&mut backend, Some("effect/uv"), &[], &[], fs)
            .unwrap();
        assert_eq!(cache.pipeline_count(), 1);

        cache.register_source(&mut backend, "effect/uv", body.replace("0.0", "1.0")).unwrap();
        assert_eq!(cache.pipeline_count(), 0);
        assert_eq!(backend.live_pipelines(), 0);
    }

    #[test]
    fn test_depth_variant_ignores_shading_bits() {
        let mut backend = HeadlessBackend::new();
        let mut cache = ShaderCache::new();
        let lit = key_for(&Material::principled());
        let mut unlit_material = Material::principled();
        unlit_material.lighting = false;
        let unlit = key_for(&unlit_material);
        assert_ne!(lit, unlit);

        let depth_state = PipelineStateKey::depth_only(None, wgpu::TextureFormat::Depth32Float);
        let a = cache
            .get_or_create_depth(&mut backend, &lit, DepthOutput::DepthOnly, None, depth_state)
            .unwrap();
        let b = cache
            .get_or_create_depth(&mut backend, &unlit, DepthOutput::DepthOnly, None, depth_state)
            .unwrap();
        assert_eq!(a, b);
        assert!(!cache.generated_source(a).unwrap().contains("fn fs_main"));
    }

    #[test]
    fn test_morph_targets_reach_generated_source() {
        let mut backend = HeadlessBackend::new();
        let mut cache = ShaderCache::new();
        let key = ShaderKeyResolver::resolve(
            &Material::principled(),
            &[None; MAP_SLOT_COUNT],
            &[],
            VertexAttributes::POSITION | VertexAttributes::NORMAL,
            &ObjectKeyState {
                morph: crate::resources::MorphLayout::new(2, true),
                ..Default::default()
            },
            &LayerKeyState::default(),
        );
        let layout = vertex_layout(&key);
        assert_eq!(layout.attributes.len(), 6);
        assert_eq!(layout.stride, 24 + 4 * 12);

        let pipeline = cache
            .get_or_create_pipeline(&mut backend, &key, ShaderFeatures::empty(), None, state())
            .unwrap();
        let source = cache.generated_source(pipeline).unwrap();
        assert!(source.contains("@location(9) morph_position_1"));
        assert!(source.contains("@location(11) morph_normal_1"));
        assert!(source.contains("object.morph_weights[0][1]"));

        let depth_state = PipelineStateKey::depth_only(None, wgpu::TextureFormat::Depth32Float);
        let depth = cache
            .get_or_create_depth(&mut backend, &key, DepthOutput::DepthOnly, None, depth_state)
            .unwrap();
        let depth_source = cache.generated_source(depth).unwrap();
        assert!(depth_source.contains("morph_position_1"));
        assert!(!depth_source.contains("morph_normal"));
    }
}
