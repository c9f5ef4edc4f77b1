//! Renderer / Frame Orchestrator
//!
//! [`Renderer`] drives a frame through its phases:
//!
//! ```text
//! begin_frame ─► prepare_layer_for_render ─► rhi_prepare ─► rhi_render ─► end_frame
//!                (CPU lists, keys)           (GPU uploads,   (draws inside
//!                                             offscreen passes) the caller's pass)
//! ```
//!
//! `begin_frame`/`end_frame` nest. Per-frame cleanup (arena reset, effect
//! pool release, unreferenced resource eviction) runs only when the
//! outermost `end_frame` returns the depth to zero.
//!
//! All GPU state lives in an explicit [`RenderContext`]; there are no
//! process-wide singletons.

pub mod bind_groups;
mod draw;
pub mod layer_data;
pub mod pass;
pub mod picking;
mod prepare;
pub mod reflections;
pub mod shadows;
mod ssao;
pub mod uniform_buffer;
pub mod uniforms;

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::arena::FrameArena;
use crate::effects::{EffectSystem, EffectTexturePool};
use crate::errors::{LumenError, Result};
use crate::extensions::{FrameData, PipelineStateSnapshot, RenderExtension};
use crate::hal::{RenderBackend, RenderPassDesc, TextureId};
use crate::resources::{AssetProvider, BufferManager};
use crate::scene::{Effect, ImageId, MaterialId, NodeId, SceneGraph};
use crate::settings::RendererSettings;
use crate::shader::ShaderCache;

use self::bind_groups::BindGroupCache;
use self::draw::{DrawItem, FullscreenDraw};
use self::uniform_buffer::UniformBuffer;

pub use self::layer_data::{
    LayerLight, LayerPrepResult, LayerProbe, LayerRenderData, PrepareState, RenderKey,
    RenderableObject, ShadowCasters,
};
pub use self::pass::TrackedPass;
pub use self::picking::PickResult;
pub use self::reflections::{ReflectionMapEntry, ReflectionMapManager};
pub use self::shadows::{ShadowMapEntry, ShadowMapManager, ShadowMode};

// ============================================================================
// Render context
// ============================================================================

/// Per-window rendering session.
pub struct RenderContext {
    backend: Box<dyn RenderBackend>,
    buffers: BufferManager,
    shaders: ShaderCache,
    effect_pool: EffectTexturePool,
    arena: FrameArena,
    settings: RendererSettings,
}

impl RenderContext {
    #[must_use]
    pub fn new(
        backend: Box<dyn RenderBackend>,
        provider: Arc<dyn AssetProvider>,
        settings: RendererSettings,
    ) -> Self {
        Self::with_buffer_manager(backend, BufferManager::new(provider), settings)
    }

    /// Uses a preconfigured manager, e.g. one with async loading enabled.
    #[must_use]
    pub fn with_buffer_manager(
        backend: Box<dyn RenderBackend>,
        buffers: BufferManager,
        mut settings: RendererSettings,
    ) -> Self {
        settings.sanitize();
        log::info!("Render context created on the {} backend", backend.name());
        Self {
            backend,
            buffers,
            shaders: ShaderCache::new(),
            effect_pool: EffectTexturePool::new(settings.effect_texture_idle_frames),
            arena: FrameArena::new(settings.arena_slab_size, settings.arena_large_threshold),
            settings,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &dyn RenderBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn RenderBackend {
        self.backend.as_mut()
    }

    /// The backend as its concrete type.
    #[must_use]
    pub fn backend_as<T: RenderBackend + 'static>(&self) -> Option<&T> {
        self.backend.as_any().downcast_ref::<T>()
    }

    #[must_use]
    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    #[must_use]
    pub fn shaders(&self) -> &ShaderCache {
        &self.shaders
    }

    #[must_use]
    pub fn effect_pool(&self) -> &EffectTexturePool {
        &self.effect_pool
    }

    #[must_use]
    pub fn arena(&self) -> &FrameArena {
        &self.arena
    }

    #[must_use]
    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Counters for the current (or most recently finished) frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame_index: u64,
    pub layers_prepared: u32,
    pub renderables: u32,
    pub draw_calls: u32,
    /// Binds dropped by [`TrackedPass`] because the state was already set.
    pub state_changes_skipped: u32,
    pub shadow_passes: u32,
    pub reflection_passes: u32,
    pub effect_passes: u32,
    pub bind_groups_created: u32,
    /// Outermost `end_frame` calls so far.
    pub frame_cleanups: u64,
}

// ============================================================================
// Renderer
// ============================================================================

/// GPU state one layer keeps between `rhi_prepare` and `rhi_render`.
struct LayerGpu {
    uniforms: UniformBuffer,
    /// Main depth target, sized to the layer surface.
    depth: Option<(TextureId, (u32, u32), wgpu::TextureFormat)>,
    draws: Vec<DrawItem>,
    /// Leading opaque entries of `draws`.
    opaque_draws: usize,
    /// Replaces `draws` in `rhi_render` when the layer has effects.
    blit: Option<FullscreenDraw>,
    prepared_frame: Option<u64>,
}

impl LayerGpu {
    fn new() -> Self {
        Self {
            uniforms: UniformBuffer::new("lumen.layer.uniforms"),
            depth: None,
            draws: Vec::new(),
            opaque_draws: 0,
            blit: None,
            prepared_frame: None,
        }
    }

    fn depth_texture(&self) -> Option<TextureId> {
        self.depth.map(|(id, _, _)| id)
    }

    fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.uniforms.release(backend);
        if let Some((id, _, _)) = self.depth.take() {
            backend.destroy_texture(id);
        }
        self.draws.clear();
        self.blit = None;
        self.prepared_frame = None;
    }
}

struct LayerEntry {
    data: LayerRenderData,
    gpu: LayerGpu,
    frame_data: FrameData,
    extensions: Vec<Box<dyn RenderExtension>>,
}

impl LayerEntry {
    fn new(layer: NodeId) -> Self {
        Self {
            data: LayerRenderData::new(layer),
            gpu: LayerGpu::new(),
            frame_data: FrameData::new(layer),
            extensions: Vec::new(),
        }
    }

    fn release(&mut self, backend: &mut dyn RenderBackend) {
        for extension in &mut self.extensions {
            extension.release(backend);
        }
        self.data.release(backend);
        self.gpu.release(backend);
    }
}

pub struct Renderer {
    ctx: RenderContext,
    layers: FxHashMap<NodeId, LayerEntry>,
    effects: EffectSystem,
    bind_groups: BindGroupCache,
    ssao: Effect,

    frame_depth: u32,
    frame_index: u64,
    /// Materials cleared during the last frame; fully clean at next begin.
    materials_to_clear: FxHashSet<MaterialId>,
    images_to_clear: FxHashSet<ImageId>,
    /// Pool references held until the frame is submitted.
    frame_textures: Vec<TextureId>,

    stats: FrameStats,
    frame_cleanups: u64,
}

impl Renderer {
    #[must_use]
    pub fn new(ctx: RenderContext) -> Self {
        Self {
            ctx,
            layers: FxHashMap::default(),
            effects: EffectSystem::new(),
            bind_groups: BindGroupCache::new(),
            ssao: ssao::ssao_effect(),
            frame_depth: 0,
            frame_index: 0,
            materials_to_clear: FxHashSet::default(),
            images_to_clear: FxHashSet::default(),
            frame_textures: Vec::new(),
            stats: FrameStats::default(),
            frame_cleanups: 0,
        }
    }

    #[must_use]
    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.ctx
    }

    #[must_use]
    pub fn settings(&self) -> &RendererSettings {
        &self.ctx.settings
    }

    #[must_use]
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    #[must_use]
    pub fn frame_cleanups(&self) -> u64 {
        self.frame_cleanups
    }

    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    #[must_use]
    pub fn frame_depth(&self) -> u32 {
        self.frame_depth
    }

    #[must_use]
    pub fn layer_data(&self, layer: NodeId) -> Option<&LayerRenderData> {
        self.layers.get(&layer).map(|e| &e.data)
    }

    #[must_use]
    pub fn frame_data(&self, layer: NodeId) -> Option<&FrameData> {
        self.layers.get(&layer).map(|e| &e.frame_data)
    }

    /// The layer's main depth target, once `rhi_prepare` has run.
    #[must_use]
    pub fn layer_depth_texture(&self, layer: NodeId) -> Option<TextureId> {
        self.layers.get(&layer).and_then(|e| e.gpu.depth_texture())
    }

    /// Nearest enclosing layer of `node`.
    #[must_use]
    pub fn layer_for_node(&self, scene: &SceneGraph, node: NodeId) -> Option<NodeId> {
        scene.layer_for_node(node)
    }

    /// Registers an extension on `layer`. Extensions run in registration
    /// order within their stage.
    pub fn add_extension(&mut self, layer: NodeId, extension: Box<dyn RenderExtension>) {
        self.layers
            .entry(layer)
            .or_insert_with(|| LayerEntry::new(layer))
            .extensions
            .push(extension);
    }

    #[must_use]
    pub fn extension_count(&self, layer: NodeId) -> usize {
        self.layers.get(&layer).map_or(0, |e| e.extensions.len())
    }

    /// Registers runtime shader code for custom materials.
    pub fn register_shader(&mut self, name: &str, source: impl Into<String>) -> Result<()> {
        let backend = self.ctx.backend.as_mut();
        self.ctx.shaders.register_source(backend, name, source)?;
        self.bind_groups.clear(backend);
        Ok(())
    }

    /// Applies new settings. Settings that change generated shader code
    /// drop every cached pipeline.
    pub fn set_settings(&mut self, mut settings: RendererSettings) {
        settings.sanitize();
        let backend = self.ctx.backend.as_mut();
        if self.ctx.settings.invalidates_pipelines(&settings) {
            log::info!("Settings change invalidates cached pipelines");
            self.bind_groups.clear(backend);
            self.ctx.shaders.invalidate_all(backend);
        }
        self.ctx
            .effect_pool
            .set_max_idle_frames(settings.effect_texture_idle_frames);
        let arena_changed = settings.arena_slab_size != self.ctx.settings.arena_slab_size
            || settings.arena_large_threshold != self.ctx.settings.arena_large_threshold;
        if arena_changed && self.frame_depth == 0 {
            self.ctx.arena =
                FrameArena::new(settings.arena_slab_size, settings.arena_large_threshold);
        }
        self.ctx.settings = settings;
    }

    // ========================================================================
    // Frame lifecycle
    // ========================================================================

    /// Opens a frame for `layer`. Calls nest; only the outermost one resets
    /// the previous frame's per-layer state.
    pub fn begin_frame(&mut self, scene: &mut SceneGraph, layer: NodeId) -> Result<()> {
        let Some(node) = scene.node(layer) else {
            return Err(LumenError::InvalidHandle { kind: "node" });
        };
        if node.as_layer().is_none() {
            return Err(LumenError::NotALayer);
        }

        self.frame_depth += 1;
        if self.frame_depth == 1 {
            self.start_frame(scene);
        }
        Ok(())
    }

    fn start_frame(&mut self, scene: &mut SceneGraph) {
        self.frame_index += 1;
        self.stats = FrameStats {
            frame_index: self.frame_index,
            frame_cleanups: self.frame_cleanups,
            ..FrameStats::default()
        };

        for entry in self.layers.values_mut() {
            entry.data.reset_for_frame();
            for extension in &mut entry.extensions {
                extension.reset_for_frame();
            }
        }

        let materials = scene.materials_raw_mut();
        for id in self.materials_to_clear.drain() {
            if let Some(material) = materials.get_mut(id) {
                material.update_dirty_for_frame();
            }
        }
        let images = scene.images_raw_mut();
        for id in self.images_to_clear.drain() {
            if let Some(image) = images.get_mut(id) {
                image.clear_dirty();
            }
        }

        let backend = self.ctx.backend.as_mut();
        let loaded = self.ctx.buffers.pump_async_loads(backend);
        if loaded > 0 {
            log::debug!("{loaded} async loads finished");
        }
        self.bind_groups.begin_frame(self.frame_index);
        log::trace!("Frame {} begun", self.frame_index);
    }

    /// Closes a frame opened by [`begin_frame`](Self::begin_frame).
    pub fn end_frame(&mut self, _layer: NodeId) -> Result<()> {
        if self.frame_depth == 0 {
            return Err(LumenError::FrameNotBegun);
        }
        self.frame_depth -= 1;
        if self.frame_depth > 0 {
            return Ok(());
        }
        self.finish_frame()
    }

    fn finish_frame(&mut self) -> Result<()> {
        let backend = self.ctx.backend.as_mut();
        let submitted = backend.submit();

        for texture in self.frame_textures.drain(..) {
            self.ctx.effect_pool.release(texture);
        }
        self.stats.effect_passes = self.effects.passes_rendered();
        self.effects.end_frame(backend);
        self.ctx.effect_pool.end_frame(backend);
        self.bind_groups.end_frame(backend);
        self.ctx.arena.reset();
        let evicted = self.ctx.buffers.cleanup_unreferenced(backend);

        self.frame_cleanups += 1;
        self.stats.frame_cleanups = self.frame_cleanups;
        log::trace!(
            "Frame {} finished: {} draws, {evicted} resources evicted",
            self.frame_index,
            self.stats.draw_calls
        );
        submitted
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    /// Prepares `layer` and its sibling layers. Returns whether any of them
    /// needed work this frame.
    pub fn prepare_layer_for_render(
        &mut self,
        scene: &mut SceneGraph,
        layer: NodeId,
        surface_size: (u32, u32),
    ) -> Result<bool> {
        if self.frame_depth == 0 {
            return Err(LumenError::FrameNotBegun);
        }
        let Some(node) = scene.node(layer) else {
            return Err(LumenError::InvalidHandle { kind: "node" });
        };
        if node.as_layer().is_none() {
            return Err(LumenError::NotALayer);
        }

        let siblings = match node.parent() {
            Some(parent) => scene.children(parent),
            None => scene.roots(),
        };
        let mut targets: SmallVec<[NodeId; 8]> = SmallVec::new();
        targets.push(layer);
        targets.extend(siblings.iter().copied().filter(|&id| {
            id != layer && scene.node(id).is_some_and(|n| n.as_layer().is_some())
        }));

        let mut dirty = false;
        for id in targets {
            dirty |= self.prepare_one(scene, id, surface_size)?;
        }
        Ok(dirty)
    }

    fn prepare_one(
        &mut self,
        scene: &mut SceneGraph,
        layer: NodeId,
        surface_size: (u32, u32),
    ) -> Result<bool> {
        let entry = self
            .layers
            .entry(layer)
            .or_insert_with(|| LayerEntry::new(layer));
        if entry.data.state() == PrepareState::Prepared {
            return Ok(false);
        }

        let ctx = &mut self.ctx;
        let result = entry.data.prepare_for_render(
            scene,
            ctx.backend.as_mut(),
            &mut ctx.buffers,
            &ctx.settings,
            surface_size,
        )?;
        self.materials_to_clear
            .extend(result.cleared_materials.iter().copied());
        self.images_to_clear
            .extend(result.changed_images.iter().copied());
        self.stats.layers_prepared += 1;
        self.stats.renderables += result.renderables as u32;

        let camera = entry.data.camera_node().zip(entry.data.camera().cloned());
        let snapshot = pipeline_snapshot(&ctx.settings, surface_size);
        entry
            .frame_data
            .begin_frame(self.frame_index, camera, snapshot);

        let mut dirty = result.was_dirty;
        for extension in &mut entry.extensions {
            dirty |= extension.prepare_data(&mut entry.frame_data);
        }
        Ok(dirty)
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    /// Issues the layer's draws into the pass the caller has open.
    pub fn rhi_render(&mut self, scene: &SceneGraph, layer: NodeId) -> Result<()> {
        let backend = self.ctx.backend.as_mut();
        if !backend.is_in_render_pass() {
            return crate::contract_violation!("rhi_render requires an active render pass");
        }
        if !layer_visible(scene, layer) {
            return Ok(());
        }
        let Some(entry) = self.layers.get_mut(&layer) else {
            log::debug!("rhi_render on layer {layer:?} that was never prepared");
            return Ok(());
        };
        if entry.gpu.prepared_frame != Some(self.frame_index) {
            log::debug!("rhi_render on layer {layer:?} without rhi_prepare this frame");
            return Ok(());
        }

        if let Some(blit) = &entry.gpu.blit {
            let mut pass = TrackedPass::new(backend);
            blit.record(&mut pass)?;
            self.stats.draw_calls += pass.draws();
            return Ok(());
        }
        draw::record_layer(
            backend,
            &entry.gpu.draws,
            &entry.frame_data,
            &mut entry.extensions,
            &mut self.stats,
        )
    }

    /// Begins a pass on `target`, renders the layer into it and ends the
    /// pass. `target` must use the configured color format.
    pub fn render_layer(&mut self, scene: &SceneGraph, layer: NodeId, target: TextureId) -> Result<()> {
        let clear = scene
            .node(layer)
            .and_then(|n| n.as_layer())
            .and_then(|l| l.clear_color)
            .map(draw::to_wgpu_color);
        let depth = self.layer_depth_texture(layer);
        let desc = RenderPassDesc::single("lumen.layer", target, clear, depth);

        self.ctx.backend.begin_render_pass(&desc)?;
        let result = self.rhi_render(scene, layer);
        let ended = self.ctx.backend.end_render_pass();
        result.and(ended)
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Releases what `removed` nodes held. Removed layers lose their
    /// render data and targets.
    pub fn cleanup_resources(&mut self, scene: &SceneGraph, removed: &[NodeId]) {
        let backend = self.ctx.backend.as_mut();
        self.ctx.buffers.cleanup_resources(backend, scene, removed);
        for id in removed {
            if let Some(mut entry) = self.layers.remove(id) {
                log::debug!("Releasing render data of removed layer {id:?}");
                entry.release(backend);
            }
        }
    }

    /// Context teardown: every GPU object the renderer created is destroyed.
    pub fn release_resources(&mut self) {
        let backend = self.ctx.backend.as_mut();
        for (_, mut entry) in self.layers.drain() {
            entry.release(backend);
        }
        for texture in self.frame_textures.drain(..) {
            self.ctx.effect_pool.release(texture);
        }
        self.bind_groups.clear(backend);
        self.effects.release(backend);
        self.ctx.effect_pool.release_all(backend);
        self.ctx.shaders.release(backend);
        self.ctx.buffers.release_all(backend);
        self.materials_to_clear.clear();
        self.images_to_clear.clear();
        log::info!("Render context resources released");
    }
}

fn layer_visible(scene: &SceneGraph, layer: NodeId) -> bool {
    scene
        .node(layer)
        .and_then(|n| n.as_layer())
        .is_some_and(|l| l.visible)
}

fn pipeline_snapshot(settings: &RendererSettings, size: (u32, u32)) -> PipelineStateSnapshot {
    let mut state = PipelineStateSnapshot::default();
    state.set_viewport([0.0, 0.0, size.0 as f32, size.1 as f32]);
    state.set_color_format(settings.color_format);
    state.set_depth_format(Some(settings.depth_format));
    state
}
