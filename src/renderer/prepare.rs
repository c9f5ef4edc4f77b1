//! GPU preparation of one layer: uniform upload, offscreen passes and
//! draw resolution.
//!
//! Runs outside any render pass. The order is fixed:
//!
//! 1. uniform blocks for every view and object are staged and uploaded
//! 2. shadow maps
//! 3. reflection probe faces that need a refresh
//! 4. the linear depth texture, when something consumes it
//! 5. screen-space AO over that depth
//! 6. the main draw list is resolved (pipelines, bind groups, buffers)
//! 7. the opaque-only screen texture, when requested
//! 8. extension `prepare_render`, then standalone extensions
//! 9. the effect chain, which leaves a blit behind for `rhi_render`

use bytemuck::Zeroable;
use glam::{Mat4, Vec3, Vec4};
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};
use std::ops::Range;

use crate::arena::FrameArena;
use crate::effects::{EffectContext, EffectTexturePool};
use crate::errors::{LumenError, Result};
use crate::extensions::{RenderMode, RenderResult};
use crate::hal::{
    BindGroupId, BindingResource, BufferId, ColorAttachment, DepthAttachment, PipelineId,
    RenderBackend, RenderPassDesc, TextureDesc, TextureId,
};
use crate::resources::BufferManager;
use crate::scene::{
    Camera, CustomMaterial, Effect, EffectCommand, Material, MaterialId, MaterialKind, MaterialUniforms,
    NodeId, SceneGraph, pack_uniforms, packed_uniform_size,
};
use crate::settings::RendererSettings;
use crate::shader::generator::fullscreen_texture_binding;
use crate::shader::{
    DepthOutput, MaterialBindingLayout, PipelineStateKey, ShaderCache, ShaderFeatures, ShaderKey,
    ShaderKeyProperties,
};
use crate::contract_violation;

use super::bind_groups::{BindEntries, BindGroupCache};
use super::draw::{self, DrawItem, FullscreenDraw};
use super::layer_data::{LayerRenderData, PrepareState, RenderableObject};
use super::reflections::{REFLECTION_COLOR_FORMAT, REFLECTION_DEPTH_FORMAT};
use super::shadows::{SHADOW_DEPTH_FORMAT, SHADOW_MOMENTS_FORMAT, ShadowMode};
use super::uniform_buffer::{UniformBuffer, UniformSlice};
use super::uniforms::{
    FrameUniforms, LightUniform, ObjectUniforms, effect_uniform_bytes, map_transform_bytes,
};
use super::{FrameStats, LayerEntry, LayerGpu, RenderContext, Renderer};

type SamplerKey = (wgpu::FilterMode, wgpu::AddressMode);

const DEFAULT_SAMPLER: SamplerKey = (wgpu::FilterMode::Linear, wgpu::AddressMode::Repeat);
const CLAMPED_SAMPLER: SamplerKey = (wgpu::FilterMode::Linear, wgpu::AddressMode::ClampToEdge);

fn sampler((filter, address): SamplerKey) -> BindingResource {
    BindingResource::Sampler { filter, address }
}

impl Renderer {
    /// Prepares GPU state for `layer`. Call once per frame after
    /// [`prepare_layer_for_render`](Self::prepare_layer_for_render) and
    /// before [`rhi_render`](Self::rhi_render), outside any render pass.
    /// Repeated calls within a frame do nothing.
    pub fn rhi_prepare(&mut self, scene: &SceneGraph, layer: NodeId) -> Result<()> {
        if self.frame_depth == 0 {
            return Err(LumenError::FrameNotBegun);
        }
        let frame_index = self.frame_index;
        let Self {
            ctx,
            layers,
            effects,
            bind_groups,
            ssao,
            frame_textures,
            stats,
            ..
        } = self;
        let RenderContext {
            backend,
            buffers,
            shaders,
            effect_pool,
            arena,
            settings,
        } = ctx;
        let backend: &mut dyn RenderBackend = backend.as_mut();

        if backend.is_in_render_pass() {
            return contract_violation!("rhi_prepare called inside a render pass");
        }
        let Some(entry) = layers.get_mut(&layer) else {
            return contract_violation!("rhi_prepare on layer {layer:?} before prepare_layer_for_render");
        };
        if entry.data.state() != PrepareState::Prepared {
            return contract_violation!("rhi_prepare on layer {layer:?} that is not prepared");
        }
        if entry.gpu.prepared_frame == Some(frame_index) {
            return Ok(());
        }
        let layer_node = scene
            .node(layer)
            .and_then(|n| n.as_layer())
            .ok_or(LumenError::NotALayer)?;

        entry.gpu.prepared_frame = Some(frame_index);
        entry.gpu.draws.clear();
        entry.gpu.opaque_draws = 0;
        entry.gpu.blit = None;
        if !layer_node.visible {
            log::trace!("Layer {layer:?} hidden; nothing to prepare");
            return Ok(());
        }

        let LayerEntry {
            data,
            gpu,
            frame_data,
            extensions,
        } = entry;
        let (w, h) = data.surface_size();
        let size = (w.max(1), h.max(1));
        let chain: SmallVec<[&Effect; 4]> = layer_node
            .effects()
            .iter()
            .filter_map(|&id| scene.effect(id))
            .collect();
        let fog = layer_node
            .fog
            .then_some((layer_node.fog_color, layer_node.fog_range.0, layer_node.fog_range.1));
        let clear = layer_node.clear_color.map(draw::to_wgpu_color);
        let offscreen_clear = Some(clear.unwrap_or(wgpu::Color::TRANSPARENT));

        ensure_depth_target(backend, gpu, size, settings.depth_format)?;

        buffers.release_user(layer);
        let light_probe = match layer_node.light_probe.and_then(|id| scene.image(id)) {
            Some(image) => buffers
                .load_texture(backend, scene, image.source(), settings.texture_mip_mode, layer)
                .and_then(|h| buffers.texture(h))
                .map(|t| (t.id, image.sampler_key())),
            None => None,
        };
        let placeholder = buffers
            .ensure_placeholder(backend)
            .and_then(|h| buffers.texture(h))
            .map(|t| t.id);

        let packed = stage_uniforms(arena, &mut gpu.uniforms, scene, data, fog, !chain.is_empty());
        gpu.uniforms.upload(backend)?;

        let LayerGpu {
            uniforms,
            draws,
            opaque_draws,
            blit,
            ..
        } = gpu;
        let mut r = Resolver {
            scene,
            data,
            backend,
            shaders,
            bind_groups,
            buffers,
            settings,
            uniforms,
            placeholder,
        };
        let mut env = EnvironmentInputs {
            light_probe,
            ao: None,
        };

        render_shadow_maps(&mut r, &packed, arena, stats)?;
        let refreshed = render_reflection_maps(&mut r, &packed, arena, &env, stats)?;

        let mut offscreen_depth = None;
        let needs_ao = data.features().contains(ShaderFeatures::SSAO)
            || frame_data.is_requested(RenderResult::AoTexture);
        let needs_depth = needs_ao
            || frame_data.is_requested(RenderResult::DepthTexture)
            || layer_node.depth_pre_pass
            || chain.iter().any(|e| {
                e.commands
                    .iter()
                    .any(|c| matches!(c, EffectCommand::ApplyDepthValue { .. }))
            });

        let mut depth_result = None;
        if needs_depth {
            let format = if r.backend.capabilities().float_render_targets {
                wgpu::TextureFormat::Rgba16Float
            } else {
                wgpu::TextureFormat::Rgba8Unorm
            };
            let texture = effect_pool.acquire(r.backend, "lumen.depth", size, format)?;
            frame_textures.push(texture);
            let attachment = offscreen_depth_target(
                &mut offscreen_depth,
                effect_pool,
                r.backend,
                size,
                settings.depth_format,
                frame_textures,
            )?;
            render_depth_texture(&mut r, &packed, arena, texture, format, attachment, stats)?;
            depth_result = Some(texture);
        }

        if needs_ao && let Some(depth_texture) = depth_result {
            let mut ectx = EffectContext {
                backend: &mut *r.backend,
                shaders: &mut *r.shaders,
                pool: &mut *effect_pool,
            };
            let ao = effects.process(&mut ectx, &[&*ssao], depth_texture, None, size)?;
            if ao != depth_texture {
                frame_textures.push(ao);
                env.ao = Some(ao);
            }
        }

        *opaque_draws = resolve_main_draws(&mut r, &packed, &env, draws)?;

        let mut screen = None;
        if frame_data.is_requested(RenderResult::ScreenTexture) {
            let texture =
                effect_pool.acquire(r.backend, "lumen.screen", size, settings.color_format)?;
            frame_textures.push(texture);
            let attachment = offscreen_depth_target(
                &mut offscreen_depth,
                effect_pool,
                r.backend,
                size,
                settings.depth_format,
                frame_textures,
            )?;
            let desc = RenderPassDesc::single("lumen.screen", texture, offscreen_clear, Some(attachment));
            draw::run_pass(&mut *r.backend, &desc, &draws[..*opaque_draws], stats)?;
            screen = Some(texture);
        }

        if let Some(texture) = depth_result {
            frame_data.set_render_result(RenderResult::DepthTexture, texture);
        }
        if let Some(texture) = env.ao {
            frame_data.set_render_result(RenderResult::AoTexture, texture);
        }
        if let Some(texture) = screen {
            frame_data.set_render_result(RenderResult::ScreenTexture, texture);
        }

        for extension in extensions.iter_mut() {
            extension.prepare_render(frame_data, &mut *r.backend)?;
        }
        for extension in extensions
            .iter_mut()
            .filter(|e| e.mode() == RenderMode::Standalone)
        {
            extension.render(frame_data, &mut *r.backend)?;
        }

        if !chain.is_empty() {
            let color =
                effect_pool.acquire(r.backend, "lumen.layer.color", size, settings.color_format)?;
            frame_textures.push(color);
            let attachment = offscreen_depth_target(
                &mut offscreen_depth,
                effect_pool,
                r.backend,
                size,
                settings.depth_format,
                frame_textures,
            )?;
            let desc =
                RenderPassDesc::single("lumen.layer.offscreen", color, offscreen_clear, Some(attachment));
            r.backend.begin_render_pass(&desc)?;
            let recorded = draw::record_layer(&mut *r.backend, draws, frame_data, extensions, stats);
            let ended = r.backend.end_render_pass();
            recorded.and(ended)?;

            let mut ectx = EffectContext {
                backend: &mut *r.backend,
                shaders: &mut *r.shaders,
                pool: &mut *effect_pool,
            };
            let output = effects.process(&mut ectx, &chain, color, depth_result, size)?;
            if output != color {
                frame_textures.push(output);
            }
            *blit = Some(resolve_blit(&mut r, output, packed.blit)?);
        }

        stats.bind_groups_created = r.bind_groups.created_this_frame();
        drop(r);

        let reflections = data.reflection_maps_mut();
        for probe_index in refreshed {
            if let Some(entry) = reflections.entry_mut(probe_index) {
                entry.rendered = true;
            }
        }
        Ok(())
    }
}

/// (Re)creates the layer's main depth attachment at the surface size.
fn ensure_depth_target(
    backend: &mut dyn RenderBackend,
    gpu: &mut LayerGpu,
    size: (u32, u32),
    format: wgpu::TextureFormat,
) -> Result<TextureId> {
    if let Some((id, current, current_format)) = gpu.depth {
        if current == size && current_format == format {
            return Ok(id);
        }
        backend.destroy_texture(id);
        gpu.depth = None;
    }
    let id = backend.create_texture(&TextureDesc::d2(
        "lumen.layer.depth",
        size.0,
        size.1,
        format,
        wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
    ))?;
    gpu.depth = Some((id, size, format));
    Ok(id)
}

/// Depth attachment matching pooled offscreen targets, whose sizes are
/// rounded up. Acquired at most once per layer and frame.
fn offscreen_depth_target(
    slot: &mut Option<TextureId>,
    pool: &mut EffectTexturePool,
    backend: &mut dyn RenderBackend,
    size: (u32, u32),
    format: wgpu::TextureFormat,
    frame_textures: &mut Vec<TextureId>,
) -> Result<TextureId> {
    if let Some(id) = *slot {
        return Ok(id);
    }
    let id = pool.acquire(backend, "lumen.depth.attachment", size, format)?;
    frame_textures.push(id);
    *slot = Some(id);
    Ok(id)
}

// ============================================================================
// Uniform staging
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct ObjectSlices {
    object: UniformSlice,
    material: UniformSlice,
    map_transforms: Option<UniformSlice>,
    lights: Option<UniformSlice>,
}

struct StagedUniforms<'f> {
    camera: UniformSlice,
    depth: UniformSlice,
    blit: Option<UniformSlice>,
    /// Per shadow map entry, one frame block per rendered layer.
    shadows: &'f [[UniformSlice; 6]],
    /// Per reflection map entry, one frame block per cube face.
    reflections: &'f [[UniformSlice; 6]],
    /// Parallel to [`LayerRenderData::objects`].
    objects: &'f [ObjectSlices],
}

fn stage_uniforms<'f>(
    arena: &'f FrameArena,
    uniforms: &mut UniformBuffer,
    scene: &SceneGraph,
    data: &LayerRenderData,
    fog: Option<(Vec4, f32, f32)>,
    with_blit: bool,
) -> StagedUniforms<'f> {
    uniforms.begin();

    let ambient: Vec3 = data.lights().iter().map(|l| l.light.ambient).sum();
    let (camera_frame, depth_frame) = match data.camera() {
        Some(camera) => (
            FrameUniforms::from_camera(camera, ambient, fog),
            depth_frame_for(camera),
        ),
        None => {
            let frame = FrameUniforms::from_view_projection(Mat4::IDENTITY, Vec3::ZERO, 1.0);
            (frame, frame)
        }
    };
    let camera = uniforms.push_pod(&camera_frame);
    let depth = uniforms.push_pod(&depth_frame);
    let blit = with_blit.then(|| uniforms.push(&effect_uniform_bytes(data.surface_size(), &[])));

    let shadows = arena.alloc_slice_fill_iter(data.shadow_maps().entries().iter().map(|entry| {
        let mut faces = [UniformSlice::default(); 6];
        let Some(light) = data.lights().get(entry.light_index) else {
            return faces;
        };
        let range = light.light.kind.range().unwrap_or(1.0);
        for (face, view_projection) in faces.iter_mut().zip(&entry.view_projections) {
            *face = uniforms.push_pod(&FrameUniforms::from_view_projection(
                *view_projection,
                light.position,
                range,
            ));
        }
        faces
    }));

    let reflections = arena.alloc_slice_fill_iter(data.reflection_maps().entries().iter().map(|entry| {
        let mut faces = [UniformSlice::default(); 6];
        for (face, view_projection) in faces.iter_mut().zip(entry.face_view_projections()) {
            *face = uniforms.push_pod(&FrameUniforms {
                view_projection: view_projection.to_cols_array_2d(),
                view: Mat4::IDENTITY.to_cols_array_2d(),
                camera_position: entry.position.extend(1.0).to_array(),
                ..camera_frame
            });
        }
        faces
    }));

    let p = ShaderKeyProperties::get();
    let mut materials: FxHashMap<MaterialId, UniformSlice> = FxHashMap::default();
    let mut light_sets: FxHashMap<&[u8], UniformSlice> = FxHashMap::default();
    let objects = arena.alloc_slice_fill_iter(data.objects().iter().map(|object| {
        let material = *materials.entry(object.material).or_insert_with(|| {
            match scene.material(object.material) {
                Some(Material {
                    kind: MaterialKind::Custom(custom),
                    ..
                }) => {
                    let bytes = arena.alloc_bytes(packed_uniform_size(&custom.properties).max(16));
                    pack_uniforms(&custom.properties, bytes);
                    uniforms.push(bytes)
                }
                Some(material) => uniforms.push_pod(&MaterialUniforms::from_material(material)),
                None => uniforms.push_pod(&MaterialUniforms::zeroed()),
            }
        });

        let count = (p.light_count.get(&object.shader_key) as usize).min(object.lights.len());
        let lights = (count > 0).then(|| {
            let set = &object.lights[..count];
            *light_sets.entry(set).or_insert_with(|| {
                let packed: SmallVec<[LightUniform; 8]> =
                    set.iter().map(|&i| light_uniform(data, usize::from(i))).collect();
                uniforms.push(bytemuck::cast_slice(&packed))
            })
        });

        let map_transforms = MaterialBindingLayout::from_key(&object.shader_key)
            .map_transforms
            .then(|| uniforms.push(&map_transform_bytes(&object.map_transforms)));

        ObjectSlices {
            object: uniforms.push_pod(&ObjectUniforms::new(
                &object.world,
                object.opacity,
                object.reflection_probe,
                &object.morph_weights,
            )),
            material,
            map_transforms,
            lights,
        }
    }));

    StagedUniforms {
        camera,
        depth,
        blit,
        shadows,
        reflections,
        objects,
    }
}

fn depth_frame_for(camera: &Camera) -> FrameUniforms {
    FrameUniforms::from_view_projection(*camera.view_projection_matrix(), camera.position(), camera.far)
}

fn light_uniform(data: &LayerRenderData, index: usize) -> LightUniform {
    let Some(light) = data.lights().get(index) else {
        return LightUniform::zeroed();
    };
    let (view_projection, size) = data.shadow_maps().entry(index).map_or((Mat4::IDENTITY, 0), |e| {
        (e.view_projections.first().copied().unwrap_or(Mat4::IDENTITY), e.size)
    });
    LightUniform::from_light(light, view_projection, size)
}

// ============================================================================
// Draw resolution
// ============================================================================

/// Group 3 inputs shared by every draw of a pass.
#[derive(Debug, Clone, Copy, Default)]
struct EnvironmentInputs {
    light_probe: Option<(TextureId, SamplerKey)>,
    ao: Option<TextureId>,
}

struct Resolver<'a> {
    scene: &'a SceneGraph,
    data: &'a LayerRenderData,
    backend: &'a mut dyn RenderBackend,
    shaders: &'a mut ShaderCache,
    bind_groups: &'a mut BindGroupCache,
    buffers: &'a BufferManager,
    settings: &'a RendererSettings,
    uniforms: &'a UniformBuffer,
    placeholder: Option<TextureId>,
}

struct Geometry {
    vertex_buffer: BufferId,
    index_buffer: Option<(BufferId, wgpu::IndexFormat)>,
    range: Range<u32>,
}

fn custom_of(material: &Material) -> Option<&CustomMaterial> {
    match &material.kind {
        MaterialKind::Custom(custom) => Some(custom),
        _ => None,
    }
}

impl Resolver<'_> {
    fn uniform(&self, slice: UniformSlice) -> Result<BindingResource> {
        self.uniforms.binding(slice).ok_or(LumenError::InvalidHandle {
            kind: "uniform buffer",
        })
    }

    fn group(
        &mut self,
        label: &str,
        pipeline: PipelineId,
        group: u32,
        entries: BindEntries,
    ) -> Result<BindGroupId> {
        self.bind_groups
            .get_or_create(&mut *self.backend, label, pipeline, group, entries)
    }

    /// `None` while the mesh is a placeholder or the subset is gone.
    fn geometry(&self, object: &RenderableObject) -> Option<Geometry> {
        let mesh = self.buffers.mesh(object.mesh)?;
        if mesh.placeholder {
            return None;
        }
        let (offset, count) = mesh.subsets.get(object.subset)?.range(object.lod);
        Some(Geometry {
            vertex_buffer: mesh.vertex_buffer?,
            index_buffer: mesh.index_buffer,
            range: offset..offset + count,
        })
    }

    fn material_draw(
        &mut self,
        object: &RenderableObject,
        slices: &ObjectSlices,
        key: &ShaderKey,
        state: PipelineStateKey,
        frame: UniformSlice,
        env: &EnvironmentInputs,
    ) -> Result<Option<DrawItem>> {
        let Some(geometry) = self.geometry(object) else {
            return Ok(None);
        };
        let scene = self.scene;
        let Some(material) = scene.material(object.material) else {
            return Ok(None);
        };
        let state = PipelineStateKey {
            cull_mode: material.cull_mode.to_wgpu(),
            ..state
        };
        let pipeline = self.shaders.get_or_create_pipeline(
            &mut *self.backend,
            key,
            self.data.features(),
            custom_of(material),
            state,
        )?;
        let layout = MaterialBindingLayout::from_key(key);

        let mut frame_entries: BindEntries = smallvec![(0, self.uniform(frame)?)];
        if layout.lights {
            let Some(lights) = slices.lights else {
                return Ok(None);
            };
            frame_entries.push((1, self.uniform(lights)?));
        }

        let mut material_entries: BindEntries = smallvec![(0, self.uniform(slices.material)?)];
        if layout.map_transforms
            && let Some(transforms) = slices.map_transforms
        {
            material_entries.push((1, self.uniform(transforms)?));
        }
        for &(slot, binding) in &layout.maps {
            let texture = object.maps[slot]
                .and_then(|h| self.buffers.texture(h))
                .map(|t| t.id)
                .or(self.placeholder);
            let Some(texture) = texture else {
                log::warn!("No texture for map slot {slot} of {:?}; draw skipped", object.node);
                return Ok(None);
            };
            let sampler_key = material.maps[slot]
                .and_then(|m| scene.image(m.image))
                .map_or(DEFAULT_SAMPLER, |image| image.sampler_key());
            material_entries.push((binding, BindingResource::Texture(texture)));
            material_entries.push((binding + 1, sampler(sampler_key)));
        }

        let Some(environment_entries) = self.environment_entries(object, &layout, env) else {
            log::warn!("Missing environment texture for {:?}; draw skipped", object.node);
            return Ok(None);
        };

        let object_entries: BindEntries = smallvec![(0, self.uniform(slices.object)?)];

        let frame_group = self.group("lumen.frame", pipeline, 0, frame_entries)?;
        let material_group = self.group("lumen.material", pipeline, 1, material_entries)?;
        let object_group = self.group("lumen.object", pipeline, 2, object_entries)?;
        let environment_group = if environment_entries.is_empty() {
            None
        } else {
            Some(self.group("lumen.environment", pipeline, 3, environment_entries)?)
        };

        Ok(Some(DrawItem {
            pipeline,
            bind_groups: [
                Some(frame_group),
                Some(material_group),
                Some(object_group),
                environment_group,
            ],
            vertex_buffer: geometry.vertex_buffer,
            index_buffer: geometry.index_buffer,
            range: geometry.range,
            instances: object.instance_count,
        }))
    }

    /// Group 3 entries, or `None` when a required map does not exist.
    fn environment_entries(
        &self,
        object: &RenderableObject,
        layout: &MaterialBindingLayout,
        env: &EnvironmentInputs,
    ) -> Option<BindEntries> {
        let mut entries = BindEntries::new();
        for &(i, binding) in &layout.shadows {
            let light_index = usize::from(*object.lights.get(i)?);
            let map = self.data.shadow_maps().entry(light_index)?;
            // Comparison-free depth sampling needs a non-filtering sampler.
            let filter = if map.mode == ShadowMode::Pcf {
                wgpu::FilterMode::Nearest
            } else {
                wgpu::FilterMode::Linear
            };
            entries.push((binding, BindingResource::Texture(map.sampled_texture())));
            entries.push((
                binding + 1,
                sampler((filter, wgpu::AddressMode::ClampToEdge)),
            ));
        }
        if let Some(binding) = layout.reflection {
            let map = self.data.reflection_maps().entry(object.reflection_probe?)?;
            entries.push((binding, BindingResource::Texture(map.color)));
            entries.push((binding + 1, sampler(CLAMPED_SAMPLER)));
        }
        if let Some(binding) = layout.light_probe {
            let (texture, sampler_key) = env
                .light_probe
                .or_else(|| self.placeholder.map(|p| (p, DEFAULT_SAMPLER)))?;
            entries.push((binding, BindingResource::Texture(texture)));
            entries.push((binding + 1, sampler(sampler_key)));
        }
        if let Some(binding) = layout.ao {
            let texture = env.ao.or(self.placeholder)?;
            entries.push((binding, BindingResource::Texture(texture)));
            entries.push((binding + 1, sampler(CLAMPED_SAMPLER)));
        }
        Some(entries)
    }

    fn depth_draw(
        &mut self,
        object: &RenderableObject,
        slices: &ObjectSlices,
        output: DepthOutput,
        state: PipelineStateKey,
        frame: UniformSlice,
    ) -> Result<Option<DrawItem>> {
        let Some(geometry) = self.geometry(object) else {
            return Ok(None);
        };
        let Some(material) = self.scene.material(object.material) else {
            return Ok(None);
        };
        let custom = custom_of(material);
        let state = PipelineStateKey {
            cull_mode: material.cull_mode.to_wgpu(),
            ..state
        };
        let pipeline = self.shaders.get_or_create_depth(
            &mut *self.backend,
            &object.shader_key,
            output,
            custom,
            state,
        )?;

        let frame_entries: BindEntries = smallvec![(0, self.uniform(frame)?)];
        let object_entries: BindEntries = smallvec![(0, self.uniform(slices.object)?)];
        let material_group = if custom.is_some_and(|c| c.overrides_position) {
            let entries: BindEntries = smallvec![(0, self.uniform(slices.material)?)];
            Some(self.group("lumen.depth.material", pipeline, 1, entries)?)
        } else {
            None
        };
        let frame_group = self.group("lumen.depth.frame", pipeline, 0, frame_entries)?;
        let object_group = self.group("lumen.depth.object", pipeline, 2, object_entries)?;

        Ok(Some(DrawItem {
            pipeline,
            bind_groups: [Some(frame_group), material_group, Some(object_group), None],
            vertex_buffer: geometry.vertex_buffer,
            index_buffer: geometry.index_buffer,
            range: geometry.range,
            instances: object.instance_count,
        }))
    }
}

// ============================================================================
// Passes
// ============================================================================

fn render_shadow_maps(
    r: &mut Resolver<'_>,
    staged: &StagedUniforms<'_>,
    arena: &FrameArena,
    stats: &mut FrameStats,
) -> Result<()> {
    let data = r.data;
    for (e, map) in data.shadow_maps().entries().iter().enumerate() {
        let casters = data
            .shadow_casters()
            .iter()
            .find(|c| c.light_index == map.light_index)
            .map_or(&[][..], |c| &c.casters[..]);
        let (output, state) = match map.mode {
            ShadowMode::Vsm => (
                DepthOutput::Moments,
                PipelineStateKey::depth_only(Some(SHADOW_MOMENTS_FORMAT), SHADOW_DEPTH_FORMAT),
            ),
            ShadowMode::Pcf => (
                DepthOutput::DepthOnly,
                PipelineStateKey::depth_only(None, SHADOW_DEPTH_FORMAT),
            ),
            ShadowMode::Cube => (
                DepthOutput::Distance,
                PipelineStateKey::depth_only(Some(SHADOW_MOMENTS_FORMAT), SHADOW_DEPTH_FORMAT),
            ),
        };

        for layer in 0..map.layers.min(6) {
            let frame = staged.shadows[e][layer as usize];
            let mut items = arena.vec();
            for &i in casters {
                let (Some(object), Some(slices)) = (data.objects().get(i), staged.objects.get(i)) else {
                    continue;
                };
                if let Some(item) = r.depth_draw(object, slices, output, state, frame)? {
                    items.push(item);
                }
            }
            let desc = RenderPassDesc {
                label: "lumen.shadow",
                color_attachments: map
                    .color
                    .map(|texture| ColorAttachment {
                        texture,
                        layer,
                        clear: Some(wgpu::Color::WHITE),
                    })
                    .into_iter()
                    .collect(),
                depth_attachment: Some(DepthAttachment {
                    texture: map.depth,
                    layer,
                    clear: Some(1.0),
                }),
            };
            draw::run_pass(&mut *r.backend, &desc, &items, stats)?;
            stats.shadow_passes += 1;
        }
    }
    Ok(())
}

/// Renders the faces of every probe due for a refresh and returns their
/// probe indices.
fn render_reflection_maps(
    r: &mut Resolver<'_>,
    staged: &StagedUniforms<'_>,
    arena: &FrameArena,
    env: &EnvironmentInputs,
    stats: &mut FrameStats,
) -> Result<SmallVec<[usize; 4]>> {
    let p = ShaderKeyProperties::get();
    let data = r.data;
    let state = PipelineStateKey::opaque(REFLECTION_COLOR_FORMAT, REFLECTION_DEPTH_FORMAT);
    // AO belongs to the camera view.
    let env = EnvironmentInputs { ao: None, ..*env };
    let mut refreshed = SmallVec::new();

    for (e, map) in data.reflection_maps().entries().iter().enumerate() {
        if !map.needs_render() {
            continue;
        }
        let Some(probe) = data.probes().get(map.probe_index) else {
            continue;
        };
        let clear = draw::to_wgpu_color(probe.probe.clear_color);

        for face in 0..6u32 {
            let frame = staged.reflections[e][face as usize];
            let mut items = arena.vec();
            for (object, slices) in data.objects().iter().zip(staged.objects) {
                if object.transparent {
                    continue;
                }
                let mut key = object.shader_key;
                p.reflection_probe.set(&mut key, false);
                p.ssao.set(&mut key, false);
                if let Some(item) = r.material_draw(object, slices, &key, state, frame, &env)? {
                    items.push(item);
                }
            }
            let desc = RenderPassDesc {
                label: "lumen.reflection",
                color_attachments: smallvec![ColorAttachment {
                    texture: map.color,
                    layer: face,
                    clear: Some(clear),
                }],
                depth_attachment: Some(DepthAttachment {
                    texture: map.depth,
                    layer: face,
                    clear: Some(1.0),
                }),
            };
            draw::run_pass(&mut *r.backend, &desc, &items, stats)?;
            stats.reflection_passes += 1;
        }
        refreshed.push(map.probe_index);
    }
    Ok(refreshed)
}

/// Linear view depth of the opaque objects into `target`.
fn render_depth_texture(
    r: &mut Resolver<'_>,
    staged: &StagedUniforms<'_>,
    arena: &FrameArena,
    target: TextureId,
    format: wgpu::TextureFormat,
    depth_attachment: TextureId,
    stats: &mut FrameStats,
) -> Result<()> {
    let data = r.data;
    let state = PipelineStateKey::depth_only(Some(format), r.settings.depth_format);
    let mut items = arena.vec();
    for &i in data.opaque_indices() {
        let object = &data.objects()[i];
        if let Some(item) = r.depth_draw(object, &staged.objects[i], DepthOutput::Distance, state, staged.depth)? {
            items.push(item);
        }
    }
    let desc = RenderPassDesc::single("lumen.depth", target, Some(wgpu::Color::WHITE), Some(depth_attachment));
    draw::run_pass(&mut *r.backend, &desc, &items, stats)
}

/// Fills `draws` with opaque then transparent items and returns the number
/// of opaque ones.
fn resolve_main_draws(
    r: &mut Resolver<'_>,
    staged: &StagedUniforms<'_>,
    env: &EnvironmentInputs,
    draws: &mut Vec<DrawItem>,
) -> Result<usize> {
    let data = r.data;
    let color = r.settings.color_format;
    let depth = r.settings.depth_format;
    let passes = [
        (data.opaque_indices(), PipelineStateKey::opaque(color, depth)),
        (data.transparent_indices(), PipelineStateKey::transparent(color, depth)),
    ];

    let mut opaque = 0;
    for (pass, (indices, state)) in passes.into_iter().enumerate() {
        for &i in indices {
            let object = &data.objects()[i];
            let item = r.material_draw(
                object,
                &staged.objects[i],
                &object.shader_key,
                state,
                staged.camera,
                env,
            )?;
            draws.extend(item);
        }
        if pass == 0 {
            opaque = draws.len();
        }
    }
    Ok(opaque)
}

fn resolve_blit(
    r: &mut Resolver<'_>,
    texture: TextureId,
    header: Option<UniformSlice>,
) -> Result<FullscreenDraw> {
    let header = header.ok_or(LumenError::InvalidHandle {
        kind: "uniform buffer",
    })?;
    // The blit is recorded into the layer pass, which carries a depth
    // attachment.
    let state = PipelineStateKey {
        depth_format: Some(r.settings.depth_format),
        ..PipelineStateKey::fullscreen(r.settings.color_format)
    };
    let pipeline =
        r.shaders
            .get_or_create_fullscreen(&mut *r.backend, None, &[], &["input_texture"], state)?;
    let binding = fullscreen_texture_binding(0);
    let entries: BindEntries = smallvec![
        (0, r.uniform(header)?),
        (binding, BindingResource::Texture(texture)),
        (binding + 1, sampler(CLAMPED_SAMPLER)),
    ];
    let bind_group = r.group("lumen.blit", pipeline, 0, entries)?;
    Ok(FullscreenDraw {
        pipeline,
        bind_group,
    })
}
