//! Layer Render Data
//!
//! Per-layer, per-frame derived state: the active camera, the layer light
//! list, the renderable objects with their sort order, light assignment and
//! shader keys, plus the shadow and reflection map entries they need.
//!
//! # Preparation
//!
//! ```text
//! Idle ──prepare_for_render──▶ Preparing ──▶ Prepared ──reset_for_frame──▶ Idle
//! ```
//!
//! 1. Globals are recomputed for the layer subtree (and any imported scene).
//! 2. The camera is resolved; a missing or degenerate camera yields an
//!    empty list.
//! 3. Renderables are collected per mesh subset, culled against the camera
//!    frustum and sorted: opaque by a depth-major [`RenderKey`], transparent
//!    strictly back-to-front.
//! 4. Lights are assigned, shadow and reflection entries allocated and
//!    shader keys resolved.
//! 5. The layer is marked prepared; the lists stay immutable until reset.

use glam::{Affine3A, Mat3, Vec3};
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::Key;
use smallvec::SmallVec;

use crate::contract_violation;
use crate::errors::{LumenError, Result};
use crate::hal::RenderBackend;
use crate::resources::{Aabb, BufferManager, MeshHandle, MeshLod, MorphLayout, TextureHandle, VertexAttributes};
use crate::scene::{
    Camera, ImageId, Light, LightKind, MAP_SLOT_COUNT, MapSlot, MappingMode, MaterialId, Model,
    Node, NodeFlags, NodeId, NodeKind, ProjectionType, ReflectionProbe, SceneGraph, TextureSource,
};
use crate::settings::{MAX_LIGHTS, MipMode, OutputColorSpace, RendererSettings, ShadowTechnique, TonemapMode};
use crate::shader::{
    LayerKeyState, LightKeyState, MapKeyState, ObjectKeyState, ShaderFeatures, ShaderKey,
    ShaderKeyResolver,
};
use crate::utils::fx_hash_key;

use super::reflections::ReflectionMapManager;
use super::shadows::{
    ShadowMapManager, ShadowMode, cube_face_view_projections, directional_view_projection,
    spot_view_projection,
};

/// Smallest shadow map edge accepted.
const MIN_SHADOW_MAP_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareState {
    #[default]
    Idle,
    Preparing,
    Prepared,
}

/// Opaque sort key: camera depth in the high bits, then a shader hint and
/// the material, so equal-depth objects group by state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RenderKey(u64);

impl RenderKey {
    #[must_use]
    pub fn opaque(depth: f32, shader_hint: u16, material_index: u32) -> Self {
        let d_u32 = if depth.is_sign_negative() || !depth.is_finite() {
            if depth == f32::INFINITY { u32::MAX >> 2 } else { 0 }
        } else {
            depth.to_bits() >> 2
        };
        let d_bits = (u64::from(d_u32) & 0x3FFF_FFFF) << 34;
        let s_bits = (u64::from(shader_hint) & 0x3FFF) << 20;
        let m_bits = u64::from(material_index) & 0xF_FFFF;
        Self(d_bits | s_bits | m_bits)
    }

    #[inline]
    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }
}

/// One enabled light in the layer, in assignment order.
#[derive(Debug, Clone)]
pub struct LayerLight {
    pub node: NodeId,
    pub light: Light,
    pub position: Vec3,
    pub direction: Vec3,
    /// Set when the light casts shadows and a map could be allocated.
    pub shadow: Option<ShadowMode>,
}

impl LayerLight {
    #[must_use]
    pub fn key_state(&self) -> LightKeyState {
        LightKeyState {
            directional: matches!(self.light.kind, LightKind::Directional),
            spot: matches!(self.light.kind, LightKind::Spot { .. }),
            shadow: self.shadow.is_some(),
        }
    }
}

/// A reflection probe found in the layer.
#[derive(Debug, Clone)]
pub struct LayerProbe {
    pub node: NodeId,
    pub probe: ReflectionProbe,
    pub position: Vec3,
}

/// One drawable mesh subset.
#[derive(Debug, Clone)]
pub struct RenderableObject {
    pub node: NodeId,
    pub subset: usize,
    /// Level of detail drawn; 0 is the subset itself.
    pub lod: usize,
    pub mesh: MeshHandle,
    pub material: MaterialId,
    pub world: Affine3A,
    pub world_bounds: Aabb,
    /// Camera-space depth of the bounds centre; larger is farther.
    pub depth: f32,
    pub opacity: f32,
    pub transparent: bool,
    pub cast_shadows: bool,
    pub receive_shadows: bool,
    pub instance_count: u32,
    /// Indices into [`LayerRenderData::lights`].
    pub lights: SmallVec<[u8; 8]>,
    pub maps: [Option<TextureHandle>; MAP_SLOT_COUNT],
    pub map_transforms: [Mat3; MAP_SLOT_COUNT],
    /// Index into [`LayerRenderData::probes`].
    pub reflection_probe: Option<usize>,
    pub attributes: VertexAttributes,
    pub morph: MorphLayout,
    pub morph_weights: SmallVec<[f32; 8]>,
    pub shader_key: ShaderKey,
    /// The material was edited since the last frame; cached pipelines and
    /// bind groups for this object are stale.
    pub material_invalidated: bool,
    pub sort_key: RenderKey,
    /// Inside the camera frustum.
    pub visible: bool,
}

/// Objects drawn into one shadow map.
#[derive(Debug, Clone, Default)]
pub struct ShadowCasters {
    pub light_index: usize,
    /// Indices into [`LayerRenderData::objects`].
    pub casters: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct LayerPrepResult {
    /// The layer had pending changes or was not prepared before.
    pub was_dirty: bool,
    /// Visible renderable subsets.
    pub renderables: usize,
    pub culled: usize,
    /// Nodes whose globals were recomputed.
    pub recomputed: usize,
    /// Objects whose cached shader state was dropped by a material edit.
    pub invalidated: usize,
    /// Materials moved to `DirtyWithinFrame`; cleared at the next frame.
    pub cleared_materials: Vec<MaterialId>,
    /// Images seen dirty; their flag is cleared at the next frame so every
    /// layer prepared this frame observes the change.
    pub changed_images: Vec<ImageId>,
}

#[derive(Debug, Clone, Copy)]
struct CachedKey {
    material: MaterialId,
    inputs: u64,
    key: ShaderKey,
}

struct ImageInfo {
    source: TextureSource,
    mip_mode: Option<MipMode>,
    transform: Mat3,
    state: MapKeyState,
}

pub struct LayerRenderData {
    layer: NodeId,
    state: PrepareState,
    camera_node: Option<NodeId>,
    camera: Option<Camera>,
    lights: Vec<LayerLight>,
    probes: Vec<LayerProbe>,
    objects: Vec<RenderableObject>,
    opaque: Vec<usize>,
    transparent: Vec<usize>,
    shadow_casters: Vec<ShadowCasters>,
    shadow_maps: ShadowMapManager,
    reflection_maps: ReflectionMapManager,
    key_cache: FxHashMap<(NodeId, usize), CachedKey>,
    features: ShaderFeatures,
    tonemap: TonemapMode,
    surface_size: (u32, u32),
    prepared_once: bool,
    keys_resolved: u64,
}

impl LayerRenderData {
    #[must_use]
    pub fn new(layer: NodeId) -> Self {
        Self {
            layer,
            state: PrepareState::Idle,
            camera_node: None,
            camera: None,
            lights: Vec::new(),
            probes: Vec::new(),
            objects: Vec::new(),
            opaque: Vec::new(),
            transparent: Vec::new(),
            shadow_casters: Vec::new(),
            shadow_maps: ShadowMapManager::new(),
            reflection_maps: ReflectionMapManager::new(),
            key_cache: FxHashMap::default(),
            features: ShaderFeatures::empty(),
            tonemap: TonemapMode::None,
            surface_size: (0, 0),
            prepared_once: false,
            keys_resolved: 0,
        }
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    /// Runs the preparation steps for this frame. A second call in the same
    /// frame is a no-op reporting no work.
    pub fn prepare_for_render(
        &mut self,
        scene: &mut SceneGraph,
        backend: &mut dyn RenderBackend,
        buffers: &mut BufferManager,
        settings: &RendererSettings,
        surface_size: (u32, u32),
    ) -> Result<LayerPrepResult> {
        match self.state {
            PrepareState::Prepared => return Ok(LayerPrepResult::default()),
            PrepareState::Preparing => {
                return contract_violation!("layer prepared re-entrantly");
            }
            PrepareState::Idle => {}
        }

        let Some(layer_node) = scene.node(self.layer) else {
            return Err(LumenError::InvalidHandle { kind: "node" });
        };
        let Some(layer) = layer_node.as_layer() else {
            return Err(LumenError::NotALayer);
        };

        self.state = PrepareState::Preparing;
        let mut result = LayerPrepResult {
            was_dirty: !self.prepared_once
                || self.surface_size != surface_size
                || !layer_node.flags().is_empty()
                || layer
                    .imported_scene()
                    .and_then(|root| scene.node(root))
                    .is_some_and(|n| !n.flags().is_empty()),
            ..Default::default()
        };
        self.surface_size = surface_size;
        self.prepared_once = true;

        // Step 1: globals.
        let update_root = dirty_update_root(scene, self.layer);
        result.recomputed = scene.update_globals(update_root);

        self.clear_lists();
        self.features = layer_features(scene, self.layer, settings);
        self.tonemap = scene
            .node(self.layer)
            .and_then(|n| n.as_layer())
            .and_then(|l| l.tonemap_mode)
            .unwrap_or(settings.tonemap_mode);

        // Step 2: gather and resolve the camera.
        let gathered = gather_layer(scene, self.layer);
        self.camera_node = resolve_camera_node(scene, self.layer, &gathered.cameras);
        let aspect = surface_size.0.max(1) as f32 / surface_size.1.max(1) as f32;
        self.camera = self.camera_node.and_then(|id| {
            let node = scene.node(id)?;
            let mut camera = node.as_camera()?.clone();
            camera.update(node.world_matrix(), aspect).then_some(camera)
        });
        let Some(camera) = self.camera.clone() else {
            log::debug!("Layer {:?} has no usable camera; nothing to render", self.layer);
            self.shadow_maps.begin_prepare();
            self.shadow_maps.prune(backend);
            self.reflection_maps.begin_prepare();
            self.reflection_maps.prune(backend);
            self.state = PrepareState::Prepared;
            return Ok(result);
        };

        // Step 4a: layer lights, needed before per-object assignment.
        let caps = backend.capabilities();
        let (float_targets, cube_targets) = (caps.float_render_targets, caps.cube_render_targets);
        self.collect_lights(scene, &gathered.lights, settings, float_targets, cube_targets);
        self.collect_probes(scene, &gathered.probes, cube_targets);

        // Step 3: renderables.
        let uploads_before = buffers.upload_count();
        let images = collect_images(scene, &gathered.renderables, &mut result.changed_images);
        for &node in &gathered.renderables {
            self.collect_renderable(scene, backend, buffers, settings, &camera, &images, node, &mut result);
        }

        // Step 4b: shadow and reflection maps, then keys.
        self.allocate_shadow_maps(backend, settings);
        self.allocate_reflection_maps(backend);
        self.assign_lights(scene, settings);
        self.assign_probes();
        self.resolve_keys(scene, &images, &mut result);

        // Edits outside the node tree.
        result.was_dirty |= !result.cleared_materials.is_empty()
            || !result.changed_images.is_empty()
            || buffers.upload_count() != uploads_before;

        // Step 3 (cont.): partition and sort the visible set.
        for (i, object) in self.objects.iter().enumerate() {
            if !object.visible {
                continue;
            }
            if object.transparent {
                self.transparent.push(i);
            } else {
                self.opaque.push(i);
            }
        }
        let objects = &self.objects;
        self.opaque.sort_by_key(|&i| objects[i].sort_key);
        self.transparent
            .sort_by(|&a, &b| objects[b].depth.total_cmp(&objects[a].depth));
        result.renderables = self.opaque.len() + self.transparent.len();

        // Step 5.
        self.state = PrepareState::Prepared;
        log::trace!(
            "Layer {:?} prepared: {} renderables, {} culled, {} lights",
            self.layer,
            result.renderables,
            result.culled,
            self.lights.len()
        );
        Ok(result)
    }

    /// Returns the layer to `Idle` so it can be prepared again.
    pub fn reset_for_frame(&mut self) {
        self.state = PrepareState::Idle;
        for object in &mut self.objects {
            object.material_invalidated = false;
        }
    }

    /// Destroys shadow and reflection targets.
    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.shadow_maps.release_all(backend);
        self.reflection_maps.release_all(backend);
        self.key_cache.clear();
        self.clear_lists();
        self.state = PrepareState::Idle;
        self.prepared_once = false;
    }

    fn clear_lists(&mut self) {
        self.camera = None;
        self.camera_node = None;
        self.lights.clear();
        self.probes.clear();
        self.objects.clear();
        self.opaque.clear();
        self.transparent.clear();
        self.shadow_casters.clear();
    }

    fn collect_lights(
        &mut self,
        scene: &SceneGraph,
        nodes: &[NodeId],
        settings: &RendererSettings,
        float_targets: bool,
        cube_targets: bool,
    ) {
        for &id in nodes {
            let Some(node) = scene.node(id) else { continue };
            let Some(light) = node.as_light() else { continue };
            if !light.is_enabled() {
                continue;
            }
            let world = node.world_matrix();
            let direction = world.transform_vector3(Vec3::NEG_Z).normalize_or(Vec3::NEG_Z);
            let shadow = if light.cast_shadow {
                shadow_mode_for(light, settings.shadow_technique, float_targets, cube_targets)
            } else {
                None
            };
            self.lights.push(LayerLight {
                node: id,
                light: light.clone(),
                position: world.translation.into(),
                direction,
                shadow,
            });
        }

        // Shadow casters first, then directional lights.
        self.lights
            .sort_by_key(|l| (l.shadow.is_none(), !l.light.is_directional()));
        let cap = settings.max_lights_per_object.min(MAX_LIGHTS);
        if self.lights.len() > cap {
            log::debug!("Layer has {} lights; using the first {cap}", self.lights.len());
            self.lights.truncate(cap);
        }

        for light in &self.lights {
            match light.shadow {
                Some(ShadowMode::Vsm) => self.features |= ShaderFeatures::SHADOW_VSM,
                Some(ShadowMode::Pcf) => self.features |= ShaderFeatures::SHADOW_PCF,
                Some(ShadowMode::Cube) | None => {}
            }
        }
    }

    fn collect_probes(&mut self, scene: &SceneGraph, nodes: &[NodeId], cube_targets: bool) {
        if nodes.is_empty() {
            return;
        }
        if !cube_targets {
            log::warn!("Backend lacks cube render targets; reflection probes disabled");
            return;
        }
        for &id in nodes {
            let Some(node) = scene.node(id) else { continue };
            let Some(probe) = node.as_reflection_probe() else { continue };
            self.probes.push(LayerProbe {
                node: id,
                probe: probe.clone(),
                position: node.world_matrix().translation.into(),
            });
        }
        if !self.probes.is_empty() {
            self.features |= ShaderFeatures::REFLECTION_PROBES;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_renderable(
        &mut self,
        scene: &SceneGraph,
        backend: &mut dyn RenderBackend,
        buffers: &mut BufferManager,
        settings: &RendererSettings,
        camera: &Camera,
        images: &FxHashMap<ImageId, ImageInfo>,
        id: NodeId,
        result: &mut LayerPrepResult,
    ) {
        // Registrations are rebuilt from what the node references now.
        buffers.release_user(id);
        let Some(node) = scene.node(id) else { return };
        let Some(model) = node.as_renderable() else { return };
        let world = renderable_world(node);
        let opacity = node.global_opacity();

        let Some(mesh_handle) = buffers.load_mesh(backend, scene, &model.mesh, id) else {
            if !matches!(model.mesh, crate::scene::MeshSource::None) {
                log::debug!("Skipping '{}': mesh not resolved", node.name);
            }
            return;
        };
        let Some(mesh) = buffers.mesh(mesh_handle) else { return };
        if !mesh.is_drawable() {
            log::trace!("Skipping '{}': placeholder mesh", node.name);
            return;
        }
        let attributes = mesh.attributes;
        let morph = mesh.morph;
        let subsets: SmallVec<[(usize, Aabb, SmallVec<[MeshLod; 2]>); 4]> = mesh
            .subsets
            .iter()
            .enumerate()
            .map(|(i, s)| (i, s.bounds, s.lods.iter().copied().collect()))
            .collect();
        let instanced = model.instance_count > 1;

        for (subset, local_bounds, lods) in subsets {
            let Some(material_id) = model.material_for_subset(subset) else {
                log::warn!("'{}' subset {subset} has no material; skipped", node.name);
                continue;
            };
            let Some(material) = scene.material(material_id) else {
                log::warn!("'{}' references a removed material; skipped", node.name);
                continue;
            };

            let mut maps = [None; MAP_SLOT_COUNT];
            let mut map_transforms = [Mat3::IDENTITY; MAP_SLOT_COUNT];
            for (slot, entry) in material.maps.iter().enumerate() {
                let Some(entry) = entry else { continue };
                let Some(info) = images.get(&entry.image) else { continue };
                let mip_mode = info.mip_mode.unwrap_or(settings.texture_mip_mode);
                maps[slot] = buffers.load_texture(backend, scene, &info.source, mip_mode, id);
                map_transforms[slot] = info.transform;
            }
            let base_has_alpha = maps[MapSlot::BaseColor.index()]
                .and_then(|h| buffers.texture(h))
                .is_some_and(|t| t.has_transparency);

            let world_bounds = local_bounds.transformed(&world);
            let visible = instanced
                || !camera.frustum_culling
                || camera
                    .frustum()
                    .intersects_sphere(world_bounds.center(), world_bounds.radius());
            if !visible {
                result.culled += 1;
                if !model.cast_shadows {
                    continue;
                }
            }

            let depth = camera.view_depth(world_bounds.center());
            let lod = select_lod(camera, &lods, &world_bounds, &world, model.lod_bias, self.surface_size.0);
            self.objects.push(RenderableObject {
                node: id,
                subset,
                lod,
                mesh: mesh_handle,
                material: material_id,
                world,
                world_bounds,
                depth,
                opacity,
                transparent: material.is_transparent(base_has_alpha) || opacity < 1.0,
                cast_shadows: model.cast_shadows,
                receive_shadows: model.receive_shadows,
                instance_count: model.instance_count.max(1),
                lights: SmallVec::new(),
                maps,
                map_transforms,
                reflection_probe: None,
                attributes,
                morph,
                morph_weights: model.morph_weights.iter().copied().take(morph.targets as usize).collect(),
                shader_key: ShaderKey::default(),
                material_invalidated: false,
                sort_key: RenderKey::opaque(depth, 0, material_index(material_id)),
                visible,
            });
        }
    }

    fn allocate_shadow_maps(&mut self, backend: &mut dyn RenderBackend, settings: &RendererSettings) {
        self.shadow_maps.begin_prepare();
        let max_size = backend.capabilities().max_texture_size;

        let caster_bounds = self
            .objects
            .iter()
            .filter(|o| o.cast_shadows)
            .fold(Aabb::EMPTY, |acc, o| acc.union(&o.world_bounds));

        for index in 0..self.lights.len() {
            let Some(mode) = self.lights[index].shadow else { continue };
            let light = &self.lights[index];
            let requested = light.light.shadow_map_size.unwrap_or(settings.shadow_map_size);
            let size = requested.clamp(MIN_SHADOW_MAP_SIZE, max_size);
            if size != requested {
                log::warn!("Shadow map size {requested} clamped to {size}");
            }

            let view_projections: SmallVec<[glam::Mat4; 6]> = match light.light.kind {
                LightKind::Directional => {
                    smallvec::smallvec![directional_view_projection(light.direction, &caster_bounds, size)]
                }
                LightKind::Spot { range, outer, .. } => {
                    smallvec::smallvec![spot_view_projection(light.position, light.direction, outer, range)]
                }
                LightKind::Point { range } => cube_face_view_projections(light.position, range).into_iter().collect(),
            };

            let casters: Vec<usize> = self
                .objects
                .iter()
                .enumerate()
                .filter(|(_, o)| o.cast_shadows)
                .filter(|(_, o)| {
                    view_projections.iter().any(|vp| {
                        crate::scene::Frustum::from_matrix(*vp)
                            .intersects_sphere(o.world_bounds.center(), o.world_bounds.radius())
                    })
                })
                .map(|(i, _)| i)
                .collect();

            match self
                .shadow_maps
                .add_entry(backend, index, light.node, mode, size, mode.layers())
            {
                Ok(entry) => {
                    entry.view_projections = view_projections;
                    self.shadow_casters.push(ShadowCasters {
                        light_index: index,
                        casters,
                    });
                }
                Err(err) => {
                    log::warn!("Shadow map allocation failed: {err}; light renders unshadowed");
                    self.lights[index].shadow = None;
                }
            }
        }
        self.shadow_maps.prune(backend);
    }

    fn allocate_reflection_maps(&mut self, backend: &mut dyn RenderBackend) {
        self.reflection_maps.begin_prepare();
        let max_size = backend.capabilities().max_texture_size;
        for (index, probe) in self.probes.iter().enumerate() {
            let size = probe.probe.resolution.clamp(1, max_size);
            match self.reflection_maps.add_entry(backend, index, probe.node, size) {
                Ok(entry) => {
                    entry.refresh = probe.probe.refresh;
                    entry.position = probe.position;
                }
                Err(err) => log::warn!("Reflection map allocation failed: {err}"),
            }
        }
        self.reflection_maps.prune(backend);
    }

    fn assign_lights(&mut self, scene: &SceneGraph, settings: &RendererSettings) {
        let cap = settings.max_lights_per_object.min(MAX_LIGHTS);
        let excluded: FxHashMap<NodeId, SmallVec<[NodeId; 2]>> = self
            .objects
            .iter()
            .filter_map(|o| {
                let model: &Model = scene.node(o.node)?.as_renderable()?;
                (!model.excluded_lights.is_empty()).then(|| (o.node, model.excluded_lights.clone()))
            })
            .collect();

        for object in &mut self.objects {
            object.lights.clear();
            for (i, light) in self.lights.iter().enumerate() {
                if object.lights.len() >= cap {
                    break;
                }
                if let Some(scope) = light.light.scope
                    && scope != object.node
                    && !scene.is_ancestor_of(scope, object.node)
                {
                    continue;
                }
                if excluded.get(&object.node).is_some_and(|e| e.contains(&light.node)) {
                    continue;
                }
                if settings.light_culling
                    && let Some(range) = light.light.kind.range()
                    && light.position.distance(object.world_bounds.center())
                        > range + object.world_bounds.radius()
                {
                    continue;
                }
                object.lights.push(i as u8);
            }
        }
    }

    fn assign_probes(&mut self) {
        if self.probes.is_empty() {
            return;
        }
        let maps = &self.reflection_maps;
        for object in &mut self.objects {
            let center = object.world_bounds.center();
            object.reflection_probe = self
                .probes
                .iter()
                .enumerate()
                .filter(|(i, p)| maps.entry(*i).is_some() && p.probe.contains(p.position, center))
                .min_by(|(_, a), (_, b)| {
                    a.position
                        .distance_squared(center)
                        .total_cmp(&b.position.distance_squared(center))
                })
                .map(|(i, _)| i);
        }
    }

    fn resolve_keys(
        &mut self,
        scene: &mut SceneGraph,
        images: &FxHashMap<ImageId, ImageInfo>,
        result: &mut LayerPrepResult,
    ) {
        let layer_state = LayerKeyState {
            features: self.features,
            tonemap: self.tonemap,
        };
        let mut edited: FxHashSet<MaterialId> = FxHashSet::default();
        let mut seen: FxHashSet<(NodeId, usize)> = FxHashSet::default();

        for object in &mut self.objects {
            let Some(material) = scene.material(object.material) else { continue };
            let cache_key = (object.node, object.subset);
            seen.insert(cache_key);

            // Each layer is prepared once per frame, so every user of an
            // edited material is invalidated exactly once.
            if material.is_dirty() {
                edited.insert(object.material);
                object.material_invalidated = true;
                if self.key_cache.remove(&cache_key).is_some() {
                    result.invalidated += 1;
                }
            }

            let mut maps = [None; MAP_SLOT_COUNT];
            for (slot, handle) in object.maps.iter().enumerate() {
                if handle.is_some()
                    && let Some(entry) = &material.maps[slot]
                    && let Some(info) = images.get(&entry.image)
                {
                    maps[slot] = Some(info.state);
                }
            }
            let lights: SmallVec<[LightKeyState; 8]> = object
                .lights
                .iter()
                .map(|&i| self.lights[i as usize].key_state())
                .collect();
            let object_state = ObjectKeyState {
                bone_count: scene
                    .node(object.node)
                    .and_then(|n| n.as_renderable())
                    .map_or(0, |m| m.bone_count),
                instanced: object.instance_count > 1,
                morph: object.morph,
                receives_shadows: object.receive_shadows,
                reflection_probe: object.reflection_probe.is_some(),
            };
            let inputs = fx_hash_key(&(maps, lights.as_slice(), object.attributes.bits(), object_state, layer_state));

            let key = match self.key_cache.get(&cache_key) {
                Some(cached) if cached.material == object.material && cached.inputs == inputs => cached.key,
                _ => {
                    let key = ShaderKeyResolver::resolve(
                        material,
                        &maps,
                        &lights,
                        object.attributes,
                        &object_state,
                        &layer_state,
                    );
                    self.keys_resolved += 1;
                    self.key_cache.insert(
                        cache_key,
                        CachedKey {
                            material: object.material,
                            inputs,
                            key,
                        },
                    );
                    key
                }
            };
            object.shader_key = key;
            let hint = (fx_hash_key(&key) & 0x3FFF) as u16;
            object.sort_key = RenderKey::opaque(object.depth, hint, material_index(object.material));
        }

        self.key_cache.retain(|k, _| seen.contains(k));

        let materials = scene.materials_raw_mut();
        for &id in &edited {
            if let Some(material) = materials.get_mut(id) {
                material.clear_dirty();
            }
        }
        result.cleared_materials.extend(edited);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn layer(&self) -> NodeId {
        self.layer
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> PrepareState {
        self.state
    }

    #[must_use]
    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    #[must_use]
    pub fn camera_node(&self) -> Option<NodeId> {
        self.camera_node
    }

    /// Visible opaque objects, front to back.
    pub fn opaque_objects(&self) -> impl Iterator<Item = &RenderableObject> + '_ {
        self.opaque.iter().map(|&i| &self.objects[i])
    }

    /// Visible transparent objects, back to front.
    pub fn transparent_objects(&self) -> impl Iterator<Item = &RenderableObject> + '_ {
        self.transparent.iter().map(|&i| &self.objects[i])
    }

    /// Indices into [`objects`](Self::objects) of the visible opaque objects,
    /// in draw order.
    pub(crate) fn opaque_indices(&self) -> &[usize] {
        &self.opaque
    }

    pub(crate) fn transparent_indices(&self) -> &[usize] {
        &self.transparent
    }

    /// Opaque then transparent, in draw order.
    pub fn renderable_objects(&self) -> impl Iterator<Item = &RenderableObject> + '_ {
        self.opaque_objects().chain(self.transparent_objects())
    }

    #[must_use]
    pub fn renderable_count(&self) -> usize {
        self.opaque.len() + self.transparent.len()
    }

    /// Every collected object, including shadow casters outside the view.
    #[must_use]
    pub fn objects(&self) -> &[RenderableObject] {
        &self.objects
    }

    #[must_use]
    pub fn lights(&self) -> &[LayerLight] {
        &self.lights
    }

    #[must_use]
    pub fn probes(&self) -> &[LayerProbe] {
        &self.probes
    }

    #[must_use]
    pub fn shadow_maps(&self) -> &ShadowMapManager {
        &self.shadow_maps
    }

    #[must_use]
    pub fn shadow_casters(&self) -> &[ShadowCasters] {
        &self.shadow_casters
    }

    #[must_use]
    pub fn reflection_maps(&self) -> &ReflectionMapManager {
        &self.reflection_maps
    }

    pub(crate) fn reflection_maps_mut(&mut self) -> &mut ReflectionMapManager {
        &mut self.reflection_maps
    }

    #[must_use]
    pub fn features(&self) -> ShaderFeatures {
        self.features
    }

    #[must_use]
    pub fn tonemap(&self) -> TonemapMode {
        self.tonemap
    }

    #[must_use]
    pub fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    /// Shader keys computed from scratch over the layer's lifetime.
    #[must_use]
    pub fn keys_resolved(&self) -> u64 {
        self.keys_resolved
    }
}

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
pub(super) struct GatheredNodes {
    pub(super) cameras: Vec<NodeId>,
    pub(super) lights: Vec<NodeId>,
    pub(super) renderables: Vec<NodeId>,
    pub(super) probes: Vec<NodeId>,
}

/// Active nodes under `layer`, including an imported scene, in
/// depth-first order.
pub(super) fn gather_layer(scene: &SceneGraph, layer: NodeId) -> GatheredNodes {
    let mut out = GatheredNodes::default();
    let mut visited: SmallVec<[NodeId; 2]> = SmallVec::new();
    let mut stack: Vec<NodeId> = scene.children(layer).iter().rev().copied().collect();

    while let Some(id) = stack.pop() {
        let Some(node) = scene.node(id) else { continue };
        if !node.is_active() {
            continue;
        }
        match node.kind() {
            NodeKind::Camera(_) => out.cameras.push(id),
            NodeKind::Light(_) => out.lights.push(id),
            NodeKind::Model(_) | NodeKind::Particles(_) | NodeKind::Item2D(_) => out.renderables.push(id),
            NodeKind::ReflectionProbe(_) => out.probes.push(id),
            NodeKind::ImportedScene { root } => {
                if !visited.contains(root) {
                    visited.push(*root);
                    stack.push(*root);
                }
            }
            // Nested layers are prepared on their own.
            NodeKind::Layer(_) => continue,
            NodeKind::Group => {}
        }
        stack.extend(node.children().iter().rev());
    }
    out
}

/// Level of detail for one subset: 0 is the subset itself, `i + 1` is
/// `lods[i]`. Coarser levels are taken while their projected size stays
/// under the camera's pixel threshold.
fn select_lod(
    camera: &Camera,
    lods: &[MeshLod],
    world_bounds: &Aabb,
    world: &Affine3A,
    bias: f32,
    surface_width: u32,
) -> usize {
    if lods.is_empty() || bias <= 0.0 || camera.lod_pixel_threshold <= 0.0 || surface_width == 0 {
        return 0;
    }
    let size_threshold = camera.lod_pixel_threshold / surface_width as f32;
    let distance = match camera.projection_type {
        ProjectionType::Perspective => {
            let forward = camera.forward();
            let near = (world_bounds.support(-forward) - camera.position()).dot(forward);
            let far = (world_bounds.support(forward) - camera.position()).dot(forward);
            if near * far < 0.0 {
                0.0
            } else if near >= 0.0 {
                near
            } else {
                -far
            }
        }
        ProjectionType::Orthographic => 1.0,
    };
    let threshold = camera.lod_threshold(distance);
    let m = world.matrix3;
    let scale = m.x_axis.length().max(m.y_axis.length()).max(m.z_axis.length());

    let mut selected = 0;
    for (i, lod) in lods.iter().enumerate() {
        // A zero threshold (camera inside the bounds) keeps full detail.
        let screen_size = lod.distance * scale / bias / threshold;
        if screen_size.is_nan() || screen_size > size_threshold {
            break;
        }
        selected = i + 1;
    }
    selected
}

/// World matrix a renderable draws with; 2D items are scaled to their size.
pub(super) fn renderable_world(node: &Node) -> Affine3A {
    let world = *node.world_matrix();
    match node.kind() {
        NodeKind::Item2D(item) => world * Affine3A::from_scale(item.size.extend(1.0)),
        _ => world,
    }
}

fn resolve_camera_node(scene: &SceneGraph, layer: NodeId, found: &[NodeId]) -> Option<NodeId> {
    let explicit = scene
        .node(layer)
        .and_then(|n| n.as_layer())
        .and_then(|l| l.explicit_camera);
    if let Some(id) = explicit {
        return scene
            .node(id)
            .filter(|n| n.as_camera().is_some() && n.is_active())
            .map(|_| id);
    }
    found.first().copied()
}

/// Highest ancestor of `layer` that needs a globals update, so the
/// traversal seeds from valid parent values.
fn dirty_update_root(scene: &SceneGraph, layer: NodeId) -> NodeId {
    let mut root = layer;
    let mut current = scene.node(layer).and_then(|n| n.parent());
    while let Some(id) = current {
        let Some(node) = scene.node(id) else { break };
        if node.flags().intersects(NodeFlags::GLOBAL_VALUES_DIRTY) {
            root = id;
        }
        current = node.parent();
    }
    root
}

fn layer_features(scene: &SceneGraph, layer: NodeId, settings: &RendererSettings) -> ShaderFeatures {
    let mut features = ShaderFeatures::empty();
    if let Some(l) = scene.node(layer).and_then(|n| n.as_layer()) {
        features.set(ShaderFeatures::IBL, l.light_probe.is_some());
        features.set(ShaderFeatures::FOG, l.fog);
        features.set(ShaderFeatures::SSAO, l.ssao);
        features.set(ShaderFeatures::DEPTH_PRE_PASS, l.depth_pre_pass);
    }
    features.set(
        ShaderFeatures::LINEAR_OUTPUT,
        settings.output_color_space == OutputColorSpace::Linear,
    );
    features
}

fn shadow_mode_for(
    light: &Light,
    technique: ShadowTechnique,
    float_targets: bool,
    cube_targets: bool,
) -> Option<ShadowMode> {
    match light.kind {
        LightKind::Point { .. } => {
            if cube_targets {
                Some(ShadowMode::Cube)
            } else {
                log::warn!("Backend lacks cube render targets; point light shadows disabled");
                None
            }
        }
        LightKind::Directional | LightKind::Spot { .. } => match technique {
            ShadowTechnique::Vsm if float_targets => Some(ShadowMode::Vsm),
            ShadowTechnique::Vsm => {
                log::debug!("No float render targets; VSM falls back to PCF");
                Some(ShadowMode::Pcf)
            }
            ShadowTechnique::Pcf => Some(ShadowMode::Pcf),
        },
    }
}

/// Snapshot of every image referenced by the gathered renderables. Reading
/// the UV transform may recompute it, so this runs before the immutable
/// collection pass.
/// Resolves every image the renderables sample. Dirty images are pushed to
/// `changed`; they stay dirty until the next frame begins.
fn collect_images(
    scene: &mut SceneGraph,
    renderables: &[NodeId],
    changed: &mut Vec<ImageId>,
) -> FxHashMap<ImageId, ImageInfo> {
    let mut ids: FxHashSet<ImageId> = FxHashSet::default();
    for &node in renderables {
        let Some(model) = scene.node(node).and_then(|n| n.as_renderable()) else { continue };
        for &material in &model.materials {
            if let Some(material) = scene.material(material) {
                ids.extend(material.maps.iter().flatten().map(|m| m.image));
            }
        }
    }

    let mut images = FxHashMap::default();
    let raw = scene.images_raw_mut();
    for id in ids {
        let Some(image) = raw.get_mut(id) else { continue };
        if image.is_dirty() {
            // The transform flag is consumed below; keep the change visible
            // to later layers through DIRTY.
            image.mark_dirty();
            changed.push(id);
        }
        let transform = image.texture_transform();
        images.insert(
            id,
            ImageInfo {
                source: image.source().clone(),
                mip_mode: image.mip_mode,
                transform,
                state: MapKeyState {
                    env_map: image.mapping == MappingMode::Environment,
                    light_probe: image.mapping == MappingMode::LightProbe,
                    invert_uv: false,
                    premultiplied: image.premultiplied_alpha,
                    identity_transform: transform.abs_diff_eq(Mat3::IDENTITY, 1e-6),
                },
            },
        );
    }
    images
}

fn material_index(id: MaterialId) -> u32 {
    (id.data().as_ffi() & 0xF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_key_depth_major() {
        let near = RenderKey::opaque(1.0, 0x3FFF, 0xF_FFFF);
        let far = RenderKey::opaque(2.0, 0, 0);
        assert!(near < far);
    }

    #[test]
    fn test_render_key_groups_equal_depth_by_shader() {
        let a = RenderKey::opaque(5.0, 1, 9);
        let b = RenderKey::opaque(5.0, 2, 0);
        assert!(a < b);
        assert_eq!(RenderKey::opaque(-3.0, 0, 0).bits(), 0);
    }

    #[test]
    fn test_pcf_fallback_without_float_targets() {
        let light = Light::new_directional(Vec3::ONE, 1.0);
        assert_eq!(
            shadow_mode_for(&light, ShadowTechnique::Vsm, false, true),
            Some(ShadowMode::Pcf)
        );
        let point = Light::new_point(Vec3::ONE, 1.0, 10.0);
        assert_eq!(shadow_mode_for(&point, ShadowTechnique::Vsm, true, false), None);
    }

    fn lod_camera() -> Camera {
        let mut camera = Camera::new_perspective(90.0, 0.1, 500.0);
        assert!(camera.update(&Affine3A::IDENTITY, 1.0));
        camera
    }

    fn unit_box_at(z: f32) -> Aabb {
        Aabb::new(Vec3::new(-0.5, -0.5, z - 0.5), Vec3::new(0.5, 0.5, z + 0.5))
    }

    #[test]
    fn test_lod_coarsens_with_distance() {
        let camera = lod_camera();
        let lods = [
            MeshLod { offset: 0, count: 3, distance: 0.05 },
            MeshLod { offset: 3, count: 3, distance: 0.2 },
        ];
        let world = Affine3A::IDENTITY;
        assert_eq!(select_lod(&camera, &lods, &unit_box_at(-100.5), &world, 1.0, 1000), 1);
        assert_eq!(select_lod(&camera, &lods, &unit_box_at(-400.5), &world, 1.0, 1000), 2);
        assert_eq!(select_lod(&camera, &lods, &unit_box_at(-10.5), &world, 1.0, 1000), 0);
        // Camera inside the bounds.
        assert_eq!(select_lod(&camera, &lods, &unit_box_at(0.0), &world, 1.0, 1000), 0);
    }

    #[test]
    fn test_lod_bias_and_threshold() {
        let mut camera = lod_camera();
        let lods = [MeshLod { offset: 0, count: 3, distance: 0.05 }];
        let far = unit_box_at(-100.5);
        let world = Affine3A::IDENTITY;
        assert_eq!(select_lod(&camera, &lods, &far, &world, 1.0, 1000), 1);
        assert_eq!(select_lod(&camera, &lods, &far, &world, 0.0, 1000), 0);
        assert_eq!(select_lod(&camera, &lods, &far, &world, 0.25, 1000), 0);
        // Scaling the object up counts as a larger projected size.
        let scaled = Affine3A::from_scale(Vec3::splat(4.0));
        assert_eq!(select_lod(&camera, &lods, &far, &scaled, 1.0, 1000), 0);
        camera.lod_pixel_threshold = 0.0;
        assert_eq!(select_lod(&camera, &lods, &far, &world, 1.0, 1000), 0);
    }
}
