//! Scene Preparation Tests
//!
//! Tests for:
//! - Hierarchical transform propagation and its idempotence
//! - Dirty flag clearing by the preparation pass
//! - Prepare results for material, texture data and image edits
//! - Clean subtrees skipped by the globals pass
//! - Shared material invalidation (once per edit, never missed)
//! - Opaque front-to-back and transparent back-to-front ordering
//! - Light exclusion and scoping

use std::sync::Arc;

use glam::{Vec2, Vec3, Vec4};

use lumen::hal::HeadlessBackend;
use lumen::resources::{ImageData, MemoryAssetProvider};
use lumen::scene::{
    Camera, Image, Layer, Light, MapSlot, Material, MaterialId, MaterialKind, MeshSource, Model, Node,
    NodeFlags, NodeId, NodeKind, SceneGraph, TextureChannel, TextureSource, Transform,
};
use lumen::settings::RendererSettings;
use lumen::{RenderContext, Renderer};

// ============================================================================
// Helpers
// ============================================================================

const EPSILON: f32 = 1e-5;
const SIZE: (u32, u32) = (64, 64);

fn vec3_approx(a: Vec3, b: Vec3) -> bool {
    (a - b).abs().max_element() < EPSILON
}

fn renderer() -> Renderer {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = RenderContext::new(
        Box::new(HeadlessBackend::new()),
        Arc::new(MemoryAssetProvider::new()),
        RendererSettings::default(),
    );
    Renderer::new(ctx)
}

fn scene_with_layer() -> (SceneGraph, NodeId) {
    let mut scene = SceneGraph::new();
    let layer = scene.add_node(None, Node::new(NodeKind::Layer(Layer::new())));
    scene.add_node(
        Some(layer),
        Node::new(NodeKind::Camera(Camera::new_perspective(60.0, 0.1, 100.0))),
    );
    (scene, layer)
}

fn add_model(scene: &mut SceneGraph, parent: NodeId, material: MaterialId, position: Vec3) -> NodeId {
    let model = Model::new(MeshSource::Path("#Cube".into())).with_material(material);
    scene.add_node(
        Some(parent),
        Node::new(NodeKind::Model(model)).with_transform(Transform::from_position(position)),
    )
}

/// Runs begin, prepare and end for one frame; returns the prepare result.
fn prepare_frame(renderer: &mut Renderer, scene: &mut SceneGraph, layer: NodeId) -> bool {
    renderer.begin_frame(scene, layer).unwrap();
    let dirty = renderer.prepare_layer_for_render(scene, layer, SIZE).unwrap();
    renderer.end_frame(layer).unwrap();
    dirty
}

fn world_position(scene: &SceneGraph, id: NodeId) -> Vec3 {
    scene.world_matrix(id).unwrap().translation.into()
}

// ============================================================================
// Transform Propagation
// ============================================================================

#[test]
fn parent_move_updates_descendants() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let parent = scene.add_node(
        Some(layer),
        Node::group().with_transform(Transform::from_position(Vec3::new(1.0, 0.0, 0.0))),
    );
    let material = scene.add_material(Material::principled());
    let child = add_model(&mut scene, parent, material, Vec3::new(0.0, 0.0, -5.0));

    prepare_frame(&mut renderer, &mut scene, layer);
    assert!(vec3_approx(world_position(&scene, child), Vec3::new(1.0, 0.0, -5.0)));

    scene.transform_mut(parent).unwrap().position = Vec3::new(2.0, 0.0, 0.0);
    assert!(scene.node(parent).unwrap().is_dirty(NodeFlags::TRANSFORM_DIRTY));

    prepare_frame(&mut renderer, &mut scene, layer);
    assert!(vec3_approx(world_position(&scene, child), Vec3::new(2.0, 0.0, -5.0)));
    assert!(!scene.node(parent).unwrap().is_dirty(NodeFlags::TRANSFORM_DIRTY));
    assert!(!scene.node(child).unwrap().is_dirty(NodeFlags::TRANSFORM_DIRTY));
}

#[test]
fn second_pass_without_mutation_is_idempotent() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let material = scene.add_material(Material::principled());
    let cube = add_model(&mut scene, layer, material, Vec3::new(0.5, 0.0, -5.0));

    assert!(prepare_frame(&mut renderer, &mut scene, layer));
    let first = *scene.world_matrix(cube).unwrap();

    assert!(!prepare_frame(&mut renderer, &mut scene, layer));
    assert_eq!(*scene.world_matrix(cube).unwrap(), first);
}

#[test]
fn renderable_world_matches_node_world() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let material = scene.add_material(Material::principled());
    let cube = add_model(&mut scene, layer, material, Vec3::new(0.0, 1.0, -5.0));

    prepare_frame(&mut renderer, &mut scene, layer);

    let data = renderer.layer_data(layer).unwrap();
    let object = data.renderable_objects().next().unwrap();
    assert_eq!(object.node, cube);
    assert!(vec3_approx(object.world.translation.into(), Vec3::new(0.0, 1.0, -5.0)));
}

#[test]
fn clean_sibling_subtree_is_not_recomputed() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let material = scene.add_material(Material::principled());
    let moved = scene.add_node(Some(layer), Node::group());
    let still = scene.add_node(Some(layer), Node::group());
    let child = add_model(&mut scene, moved, material, Vec3::new(0.0, 0.0, -5.0));
    for x in [-1.0, 0.0, 1.0] {
        add_model(&mut scene, still, material, Vec3::new(x, 0.0, -5.0));
    }
    prepare_frame(&mut renderer, &mut scene, layer);

    scene.transform_mut(child).unwrap().position = Vec3::new(0.0, 2.0, -5.0);
    assert_eq!(scene.update_globals(layer), 1);
    assert!(vec3_approx(world_position(&scene, child), Vec3::new(0.0, 2.0, -5.0)));
    assert!(!scene.node(layer).unwrap().is_dirty(NodeFlags::SUB_NODE_DIRTY));
    assert_eq!(scene.update_globals(layer), 0);
}

// ============================================================================
// Edits Outside the Node Tree
// ============================================================================

#[test]
fn material_edit_marks_prepare_dirty() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let material = scene.add_material(Material::principled());
    add_model(&mut scene, layer, material, Vec3::new(0.0, 0.0, -5.0));
    prepare_frame(&mut renderer, &mut scene, layer);
    assert!(!prepare_frame(&mut renderer, &mut scene, layer));

    scene.material_mut(material).unwrap().opacity = 0.8;
    assert!(prepare_frame(&mut renderer, &mut scene, layer));
    assert!(!prepare_frame(&mut renderer, &mut scene, layer));
}

fn textured_data_scene() -> (SceneGraph, NodeId, lumen::scene::TextureDataId, lumen::scene::ImageId) {
    let (mut scene, layer) = scene_with_layer();
    let data = scene.add_texture_data(ImageData::solid(4, 4, [255, 255, 255, 255]));
    let image = scene.add_image(Image::new(TextureSource::Data(data)));
    let material = scene.add_material(
        Material::principled().with_map(MapSlot::BaseColor, image, TextureChannel::R),
    );
    add_model(&mut scene, layer, material, Vec3::new(0.0, 0.0, -5.0));
    (scene, layer, data, image)
}

#[test]
fn texture_data_edit_marks_prepare_dirty() {
    let mut renderer = renderer();
    let (mut scene, layer, data, _) = textured_data_scene();
    assert!(prepare_frame(&mut renderer, &mut scene, layer));
    assert!(!prepare_frame(&mut renderer, &mut scene, layer));

    scene.texture_data_mut(data).unwrap().pixels.fill(128);
    assert!(prepare_frame(&mut renderer, &mut scene, layer));
    assert!(!prepare_frame(&mut renderer, &mut scene, layer));
}

#[test]
fn image_edits_mark_prepare_dirty() {
    let mut renderer = renderer();
    let (mut scene, layer, _, image) = textured_data_scene();
    prepare_frame(&mut renderer, &mut scene, layer);
    assert!(!prepare_frame(&mut renderer, &mut scene, layer));
    assert!(!scene.image(image).unwrap().is_dirty());

    scene.image_mut(image).unwrap().set_scale(Vec2::splat(2.0));
    assert!(prepare_frame(&mut renderer, &mut scene, layer));
    let transform = renderer.layer_data(layer).unwrap().objects()[0].map_transforms[MapSlot::BaseColor.index()];
    assert!(vec3_approx(transform.x_axis, Vec3::new(2.0, 0.0, 0.0)));
    assert!(!prepare_frame(&mut renderer, &mut scene, layer));

    scene.image_mut(image).unwrap().set_source(TextureSource::Path("missing.png".into()));
    assert!(prepare_frame(&mut renderer, &mut scene, layer));
    let map = renderer.layer_data(layer).unwrap().objects()[0].maps[MapSlot::BaseColor.index()];
    assert_eq!(map, renderer.context().buffers().placeholder_texture());
    assert!(!prepare_frame(&mut renderer, &mut scene, layer));
    assert!(!scene.image(image).unwrap().is_dirty());
}

// ============================================================================
// Material Invalidation
// ============================================================================

fn invalidated(renderer: &Renderer, layer: NodeId) -> Vec<bool> {
    renderer
        .layer_data(layer)
        .unwrap()
        .objects()
        .iter()
        .map(|o| o.material_invalidated)
        .collect()
}

#[test]
fn shared_material_edit_invalidates_every_user_once() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let material = scene.add_material(Material::principled());
    add_model(&mut scene, layer, material, Vec3::new(-1.0, 0.0, -5.0));
    add_model(&mut scene, layer, material, Vec3::new(1.0, 0.0, -5.0));

    prepare_frame(&mut renderer, &mut scene, layer);
    prepare_frame(&mut renderer, &mut scene, layer);
    assert_eq!(invalidated(&renderer, layer), vec![false, false]);

    if let MaterialKind::Principled(params) = &mut scene.material_mut(material).unwrap().kind {
        params.base_color = Vec4::new(1.0, 0.0, 0.0, 1.0);
    }

    // Both users see the edit in the frame it happens.
    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap();
    assert_eq!(invalidated(&renderer, layer), vec![true, true]);

    // A repeated prepare in the same frame does no further work.
    assert!(!renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap());
    renderer.end_frame(layer).unwrap();

    // The edit is consumed; the next frame is clean.
    prepare_frame(&mut renderer, &mut scene, layer);
    assert_eq!(invalidated(&renderer, layer), vec![false, false]);
    assert!(!scene.material(material).unwrap().is_dirty());
}

#[test]
fn unrelated_material_is_not_invalidated() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let edited = scene.add_material(Material::principled());
    let untouched = scene.add_material(Material::principled());
    add_model(&mut scene, layer, edited, Vec3::new(-1.0, 0.0, -5.0));
    add_model(&mut scene, layer, untouched, Vec3::new(1.0, 0.0, -5.0));
    prepare_frame(&mut renderer, &mut scene, layer);
    prepare_frame(&mut renderer, &mut scene, layer);

    scene.material_mut(edited).unwrap().opacity = 0.9;
    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap();

    let data = renderer.layer_data(layer).unwrap();
    for object in data.objects() {
        assert_eq!(object.material_invalidated, object.material == edited);
    }
    renderer.end_frame(layer).unwrap();
}

// ============================================================================
// Draw Order
// ============================================================================

#[test]
fn opaque_front_to_back() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    for z in [-8.0, -3.0, -5.0] {
        let material = scene.add_material(Material::principled());
        add_model(&mut scene, layer, material, Vec3::new(0.0, 0.0, z));
    }

    prepare_frame(&mut renderer, &mut scene, layer);

    let depths: Vec<f32> = renderer
        .layer_data(layer)
        .unwrap()
        .opaque_objects()
        .map(|o| o.depth)
        .collect();
    assert_eq!(depths.len(), 3);
    assert!(depths.windows(2).all(|w| w[0] <= w[1]), "{depths:?}");
}

#[test]
fn transparent_back_to_front() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    for z in [-3.0, -8.0, -5.0] {
        let material = scene.add_material(Material::principled().with_opacity(0.5));
        add_model(&mut scene, layer, material, Vec3::new(0.0, 0.0, z));
    }

    prepare_frame(&mut renderer, &mut scene, layer);

    let data = renderer.layer_data(layer).unwrap();
    assert_eq!(data.opaque_objects().count(), 0);
    let depths: Vec<f32> = data.transparent_objects().map(|o| o.depth).collect();
    assert_eq!(depths.len(), 3);
    assert!(depths.windows(2).all(|w| w[0] > w[1]), "{depths:?}");
}

#[test]
fn objects_behind_camera_are_culled() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let material = scene.add_material(Material::principled());
    add_model(&mut scene, layer, material, Vec3::new(0.0, 0.0, -5.0));
    add_model(&mut scene, layer, material, Vec3::new(0.0, 0.0, 20.0));

    prepare_frame(&mut renderer, &mut scene, layer);

    let data = renderer.layer_data(layer).unwrap();
    assert_eq!(data.renderable_count(), 1);
    // Culled objects stay in the graph.
    assert_eq!(scene.node_count(), 4);
}

// ============================================================================
// Lights
// ============================================================================

#[test]
fn excluded_light_does_not_reach_object() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let sun = scene.add_node(
        Some(layer),
        Node::new(NodeKind::Light(Light::new_directional(Vec3::ONE, 1.0))),
    );
    scene.add_node(
        Some(layer),
        Node::new(NodeKind::Light(Light::new_point(Vec3::ONE, 1.0, 50.0))),
    );
    let material = scene.add_material(Material::principled());
    let mut model = Model::new(MeshSource::Path("#Cube".into())).with_material(material);
    model.excluded_lights.push(sun);
    scene.add_node(
        Some(layer),
        Node::new(NodeKind::Model(model)).with_transform(Transform::from_position(Vec3::new(0.0, 0.0, -5.0))),
    );

    prepare_frame(&mut renderer, &mut scene, layer);

    let data = renderer.layer_data(layer).unwrap();
    let object = data.renderable_objects().next().unwrap();
    assert_eq!(object.lights.len(), 1);
    let light = &data.lights()[object.lights[0] as usize];
    assert_ne!(light.node, sun);
}

#[test]
fn disabled_light_is_ignored() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    scene.add_node(
        Some(layer),
        Node::new(NodeKind::Light(Light::new_directional(Vec3::ONE, 0.0))),
    );
    let material = scene.add_material(Material::principled());
    add_model(&mut scene, layer, material, Vec3::new(0.0, 0.0, -5.0));

    prepare_frame(&mut renderer, &mut scene, layer);

    let data = renderer.layer_data(layer).unwrap();
    assert!(data.lights().is_empty());
    assert!(data.renderable_objects().next().unwrap().lights.is_empty());
}
