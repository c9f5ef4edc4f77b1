//! Resource Tests
//!
//! Tests for:
//! - Mesh cache identity and user tracking
//! - Eviction of unreferenced GPU resources at frame end
//! - Eviction after a node switches mesh or its texture data changes shape
//! - Shader key equality across materials with different images
//! - Settings loading from JSON

use std::sync::Arc;

use glam::Vec3;

use lumen::hal::{HeadlessBackend, RenderBackend, TextureDesc};
use lumen::resources::{ImageData, MemoryAssetProvider};
use lumen::scene::{
    Camera, Image, Layer, MapSlot, Material, MeshSource, Model, Node, NodeId, NodeKind, SceneGraph,
    TextureChannel, TextureSource, Transform,
};
use lumen::settings::{RendererSettings, ShadowTechnique, TonemapMode};
use lumen::{RenderContext, Renderer};

// ============================================================================
// Helpers
// ============================================================================

const SIZE: (u32, u32) = (64, 64);

fn renderer_with(provider: Arc<MemoryAssetProvider>) -> Renderer {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = RenderContext::new(
        Box::new(HeadlessBackend::new()),
        provider,
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

fn add_cube(scene: &mut SceneGraph, layer: NodeId, material: Material, x: f32) -> NodeId {
    let material = scene.add_material(material);
    let model = Model::new(MeshSource::Path("#Cube".into())).with_material(material);
    scene.add_node(
        Some(layer),
        Node::new(NodeKind::Model(model)).with_transform(Transform::from_position(Vec3::new(x, 0.0, -5.0))),
    )
}

fn prepare_frame(renderer: &mut Renderer, scene: &mut SceneGraph, layer: NodeId) {
    renderer.begin_frame(scene, layer).unwrap();
    renderer.prepare_layer_for_render(scene, layer, SIZE).unwrap();
    renderer.end_frame(layer).unwrap();
}

// ============================================================================
// Mesh Cache
// ============================================================================

#[test]
fn same_mesh_source_shares_one_gpu_mesh() {
    let mut renderer = renderer_with(Arc::new(MemoryAssetProvider::new()));
    let (mut scene, layer) = scene_with_layer();
    add_cube(&mut scene, layer, Material::principled(), -1.0);
    add_cube(&mut scene, layer, Material::principled(), 1.0);

    prepare_frame(&mut renderer, &mut scene, layer);

    let data = renderer.layer_data(layer).unwrap();
    let objects = data.objects();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].mesh, objects[1].mesh);

    let buffers = renderer.context().buffers();
    assert_eq!(buffers.mesh_count(), 1);
    assert_eq!(buffers.mesh_users(objects[0].mesh), 2);
}

#[test]
fn removed_users_release_mesh_at_frame_end() {
    let mut renderer = renderer_with(Arc::new(MemoryAssetProvider::new()));
    let (mut scene, layer) = scene_with_layer();
    let a = add_cube(&mut scene, layer, Material::principled(), -1.0);
    let b = add_cube(&mut scene, layer, Material::principled(), 1.0);
    prepare_frame(&mut renderer, &mut scene, layer);
    let mesh = renderer.layer_data(layer).unwrap().objects()[0].mesh;

    let mut removed = scene.remove_node(a);
    renderer.cleanup_resources(&scene, &removed);
    assert_eq!(renderer.context().buffers().mesh_users(mesh), 1);

    removed = scene.remove_node(b);
    renderer.cleanup_resources(&scene, &removed);
    // Still cached until the frame ends.
    assert_eq!(renderer.context().buffers().mesh_count(), 1);

    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.end_frame(layer).unwrap();
    assert_eq!(renderer.context().buffers().mesh_count(), 0);
}

#[test]
fn missing_mesh_renders_nothing() {
    let mut renderer = renderer_with(Arc::new(MemoryAssetProvider::new()));
    let (mut scene, layer) = scene_with_layer();
    let material = scene.add_material(Material::principled());
    let model = Model::new(MeshSource::Path("missing.mesh".into())).with_material(material);
    scene.add_node(
        Some(layer),
        Node::new(NodeKind::Model(model)).with_transform(Transform::from_position(Vec3::new(0.0, 0.0, -5.0))),
    );

    let format = renderer.settings().color_format;
    let target = renderer
        .context_mut()
        .backend_mut()
        .create_texture(&TextureDesc::d2("target", SIZE.0, SIZE.1, format, wgpu::TextureUsages::RENDER_ATTACHMENT))
        .unwrap();

    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap();
    assert!(renderer.layer_data(layer).unwrap().objects().is_empty());
    // The placeholder stays cached so the failed load is not retried.
    assert_eq!(renderer.context().buffers().mesh_count(), 1);

    renderer.rhi_prepare(&scene, layer).unwrap();
    renderer.render_layer(&scene, layer, target).unwrap();
    renderer.end_frame(layer).unwrap();
    assert_eq!(renderer.context().backend_as::<HeadlessBackend>().unwrap().draw_count(), 0);
}

#[test]
fn switching_mesh_source_evicts_old_mesh() {
    let mut renderer = renderer_with(Arc::new(MemoryAssetProvider::new()));
    let (mut scene, layer) = scene_with_layer();
    let node = add_cube(&mut scene, layer, Material::principled(), 0.0);
    prepare_frame(&mut renderer, &mut scene, layer);
    let cube = renderer.layer_data(layer).unwrap().objects()[0].mesh;

    scene.node_mut(node).unwrap().as_renderable_mut().unwrap().mesh = MeshSource::Path("#Sphere".into());
    prepare_frame(&mut renderer, &mut scene, layer);

    let sphere = renderer.layer_data(layer).unwrap().objects()[0].mesh;
    let buffers = renderer.context().buffers();
    assert_ne!(cube, sphere);
    assert!(buffers.mesh(cube).is_none());
    assert_eq!(buffers.mesh_count(), 1);
    assert_eq!(buffers.mesh_users(sphere), 1);
}

#[test]
fn shared_texture_data_shape_change_evicts_old_texture() {
    let mut renderer = renderer_with(Arc::new(MemoryAssetProvider::new()));
    let (mut scene, layer) = scene_with_layer();
    let data = scene.add_texture_data(ImageData::solid(4, 4, [255, 0, 0, 255]));
    let image = scene.add_image(Image::new(TextureSource::Data(data)));
    for x in [-1.0, 1.0] {
        let material = Material::principled().with_map(MapSlot::BaseColor, image, TextureChannel::R);
        add_cube(&mut scene, layer, material, x);
    }

    prepare_frame(&mut renderer, &mut scene, layer);
    let slot = MapSlot::BaseColor.index();
    let old = renderer.layer_data(layer).unwrap().objects()[0].maps[slot].unwrap();
    assert_eq!(renderer.context().buffers().texture_users(old), 2);

    *scene.texture_data_mut(data).unwrap() = ImageData::solid(8, 8, [0, 255, 0, 255]);
    prepare_frame(&mut renderer, &mut scene, layer);

    let objects = renderer.layer_data(layer).unwrap().objects();
    let new = objects[0].maps[slot].unwrap();
    assert_eq!(objects[1].maps[slot], Some(new));
    let buffers = renderer.context().buffers();
    assert!(buffers.texture(old).is_none());
    assert_eq!(buffers.texture(new).unwrap().width, 8);
    assert_eq!(buffers.texture_users(new), 2);
    // Placeholder plus the live texture.
    assert_eq!(buffers.texture_count(), 2);
}

// ============================================================================
// Shader Keys
// ============================================================================

fn textured(scene: &mut SceneGraph, path: &str) -> Material {
    let image = scene.add_image(Image::from_path(path));
    Material::principled().with_map(MapSlot::BaseColor, image, TextureChannel::R)
}

#[test]
fn different_images_share_shader_key_and_pipeline() {
    let provider = Arc::new(MemoryAssetProvider::new());
    provider.insert_image("a.png", ImageData::solid(4, 4, [255, 0, 0, 255]));
    provider.insert_image("b.png", ImageData::solid(4, 4, [0, 0, 255, 255]));
    let mut renderer = renderer_with(provider);
    let (mut scene, layer) = scene_with_layer();

    let a = textured(&mut scene, "a.png");
    let b = textured(&mut scene, "b.png");
    add_cube(&mut scene, layer, a, -1.0);
    add_cube(&mut scene, layer, b, 1.0);

    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap();
    renderer.rhi_prepare(&scene, layer).unwrap();

    let objects = renderer.layer_data(layer).unwrap().objects();
    assert_ne!(objects[0].maps[MapSlot::BaseColor.index()], objects[1].maps[MapSlot::BaseColor.index()]);
    assert_eq!(objects[0].shader_key, objects[1].shader_key);
    assert_eq!(renderer.context().shaders().stats().pipeline_count, 1);
    renderer.end_frame(layer).unwrap();
}

#[test]
fn map_presence_changes_shader_key() {
    let provider = Arc::new(MemoryAssetProvider::new());
    provider.insert_image("a.png", ImageData::solid(4, 4, [255, 255, 255, 255]));
    let mut renderer = renderer_with(provider);
    let (mut scene, layer) = scene_with_layer();

    let with_map = textured(&mut scene, "a.png");
    add_cube(&mut scene, layer, with_map, -1.0);
    add_cube(&mut scene, layer, Material::principled(), 1.0);

    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap();
    renderer.rhi_prepare(&scene, layer).unwrap();

    let objects = renderer.layer_data(layer).unwrap().objects();
    assert_ne!(objects[0].shader_key, objects[1].shader_key);
    assert_eq!(renderer.context().shaders().stats().pipeline_count, 2);
    renderer.end_frame(layer).unwrap();
}

#[test]
fn pipelines_survive_across_frames() {
    let mut renderer = renderer_with(Arc::new(MemoryAssetProvider::new()));
    let (mut scene, layer) = scene_with_layer();
    add_cube(&mut scene, layer, Material::principled(), 0.0);

    for _ in 0..3 {
        renderer.begin_frame(&mut scene, layer).unwrap();
        renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap();
        renderer.rhi_prepare(&scene, layer).unwrap();
        renderer.end_frame(layer).unwrap();
    }

    let stats = renderer.context().shaders().stats();
    assert_eq!(stats.pipeline_count, 1);
    assert_eq!(stats.pipelines_created, 1);
}

// ============================================================================
// Settings
// ============================================================================

#[test]
fn settings_from_partial_json() {
    let settings = RendererSettings::from_json_str(
        r#"{ "shadow_map_size": 2048, "tonemap_mode": "Aces", "color_format": "rgba8unorm" }"#,
    )
    .unwrap();

    assert_eq!(settings.shadow_map_size, 2048);
    assert_eq!(settings.tonemap_mode, TonemapMode::Aces);
    assert_eq!(settings.color_format, wgpu::TextureFormat::Rgba8Unorm);
    assert_eq!(settings.shadow_technique, ShadowTechnique::Vsm);
    assert_eq!(settings.max_lights_per_object, RendererSettings::default().max_lights_per_object);
}

#[test]
fn settings_are_sanitized() {
    let settings =
        RendererSettings::from_json_str(r#"{ "shadow_map_size": 1000, "max_lights_per_object": 99 }"#)
            .unwrap();
    assert_eq!(settings.shadow_map_size, 1024);
    assert_eq!(settings.max_lights_per_object, lumen::settings::MAX_LIGHTS);
}

#[test]
fn unknown_format_is_rejected() {
    assert!(RendererSettings::from_json_str(r#"{ "depth_format": "d13" }"#).is_err());
}
