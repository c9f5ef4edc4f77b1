//! Renderer Tests
//!
//! Tests for:
//! - Frame lifecycle (nested begin/end, cleanup timing, submit)
//! - Layer preparation scenarios (lights, shadows, placeholders)
//! - GPU preparation and the recorded pass structure
//! - Effect chains and the final blit
//! - Render extensions and requested render results

use std::sync::Arc;

use glam::{Vec3, Vec4};
use parking_lot::Mutex;

use lumen::errors::{LumenError, Result};
use lumen::extensions::{FrameData, RenderExtension, RenderMode, RenderResult, RenderStage};
use lumen::hal::{BackendCommand, HeadlessBackend, RenderBackend, TextureDesc, TextureId};
use lumen::resources::MemoryAssetProvider;
use lumen::scene::{
    Camera, Effect, Image, Layer, Light, MapSlot, Material, MeshSource, Model, Node, NodeId,
    NodeKind, SceneGraph, TextureChannel, Transform,
};
use lumen::settings::RendererSettings;
use lumen::{RenderContext, Renderer};

// ============================================================================
// Helpers
// ============================================================================

const SIZE: (u32, u32) = (64, 64);

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

fn add_cube(scene: &mut SceneGraph, layer: NodeId, material: Material, z: f32) -> NodeId {
    let material = scene.add_material(material);
    let model = Model::new(MeshSource::Path("#Cube".into())).with_material(material);
    scene.add_node(
        Some(layer),
        Node::new(NodeKind::Model(model)).with_transform(Transform::from_position(Vec3::new(0.0, 0.0, z))),
    )
}

fn add_sun(scene: &mut SceneGraph, layer: NodeId, cast_shadow: bool) -> NodeId {
    let mut light = Light::new_directional(Vec3::ONE, 1.0);
    light.cast_shadow = cast_shadow;
    scene.add_node(Some(layer), Node::new(NodeKind::Light(light)))
}

fn target(renderer: &mut Renderer) -> TextureId {
    let format = renderer.settings().color_format;
    renderer
        .context_mut()
        .backend_mut()
        .create_texture(&TextureDesc::d2(
            "target",
            SIZE.0,
            SIZE.1,
            format,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        ))
        .unwrap()
}

/// One complete frame of `layer` into `target`.
fn render_frame(renderer: &mut Renderer, scene: &mut SceneGraph, layer: NodeId, target: TextureId) -> Result<()> {
    renderer.begin_frame(scene, layer)?;
    renderer.prepare_layer_for_render(scene, layer, SIZE)?;
    renderer.rhi_prepare(scene, layer)?;
    renderer.render_layer(scene, layer, target)?;
    renderer.end_frame(layer)
}

fn headless(renderer: &Renderer) -> &HeadlessBackend {
    renderer.context().backend_as::<HeadlessBackend>().unwrap()
}

fn pass_labels(backend: &HeadlessBackend) -> Vec<&'static str> {
    backend
        .commands()
        .iter()
        .filter_map(|c| match c {
            BackendCommand::BeginPass { label, .. } => Some(*label),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Frame Lifecycle
// ============================================================================

#[test]
fn nested_frames_clean_up_once_after_outermost_end() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();

    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.begin_frame(&mut scene, layer).unwrap();
    assert_eq!(renderer.frame_depth(), 2);

    renderer.end_frame(layer).unwrap();
    assert_eq!(renderer.frame_cleanups(), 0);
    assert_eq!(headless(&renderer).submit_count(), 0);

    renderer.end_frame(layer).unwrap();
    assert_eq!(renderer.frame_cleanups(), 1);
    assert_eq!(headless(&renderer).submit_count(), 1);
}

#[test]
fn end_frame_without_begin_is_an_error() {
    let mut renderer = renderer();
    let (_, layer) = scene_with_layer();
    assert!(matches!(renderer.end_frame(layer), Err(LumenError::FrameNotBegun)));
}

#[test]
fn prepare_outside_frame_is_an_error() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let result = renderer.prepare_layer_for_render(&mut scene, layer, SIZE);
    assert!(matches!(result, Err(LumenError::FrameNotBegun)));
}

#[test]
fn begin_frame_rejects_non_layer_nodes() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let group = scene.add_node(Some(layer), Node::group());
    assert!(matches!(
        renderer.begin_frame(&mut scene, group),
        Err(LumenError::NotALayer)
    ));
    assert_eq!(renderer.frame_depth(), 0);
}

#[test]
fn frame_index_advances_per_outermost_frame() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    for _ in 0..3 {
        renderer.begin_frame(&mut scene, layer).unwrap();
        renderer.end_frame(layer).unwrap();
    }
    assert_eq!(renderer.frame_index(), 3);
    assert_eq!(renderer.frame_cleanups(), 3);
}

// ============================================================================
// Preparation Scenarios
// ============================================================================

#[test]
fn directional_light_and_cube_without_shadow() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, false);
    add_cube(&mut scene, layer, Material::principled(), -5.0);

    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap();

    let data = renderer.layer_data(layer).unwrap();
    assert_eq!(data.renderable_count(), 1);
    let cube = data.renderable_objects().next().unwrap();
    assert_eq!(cube.lights.as_slice(), &[0]);
    assert!(data.shadow_maps().is_empty());

    renderer.end_frame(layer).unwrap();
}

#[test]
fn directional_light_and_cube_with_shadow() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, true);
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    let data = renderer.layer_data(layer).unwrap();
    assert_eq!(data.renderable_count(), 1);
    assert_eq!(data.shadow_maps().len(), 1);
    assert_eq!(renderer.stats().shadow_passes, 1);

    // Shadow pass runs before the layer pass.
    let labels = pass_labels(headless(&renderer));
    let shadow = labels.iter().position(|l| *l == "lumen.shadow").unwrap();
    let main = labels.iter().position(|l| *l == "lumen.layer").unwrap();
    assert!(shadow < main);
}

#[test]
fn missing_texture_uses_placeholder_and_renders() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, false);
    let image = scene.add_image(Image::from_path("textures/missing.png"));
    let material = Material::principled().with_map(MapSlot::BaseColor, image, TextureChannel::R);
    add_cube(&mut scene, layer, material, -5.0);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    let data = renderer.layer_data(layer).unwrap();
    let cube = data.renderable_objects().next().unwrap();
    let handle = cube.maps[MapSlot::BaseColor.index()].unwrap();
    assert!(renderer.context().buffers().is_placeholder(handle));
    assert_eq!(renderer.stats().draw_calls, 1);
}

#[test]
fn layer_without_camera_renders_nothing() {
    let mut renderer = renderer();
    let mut scene = SceneGraph::new();
    let layer = scene.add_node(None, Node::new(NodeKind::Layer(Layer::new())));
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    assert_eq!(renderer.layer_data(layer).unwrap().renderable_count(), 0);
    assert_eq!(headless(&renderer).draw_count(), 0);
}

#[test]
fn sibling_layers_are_prepared_together() {
    let mut renderer = renderer();
    let (mut scene, first) = scene_with_layer();
    let second = scene.add_node(None, Node::new(NodeKind::Layer(Layer::new())));

    renderer.begin_frame(&mut scene, first).unwrap();
    renderer.prepare_layer_for_render(&mut scene, first, SIZE).unwrap();
    assert!(renderer.layer_data(second).is_some());
    renderer.end_frame(first).unwrap();
}

// ============================================================================
// GPU Preparation
// ============================================================================

#[test]
fn rhi_prepare_twice_in_a_frame_is_a_no_op() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, true);
    add_cube(&mut scene, layer, Material::principled(), -5.0);

    renderer.begin_frame(&mut scene, layer).unwrap();
    renderer.prepare_layer_for_render(&mut scene, layer, SIZE).unwrap();
    renderer.rhi_prepare(&scene, layer).unwrap();
    let commands = headless(&renderer).commands().len();
    renderer.rhi_prepare(&scene, layer).unwrap();
    assert_eq!(headless(&renderer).commands().len(), commands);
    renderer.end_frame(layer).unwrap();
}

#[test]
fn draws_are_opaque_then_transparent() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, false);
    add_cube(&mut scene, layer, Material::principled().with_opacity(0.5), -4.0);
    add_cube(&mut scene, layer, Material::principled(), -6.0);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();
    assert_eq!(renderer.stats().draw_calls, 2);

    // Two distinct pipelines, opaque first.
    let backend = headless(&renderer);
    let pipelines: Vec<_> = backend
        .commands()
        .iter()
        .filter_map(|c| match c {
            BackendCommand::SetPipeline(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(pipelines.len(), 2);
    assert_ne!(pipelines[0], pipelines[1]);
}

#[test]
fn identical_frames_reuse_bind_groups() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, false);
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();
    assert!(renderer.stats().bind_groups_created > 0);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();
    assert_eq!(renderer.stats().bind_groups_created, 0);
}

#[test]
fn hidden_layer_issues_no_draws() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    scene
        .node_mut(layer)
        .unwrap()
        .as_layer_mut()
        .unwrap()
        .visible = false;
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();
    assert_eq!(headless(&renderer).draw_count(), 0);
}

#[test]
fn frame_textures_are_returned_to_the_pool() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    scene
        .node_mut(layer)
        .unwrap()
        .as_layer_mut()
        .unwrap()
        .depth_pre_pass = true;
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();
    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    // The depth texture and its attachment are reused, not recreated.
    assert_eq!(renderer.context().effect_pool().created_count(), 2);
}

// ============================================================================
// Effects
// ============================================================================

const INVERT_WGSL: &str = r"
fn effect_main(uv: vec2<f32>) -> vec4<f32> {
    let c = textureSampleLevel(input_texture, input_texture_sampler, uv, 0.0);
    return vec4<f32>(vec3<f32>(1.0) - c.rgb, c.a);
}
";

#[test]
fn effect_chain_renders_offscreen_and_blits() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, false);
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let effect = scene.add_effect(Effect::single_pass("invert", INVERT_WGSL));
    scene.layer_add_effect(layer, effect).unwrap();
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    assert_eq!(renderer.stats().effect_passes, 1);
    let labels = pass_labels(headless(&renderer));
    let offscreen = labels.iter().position(|l| *l == "lumen.layer.offscreen").unwrap();
    let main = labels.iter().position(|l| *l == "lumen.layer").unwrap();
    assert!(offscreen < main);

    // The layer pass holds the fullscreen blit only.
    let commands = headless(&renderer).commands();
    let begin = commands
        .iter()
        .rposition(|c| matches!(c, BackendCommand::BeginPass { label: "lumen.layer", .. }))
        .unwrap();
    let draws: Vec<_> = commands[begin..]
        .iter()
        .filter(|c| matches!(c, BackendCommand::Draw { .. } | BackendCommand::DrawIndexed { .. }))
        .collect();
    assert_eq!(draws.len(), 1);
    assert!(matches!(
        draws[0],
        BackendCommand::Draw { vertices, .. } if *vertices == (0..3)
    ));
}

#[test]
fn ssao_layer_renders_depth_and_ao() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    scene.node_mut(layer).unwrap().as_layer_mut().unwrap().ssao = true;
    add_sun(&mut scene, layer, false);
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    let labels = pass_labels(headless(&renderer));
    assert!(labels.contains(&"lumen.depth"));
    assert_eq!(renderer.stats().effect_passes, 1);
}

// ============================================================================
// Extensions
// ============================================================================

#[derive(Default)]
struct ExtensionLog {
    calls: Vec<&'static str>,
    depth_available: bool,
}

struct RecordingExtension {
    mode: RenderMode,
    stage: RenderStage,
    request: Option<RenderResult>,
    log: Arc<Mutex<ExtensionLog>>,
}

impl RenderExtension for RecordingExtension {
    fn stage(&self) -> RenderStage {
        self.stage
    }

    fn mode(&self) -> RenderMode {
        self.mode
    }

    fn prepare_data(&mut self, data: &mut FrameData) -> bool {
        self.log.lock().calls.push("prepare_data");
        if let Some(result) = self.request {
            data.request(result);
        }
        true
    }

    fn prepare_render(&mut self, data: &FrameData, _backend: &mut dyn RenderBackend) -> Result<()> {
        let mut log = self.log.lock();
        log.calls.push("prepare_render");
        log.depth_available = data.render_result(RenderResult::DepthTexture).is_some();
        Ok(())
    }

    fn render(&mut self, _data: &FrameData, backend: &mut dyn RenderBackend) -> Result<()> {
        let in_pass = backend.is_in_render_pass();
        self.log
            .lock()
            .calls
            .push(if in_pass { "render_in_pass" } else { "render_standalone" });
        Ok(())
    }

    fn reset_for_frame(&mut self) {
        self.log.lock().calls.push("reset");
    }
}

fn recording(mode: RenderMode, stage: RenderStage, request: Option<RenderResult>) -> (Box<RecordingExtension>, Arc<Mutex<ExtensionLog>>) {
    let log = Arc::new(Mutex::new(ExtensionLog::default()));
    let extension = Box::new(RecordingExtension {
        mode,
        stage,
        request,
        log: Arc::clone(&log),
    });
    (extension, log)
}

#[test]
fn main_extension_records_inside_layer_pass() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let (extension, log) = recording(RenderMode::Main, RenderStage::PostColor, None);
    renderer.add_extension(layer, extension);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    let log = log.lock();
    assert_eq!(
        log.calls,
        vec!["reset", "prepare_data", "prepare_render", "render_in_pass"]
    );
}

#[test]
fn standalone_extension_renders_during_prepare() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    let (extension, log) = recording(RenderMode::Standalone, RenderStage::PreColor, None);
    renderer.add_extension(layer, extension);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    let log = log.lock();
    assert_eq!(log.calls.last(), Some(&"render_standalone"));
    assert!(!log.calls.contains(&"render_in_pass"));
}

#[test]
fn requested_depth_texture_is_provided() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let (extension, log) = recording(
        RenderMode::Main,
        RenderStage::PreColor,
        Some(RenderResult::DepthTexture),
    );
    renderer.add_extension(layer, extension);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    assert!(log.lock().depth_available);
    let data = renderer.frame_data(layer).unwrap();
    assert!(data.is_requested(RenderResult::DepthTexture));
    assert!(data.render_result(RenderResult::DepthTexture).is_some());
}

#[test]
fn unrequested_results_stay_empty() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let target = target(&mut renderer);

    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    let data = renderer.frame_data(layer).unwrap();
    for result in RenderResult::ALL {
        assert!(data.render_result(result).is_none());
    }
    let labels = pass_labels(headless(&renderer));
    assert_eq!(labels, vec!["lumen.layer"]);
}

// ============================================================================
// Cleanup
// ============================================================================

#[test]
fn removed_layer_releases_its_targets() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, true);
    add_cube(&mut scene, layer, Material::principled(), -5.0);
    let target = target(&mut renderer);
    render_frame(&mut renderer, &mut scene, layer, target).unwrap();
    let before = headless(&renderer).live_textures();

    let removed = scene.remove_node(layer);
    renderer.cleanup_resources(&scene, &removed);

    assert!(renderer.layer_data(layer).is_none());
    assert!(headless(&renderer).live_textures() < before);
}

#[test]
fn release_resources_frees_everything_but_external_targets() {
    let mut renderer = renderer();
    let (mut scene, layer) = scene_with_layer();
    add_sun(&mut scene, layer, true);
    add_cube(&mut scene, layer, Material::principled().with_opacity(0.5), -5.0);
    scene
        .node_mut(layer)
        .unwrap()
        .as_layer_mut()
        .unwrap()
        .clear_color = Some(Vec4::new(0.2, 0.2, 0.2, 1.0));
    let target = target(&mut renderer);
    render_frame(&mut renderer, &mut scene, layer, target).unwrap();

    renderer.release_resources();

    let backend = headless(&renderer);
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.live_pipelines(), 0);
    // Only the caller's target survives.
    assert_eq!(backend.live_textures(), 1);
    assert!(backend.texture_exists(target));
}
