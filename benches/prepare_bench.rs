use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use glam::Vec3;

use lumen::hal::HeadlessBackend;
use lumen::resources::MemoryAssetProvider;
use lumen::scene::{
    Camera, Layer, Light, Material, MeshSource, Model, Node, NodeId, NodeKind, SceneGraph, Transform,
};
use lumen::settings::RendererSettings;
use lumen::{RenderContext, Renderer};

const SIZE: (u32, u32) = (1280, 720);

fn build_scene(objects: usize, materials: usize) -> (SceneGraph, NodeId) {
    let mut scene = SceneGraph::new();
    let layer = scene.add_node(None, Node::new(NodeKind::Layer(Layer::new())));
    scene.add_node(
        Some(layer),
        Node::new(NodeKind::Camera(Camera::new_perspective(60.0, 0.1, 500.0))),
    );
    let mut sun = Light::new_directional(Vec3::ONE, 1.0);
    sun.cast_shadow = true;
    scene.add_node(Some(layer), Node::new(NodeKind::Light(sun)));

    let materials: Vec<_> = (0..materials.max(1))
        .map(|i| {
            let material = if i % 4 == 3 {
                Material::principled().with_opacity(0.5)
            } else {
                Material::principled()
            };
            scene.add_material(material)
        })
        .collect();

    // Grid in front of the camera under a single group.
    let side = (objects as f32).sqrt().ceil() as usize;
    let group = scene.add_node(Some(layer), Node::group());
    for i in 0..objects {
        let (x, y) = ((i % side) as f32, (i / side) as f32);
        let model = Model::new(MeshSource::Path("#Cube".into()))
            .with_material(materials[i % materials.len()]);
        let position = Vec3::new(x * 2.0 - side as f32, y * 2.0 - side as f32, -20.0 - y);
        scene.add_node(
            Some(group),
            Node::new(NodeKind::Model(model)).with_transform(Transform::from_position(position)),
        );
    }
    (scene, layer)
}

fn renderer() -> Renderer {
    Renderer::new(RenderContext::new(
        Box::new(HeadlessBackend::new()),
        Arc::new(MemoryAssetProvider::new()),
        RendererSettings::default(),
    ))
}

fn frame(renderer: &mut Renderer, scene: &mut SceneGraph, layer: NodeId) -> anyhow::Result<()> {
    renderer.begin_frame(scene, layer)?;
    renderer.prepare_layer_for_render(scene, layer, SIZE)?;
    renderer.rhi_prepare(scene, layer)?;
    renderer.end_frame(layer)?;
    Ok(())
}

fn bench_prepare(c: &mut Criterion) {
    let mut group = c.benchmark_group("Layer Preparation");

    for objects in [100, 1_000, 5_000] {
        group.bench_with_input(BenchmarkId::new("static scene", objects), &objects, |b, &n| {
            let (mut scene, layer) = build_scene(n, 16);
            let mut renderer = renderer();
            frame(&mut renderer, &mut scene, layer).unwrap();
            b.iter(|| {
                frame(&mut renderer, &mut scene, layer).unwrap();
                black_box(renderer.stats().renderables);
            });
        });

        group.bench_with_input(BenchmarkId::new("moving root", objects), &objects, |b, &n| {
            let (mut scene, layer) = build_scene(n, 16);
            let mut renderer = renderer();
            frame(&mut renderer, &mut scene, layer).unwrap();
            let mut t = 0.0_f32;
            b.iter(|| {
                t += 0.01;
                if let Some(mut transform) = scene.transform_mut(layer) {
                    transform.position.x = t.sin();
                }
                frame(&mut renderer, &mut scene, layer).unwrap();
                black_box(renderer.stats().renderables);
            });
        });
    }

    group.finish();
}

fn bench_material_edits(c: &mut Criterion) {
    let (mut scene, layer) = build_scene(1_000, 4);
    let mut renderer = renderer();
    frame(&mut renderer, &mut scene, layer).unwrap();
    let material = renderer.layer_data(layer).unwrap().objects()[0].material;

    c.bench_function("shared material edit (1000 objects)", |b| {
        let mut opacity = 1.0_f32;
        b.iter(|| {
            opacity = if opacity < 0.6 { 1.0 } else { opacity - 0.01 };
            if let Some(m) = scene.material_mut(material) {
                m.opacity = opacity;
            }
            frame(&mut renderer, &mut scene, layer).unwrap();
            black_box(renderer.context().shaders().stats().pipeline_count);
        });
    });
}

criterion_group!(benches, bench_prepare, bench_material_edits);
criterion_main!(benches);
