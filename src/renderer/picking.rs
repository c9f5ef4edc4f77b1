//! Ray picking.
//!
//! Candidates are the active renderables of a layer, using the mesh each
//! one drew with in its latest preparation. A candidate is rejected on its
//! world bounds first; survivors are tested triangle by triangle in local
//! space, one result per hit subset.

use glam::Vec3;

use crate::resources::BufferManager;
use crate::scene::{NodeId, Ray, SceneGraph};

use super::Renderer;
use super::layer_data::{gather_layer, renderable_world};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickResult {
    pub node: NodeId,
    pub subset: usize,
    /// Along the ray, in world units.
    pub distance: f32,
    /// World-space hit point.
    pub position: Vec3,
}

impl Renderer {
    /// Hits of `ray` on pickable nodes of `layer`, nearest first.
    ///
    /// Reads global transforms and resolved meshes, so the layer should
    /// have been prepared since its last scene edit.
    #[must_use]
    pub fn pick(&self, scene: &SceneGraph, layer: NodeId, ray: &Ray) -> Vec<PickResult> {
        pick_layer(scene, self.context().buffers(), layer, ray, false)
    }

    /// As [`pick`](Self::pick), ignoring the pickable flag.
    #[must_use]
    pub fn pick_all(&self, scene: &SceneGraph, layer: NodeId, ray: &Ray) -> Vec<PickResult> {
        pick_layer(scene, self.context().buffers(), layer, ray, true)
    }
}

fn pick_layer(
    scene: &SceneGraph,
    buffers: &BufferManager,
    layer: NodeId,
    ray: &Ray,
    everything: bool,
) -> Vec<PickResult> {
    let mut hits = Vec::new();
    if ray.direction == Vec3::ZERO {
        return hits;
    }

    for id in gather_layer(scene, layer).renderables {
        let Some(node) = scene.node(id) else { continue };
        if !everything && !node.is_pickable() {
            continue;
        }
        let Some(mesh) = buffers.mesh_for_user(id).and_then(|h| buffers.mesh(h)) else {
            continue;
        };
        let Some(geometry) = mesh.pick.as_deref() else { continue };

        let world = renderable_world(node);
        if world.matrix3.determinant().abs() < f32::EPSILON {
            continue;
        }
        if mesh.bounds.transformed(&world).intersect_ray(ray).is_none() {
            continue;
        }
        let local = ray.transformed(&world.inverse());
        for (index, subset) in mesh.subsets.iter().enumerate() {
            if subset.bounds.intersect_ray(&local).is_none() {
                continue;
            }
            if let Some(t) = geometry.intersect_ray(&local, subset.offset, subset.count) {
                hits.push(PickResult {
                    node: id,
                    subset: index,
                    distance: t,
                    position: ray.at(t),
                });
            }
        }
    }

    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    log::trace!("Pick in layer {layer:?}: {} hits", hits.len());
    hits
}
