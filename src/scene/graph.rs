//! Scene Graph
//!
//! Owns every scene entity in `slotmap` arenas addressed by typed keys.
//! Children are an owned `Vec<NodeId>` on the parent with a non-owning
//! `parent` back-reference on the child.
//!
//! Mutations made through `SceneGraph` propagate `SUB_NODE_DIRTY` to all
//! ancestors so preparation can tell which layers need work. Mutations made
//! directly on a `&mut Node` only mark the node itself.

use glam::Affine3A;
use slotmap::SlotMap;

use super::effect::Effect;
use super::hierarchy;
use super::image::Image;
use super::material::Material;
use super::node::{Node, NodeFlags, NodeKind};
use super::tracking::{DirtyGuard, VersionGuard};
use super::transform::Transform;
use super::{EffectId, GeometryId, ImageId, MaterialId, NodeId, TextureDataId};
use crate::contract_violation;
use crate::errors::{LumenError, Result};
use crate::resources::mesh::MeshData;
use crate::resources::texture::ImageData;

/// In-memory texture payload. `version` changes whenever the pixels are
/// replaced through [`SceneGraph::texture_data_mut`].
#[derive(Debug, Clone)]
pub struct TextureData {
    pub image: ImageData,
    version: u64,
}

impl TextureData {
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Inline geometry. `version` changes on every mutable access.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub mesh: MeshData,
    version: u64,
}

impl Geometry {
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Default)]
pub struct SceneGraph {
    nodes: SlotMap<NodeId, Node>,
    roots: Vec<NodeId>,

    materials: SlotMap<MaterialId, Material>,
    images: SlotMap<ImageId, Image>,
    texture_data: SlotMap<TextureDataId, TextureData>,
    geometries: SlotMap<GeometryId, Geometry>,
    effects: SlotMap<EffectId, Effect>,
}

impl SceneGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Adds `node` under `parent`, or as a root. Returns the new id.
    pub fn add_node(&mut self, parent: Option<NodeId>, mut node: Node) -> NodeId {
        node.parent = None;
        node.children.clear();
        let id = self.nodes.insert(node);
        match parent.filter(|p| self.nodes.contains_key(*p)) {
            Some(p) => {
                self.nodes[id].parent = Some(p);
                self.nodes[p].children.push(id);
                self.mark_ancestors(id);
            }
            None => {
                if parent.is_some() {
                    log::warn!("add_node: parent no longer exists, adding as root");
                }
                self.roots.push(id);
            }
        }
        id
    }

    /// Removes `id` and its whole subtree. Returns the removed ids so the
    /// caller can release their GPU resources.
    pub fn remove_node(&mut self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.nodes.get(id) else {
            return Vec::new();
        };
        let parent = node.parent;
        self.detach(id, parent);

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(current) {
                stack.extend_from_slice(&node.children);
                removed.push(current);
            }
        }

        // Drop dangling references held by layers and lights.
        for node in self.nodes.values_mut() {
            match node.kind_mut() {
                NodeKind::Layer(layer) => {
                    if layer.explicit_camera.is_some_and(|c| removed.contains(&c)) {
                        layer.explicit_camera = None;
                    }
                    if layer.imported_scene.is_some_and(|r| removed.contains(&r)) {
                        layer.imported_scene = None;
                    }
                }
                NodeKind::Light(light) => {
                    if light.scope.is_some_and(|s| removed.contains(&s)) {
                        light.scope = None;
                    }
                }
                _ => {}
            }
        }

        log::debug!("removed {} node(s)", removed.len());
        removed
    }

    /// Moves `id` under `new_parent` (or to the roots). Rejects moves that
    /// would create a cycle.
    pub fn reparent(&mut self, id: NodeId, new_parent: Option<NodeId>) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(LumenError::InvalidHandle { kind: "node" });
        }
        if let Some(p) = new_parent {
            if !self.nodes.contains_key(p) {
                return Err(LumenError::InvalidHandle { kind: "node" });
            }
            if p == id || self.is_ancestor_of(id, p) {
                return contract_violation!("reparent would make a node its own ancestor");
            }
        }

        let old_parent = self.nodes[id].parent;
        self.detach(id, old_parent);

        match new_parent {
            Some(p) => {
                self.nodes[id].parent = Some(p);
                self.nodes[p].children.push(id);
            }
            None => self.roots.push(id),
        }
        self.nodes[id].flags.insert(NodeFlags::GLOBAL_VALUES_DIRTY);
        self.mark_ancestors(id);
        Ok(())
    }

    fn detach(&mut self, id: NodeId, parent: Option<NodeId>) {
        match parent {
            Some(p) => {
                if let Some(parent) = self.nodes.get_mut(p) {
                    parent.children.retain(|&c| c != id);
                }
                self.mark_ancestors_from(p);
            }
            None => self.roots.retain(|&r| r != id),
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = None;
        }
    }

    /// `true` if `ancestor` is on the parent chain of `id`.
    #[must_use]
    pub fn is_ancestor_of(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = self.nodes.get(id).and_then(|n| n.parent);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.nodes.get(p).and_then(|n| n.parent);
        }
        false
    }

    pub(crate) fn mark_ancestors(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes.get(id).and_then(|n| n.parent) {
            self.mark_ancestors_from(parent);
        }
    }

    fn mark_ancestors_from(&mut self, start: NodeId) {
        let mut current = Some(start);
        while let Some(p) = current {
            let Some(node) = self.nodes.get_mut(p) else {
                break;
            };
            node.flags.insert(NodeFlags::SUB_NODE_DIRTY);
            current = node.parent;
        }
    }

    #[inline]
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Mutable node access. Marks every ancestor `SUB_NODE_DIRTY` up front,
    /// since the caller is assumed to change something.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if self.nodes.contains_key(id) {
            self.mark_ancestors(id);
        }
        self.nodes.get_mut(id)
    }

    /// Mutable transform of `id`; the guard marks `TRANSFORM_DIRTY`.
    pub fn transform_mut(&mut self, id: NodeId) -> Option<DirtyGuard<'_, Transform>> {
        self.node_mut(id).map(Node::transform_mut)
    }

    #[must_use]
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(id).map_or(&[], |n| n.children.as_slice())
    }

    #[must_use]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    pub(crate) fn nodes_raw_mut(&mut self) -> &mut SlotMap<NodeId, Node> {
        &mut self.nodes
    }

    /// Nearest layer at or above `id`.
    #[must_use]
    pub fn layer_for_node(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(c) = current {
            let node = self.nodes.get(c)?;
            if node.as_layer().is_some() {
                return Some(c);
            }
            current = node.parent;
        }
        None
    }

    /// All layers in root order.
    #[must_use]
    pub fn layers(&self) -> Vec<NodeId> {
        let mut layers = Vec::new();
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                if node.as_layer().is_some() {
                    layers.push(id);
                }
                stack.extend(node.children.iter().rev());
            }
        }
        layers
    }

    /// Recomputes global values below `root`. See [`hierarchy::update_globals`].
    pub fn update_globals(&mut self, root: NodeId) -> usize {
        hierarchy::update_globals(&mut self.nodes, root)
    }

    /// World matrix of `id` as of the last hierarchy pass.
    #[must_use]
    pub fn world_matrix(&self, id: NodeId) -> Option<&Affine3A> {
        self.nodes.get(id).map(Node::world_matrix)
    }

    /// Imports the tree at `root` into `layer` through a synthetic container
    /// node. Replaces any previous import.
    pub fn set_imported_scene(&mut self, layer: NodeId, root: Option<NodeId>) -> Result<()> {
        let Some(node) = self.nodes.get(layer) else {
            return Err(LumenError::InvalidHandle { kind: "node" });
        };
        if node.as_layer().is_none() {
            return Err(LumenError::NotALayer);
        }

        // Drop the previous container.
        let previous = node
            .children
            .iter()
            .copied()
            .find(|&c| matches!(self.nodes[c].kind(), NodeKind::ImportedScene { .. }));
        if let Some(container) = previous {
            self.remove_node(container);
        }

        if let Some(root) = root {
            if !self.nodes.contains_key(root) {
                return Err(LumenError::InvalidHandle { kind: "node" });
            }
            let container = Node::new(NodeKind::ImportedScene { root }).with_name("importScene");
            self.add_node(Some(layer), container);
            self.nodes[root].flags.insert(NodeFlags::GLOBAL_VALUES_DIRTY);
        }
        if let Some(NodeKind::Layer(l)) = self.nodes.get_mut(layer).map(Node::kind_mut) {
            l.imported_scene = root;
        }
        self.nodes[layer].flags.insert(NodeFlags::SUB_NODE_DIRTY);
        Ok(())
    }

    // ========================================================================
    // Materials / Images / Data
    // ========================================================================

    pub fn add_material(&mut self, material: Material) -> MaterialId {
        self.materials.insert(material)
    }

    #[must_use]
    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id)
    }

    /// Mutable material access; marks the material dirty.
    pub fn material_mut(&mut self, id: MaterialId) -> Option<&mut Material> {
        let material = self.materials.get_mut(id)?;
        material.mark_dirty();
        Some(material)
    }

    pub(crate) fn materials_raw_mut(&mut self) -> &mut SlotMap<MaterialId, Material> {
        &mut self.materials
    }

    pub fn remove_material(&mut self, id: MaterialId) -> Option<Material> {
        self.materials.remove(id)
    }

    pub fn add_image(&mut self, image: Image) -> ImageId {
        self.images.insert(image)
    }

    #[must_use]
    pub fn image(&self, id: ImageId) -> Option<&Image> {
        self.images.get(id)
    }

    /// Mutable image access; marks the image dirty.
    pub fn image_mut(&mut self, id: ImageId) -> Option<&mut Image> {
        let image = self.images.get_mut(id)?;
        image.mark_dirty();
        Some(image)
    }

    pub(crate) fn images_raw_mut(&mut self) -> &mut SlotMap<ImageId, Image> {
        &mut self.images
    }

    pub fn add_texture_data(&mut self, image: ImageData) -> TextureDataId {
        self.texture_data.insert(TextureData { image, version: 0 })
    }

    #[must_use]
    pub fn texture_data(&self, id: TextureDataId) -> Option<&TextureData> {
        self.texture_data.get(id)
    }

    /// Mutable pixel access; bumps the version when the guard drops.
    pub fn texture_data_mut(&mut self, id: TextureDataId) -> Option<VersionGuard<'_, ImageData>> {
        self.texture_data
            .get_mut(id)
            .map(|data| VersionGuard::new(&mut data.image, &mut data.version))
    }

    pub fn remove_texture_data(&mut self, id: TextureDataId) -> Option<ImageData> {
        self.texture_data.remove(id).map(|d| d.image)
    }

    pub fn add_geometry(&mut self, mesh: MeshData) -> GeometryId {
        self.geometries.insert(Geometry { mesh, version: 0 })
    }

    #[must_use]
    pub fn geometry(&self, id: GeometryId) -> Option<&Geometry> {
        self.geometries.get(id)
    }

    /// Mutable geometry access; bumps the version when the guard drops.
    pub fn geometry_mut(&mut self, id: GeometryId) -> Option<VersionGuard<'_, MeshData>> {
        self.geometries
            .get_mut(id)
            .map(|g| VersionGuard::new(&mut g.mesh, &mut g.version))
    }

    pub fn remove_geometry(&mut self, id: GeometryId) -> Option<MeshData> {
        self.geometries.remove(id).map(|g| g.mesh)
    }

    // ========================================================================
    // Effects
    // ========================================================================

    pub fn add_effect(&mut self, effect: Effect) -> EffectId {
        self.effects.insert(effect)
    }

    #[must_use]
    pub fn effect(&self, id: EffectId) -> Option<&Effect> {
        self.effects.get(id)
    }

    pub fn effect_mut(&mut self, id: EffectId) -> Option<&mut Effect> {
        self.effects.get_mut(id)
    }

    /// Appends `effect` to the layer chain. The most recently added effect
    /// runs first.
    pub fn layer_add_effect(&mut self, layer: NodeId, effect: EffectId) -> Result<()> {
        if !self.effects.contains_key(effect) {
            return Err(LumenError::InvalidHandle { kind: "effect" });
        }
        let mut layer = self.layer_mut(layer)?;
        if !layer.effects.contains(&effect) {
            layer.effects.push(effect);
        }
        Ok(())
    }

    pub fn layer_remove_effect(&mut self, layer: NodeId, effect: EffectId) -> Result<bool> {
        let mut layer = self.layer_mut(layer)?;
        let before = layer.effects.len();
        layer.effects.retain(|&e| e != effect);
        Ok(layer.effects.len() != before)
    }

    fn layer_mut(&mut self, id: NodeId) -> Result<DirtyGuard<'_, super::layer::Layer>> {
        self.nodes
            .get_mut(id)
            .ok_or(LumenError::InvalidHandle { kind: "node" })?
            .as_layer_mut()
            .ok_or(LumenError::NotALayer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::layer::Layer;
    use glam::Vec3;

    #[test]
    fn test_remove_subtree_returns_all() {
        let mut scene = SceneGraph::new();
        let a = scene.add_node(None, Node::group());
        let b = scene.add_node(Some(a), Node::group());
        let c = scene.add_node(Some(b), Node::group());
        let removed = scene.remove_node(b);
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&c));
        assert!(scene.children(a).is_empty());
        assert!(!scene.contains_node(c));
    }

    #[test]
    fn test_reparent_rejects_cycle() {
        let mut scene = SceneGraph::new();
        let a = scene.add_node(None, Node::group());
        let b = scene.add_node(Some(a), Node::group());
        assert!(scene.is_ancestor_of(a, b));
        // The cycle check reports through the contract channel, which
        // asserts in debug builds.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scene.reparent(a, Some(b))
        }));
        assert!(matches!(result, Err(_) | Ok(Err(LumenError::ContractViolation(_)))));
    }

    #[test]
    fn test_node_mut_marks_ancestors() {
        let mut scene = SceneGraph::new();
        let layer = scene.add_node(None, Node::new(NodeKind::Layer(Layer::new())));
        let group = scene.add_node(Some(layer), Node::group());
        let leaf = scene.add_node(Some(group), Node::group());
        scene.update_globals(layer);
        assert!(scene.node(layer).unwrap().flags().is_empty());

        scene.transform_mut(leaf).unwrap().position = Vec3::Y;
        assert!(scene.node(layer).unwrap().is_dirty(NodeFlags::SUB_NODE_DIRTY));
        assert!(scene.node(group).unwrap().is_dirty(NodeFlags::SUB_NODE_DIRTY));
        assert!(scene.node(leaf).unwrap().is_dirty(NodeFlags::TRANSFORM_DIRTY));
        assert_eq!(scene.layer_for_node(leaf), Some(layer));
    }

    #[test]
    fn test_texture_data_version_bumps() {
        let mut scene = SceneGraph::new();
        let id = scene.add_texture_data(ImageData::solid(2, 2, [255, 0, 0, 255]));
        assert_eq!(scene.texture_data(id).unwrap().version(), 0);
        scene.texture_data_mut(id).unwrap().pixels[0] = 0;
        assert_eq!(scene.texture_data(id).unwrap().version(), 1);
    }
}
