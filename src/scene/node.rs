use bitflags::bitflags;
use glam::Affine3A;
use uuid::Uuid;

use super::NodeId;
use super::camera::Camera;
use super::layer::Layer;
use super::light::Light;
use super::model::{Item2D, Model, Particles, ReflectionProbe};
use super::tracking::DirtyGuard;
use super::transform::Transform;

bitflags! {
    /// Per-node dirty state.
    ///
    /// Only [`update_globals`](crate::scene::hierarchy::update_globals)
    /// clears these flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u32 {
        const TRANSFORM_DIRTY = 1 << 4;
        const OPACITY_DIRTY = 1 << 5;
        const ACTIVE_DIRTY = 1 << 6;
        const PICKABLE_DIRTY = 1 << 7;
        /// Something below this node changed.
        const SUB_NODE_DIRTY = 1 << 8;
        const LIGHT_DIRTY = 1 << 9;
        const CAMERA_DIRTY = 1 << 10;

        const GLOBAL_VALUES_DIRTY = Self::TRANSFORM_DIRTY.bits()
            | Self::OPACITY_DIRTY.bits()
            | Self::ACTIVE_DIRTY.bits()
            | Self::PICKABLE_DIRTY.bits();
    }
}

/// The closed set of node kinds.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Group,
    Layer(Layer),
    Camera(Camera),
    Light(Light),
    Model(Model),
    Particles(Particles),
    Item2D(Item2D),
    ReflectionProbe(ReflectionProbe),
    /// Synthetic container for a scene imported into a layer. It does not
    /// own `root`; the imported tree keeps its own parent chain.
    ImportedScene { root: NodeId },
}

impl NodeKind {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Group => "Group",
            Self::Layer(_) => "Layer",
            Self::Camera(_) => "Camera",
            Self::Light(_) => "Light",
            Self::Model(_) => "Model",
            Self::Particles(_) => "Particles",
            Self::Item2D(_) => "Item2D",
            Self::ReflectionProbe(_) => "ReflectionProbe",
            Self::ImportedScene { .. } => "ImportedScene",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub uuid: Uuid,
    pub name: String,
    kind: NodeKind,

    pub(crate) transform: Transform,
    local_opacity: f32,
    local_active: bool,
    local_pickable: bool,

    pub(crate) global_opacity: f32,
    pub(crate) global_active: bool,
    pub(crate) global_pickable: bool,

    pub(crate) flags: NodeFlags,

    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
}

impl Node {
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: String::new(),
            kind,
            transform: Transform::new(),
            local_opacity: 1.0,
            local_active: true,
            local_pickable: false,
            global_opacity: 1.0,
            global_active: false,
            global_pickable: false,
            flags: NodeFlags::GLOBAL_VALUES_DIRTY,
            parent: None,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn group() -> Self {
        Self::new(NodeKind::Group)
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self.flags.insert(NodeFlags::TRANSFORM_DIRTY);
        self
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Raw access to the kind payload. Does not mark anything dirty; prefer
    /// the typed accessors, which do.
    #[inline]
    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    // === Hierarchy ===

    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[inline]
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    // === Local values ===

    #[inline]
    #[must_use]
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Mutable transform; marks `TRANSFORM_DIRTY` when the guard drops.
    pub fn transform_mut(&mut self) -> DirtyGuard<'_, Transform> {
        DirtyGuard::new(&mut self.transform, &mut self.flags, NodeFlags::TRANSFORM_DIRTY)
    }

    #[inline]
    #[must_use]
    pub fn opacity(&self) -> f32 {
        self.local_opacity
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        let opacity = opacity.clamp(0.0, 1.0);
        if self.local_opacity != opacity {
            self.local_opacity = opacity;
            self.flags.insert(NodeFlags::OPACITY_DIRTY);
        }
    }

    #[inline]
    #[must_use]
    pub fn is_locally_active(&self) -> bool {
        self.local_active
    }

    pub fn set_active(&mut self, active: bool) {
        if self.local_active != active {
            self.local_active = active;
            self.flags.insert(NodeFlags::ACTIVE_DIRTY);
        }
    }

    #[inline]
    #[must_use]
    pub fn is_locally_pickable(&self) -> bool {
        self.local_pickable
    }

    pub fn set_pickable(&mut self, pickable: bool) {
        if self.local_pickable != pickable {
            self.local_pickable = pickable;
            self.flags.insert(NodeFlags::PICKABLE_DIRTY);
        }
    }

    // === Global values ===

    /// Global matrix as of the last hierarchy pass.
    #[inline]
    #[must_use]
    pub fn world_matrix(&self) -> &Affine3A {
        &self.transform.world_matrix
    }

    #[inline]
    #[must_use]
    pub fn global_opacity(&self) -> f32 {
        self.global_opacity
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.global_active
    }

    #[inline]
    #[must_use]
    pub fn is_pickable(&self) -> bool {
        self.global_pickable
    }

    // === Flags ===

    #[inline]
    #[must_use]
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub fn is_dirty(&self, flag: NodeFlags) -> bool {
        self.flags.intersects(flag)
    }

    pub fn mark_dirty(&mut self, flag: NodeFlags) {
        self.flags.insert(flag);
    }

    // === Kind queries ===

    #[must_use]
    pub fn as_renderable(&self) -> Option<&Model> {
        match &self.kind {
            NodeKind::Model(model) => Some(model),
            NodeKind::Particles(particles) => Some(&particles.model),
            NodeKind::Item2D(item) => Some(&item.model),
            _ => None,
        }
    }

    pub fn as_renderable_mut(&mut self) -> Option<&mut Model> {
        match &mut self.kind {
            NodeKind::Model(model) => Some(model),
            NodeKind::Particles(particles) => Some(&mut particles.model),
            NodeKind::Item2D(item) => Some(&mut item.model),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_light(&self) -> Option<&Light> {
        match &self.kind {
            NodeKind::Light(light) => Some(light),
            _ => None,
        }
    }

    /// Marks `LIGHT_DIRTY` when the guard drops.
    pub fn as_light_mut(&mut self) -> Option<DirtyGuard<'_, Light>> {
        match &mut self.kind {
            NodeKind::Light(light) => {
                Some(DirtyGuard::new(light, &mut self.flags, NodeFlags::LIGHT_DIRTY))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_camera(&self) -> Option<&Camera> {
        match &self.kind {
            NodeKind::Camera(camera) => Some(camera),
            _ => None,
        }
    }

    /// Marks `CAMERA_DIRTY` when the guard drops.
    pub fn as_camera_mut(&mut self) -> Option<DirtyGuard<'_, Camera>> {
        match &mut self.kind {
            NodeKind::Camera(camera) => {
                Some(DirtyGuard::new(camera, &mut self.flags, NodeFlags::CAMERA_DIRTY))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_layer(&self) -> Option<&Layer> {
        match &self.kind {
            NodeKind::Layer(layer) => Some(layer),
            _ => None,
        }
    }

    /// Marks `SUB_NODE_DIRTY` when the guard drops, so the next preparation
    /// treats the layer as needing work.
    pub fn as_layer_mut(&mut self) -> Option<DirtyGuard<'_, Layer>> {
        match &mut self.kind {
            NodeKind::Layer(layer) => {
                Some(DirtyGuard::new(layer, &mut self.flags, NodeFlags::SUB_NODE_DIRTY))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_reflection_probe(&self) -> Option<&ReflectionProbe> {
        match &self.kind {
            NodeKind::ReflectionProbe(probe) => Some(probe),
            _ => None,
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::group()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::light::Light;
    use glam::Vec3;

    #[test]
    fn test_new_node_starts_dirty() {
        let node = Node::group();
        assert!(node.flags().contains(NodeFlags::GLOBAL_VALUES_DIRTY));
        assert!(node.is_locally_active());
    }

    #[test]
    fn test_setters_only_mark_on_change() {
        let mut node = Node::group();
        node.flags = NodeFlags::empty();
        node.set_opacity(1.0);
        assert!(node.flags().is_empty());
        node.set_opacity(0.25);
        assert!(node.is_dirty(NodeFlags::OPACITY_DIRTY));
    }

    #[test]
    fn test_light_guard_marks_light_dirty() {
        let mut node = Node::new(NodeKind::Light(Light::new_directional(Vec3::ONE, 1.0)));
        node.flags = NodeFlags::empty();
        if let Some(mut light) = node.as_light_mut() {
            light.brightness = 0.0;
        }
        assert!(node.is_dirty(NodeFlags::LIGHT_DIRTY));
        assert!(!node.as_light().is_some_and(Light::is_enabled));
    }
}
