//! Front-end synchronization.
//!
//! Front-end objects own a lightweight proxy; the core owns the heavyweight
//! [`Node`]. The two are linked by the opaque [`NodeId`] the proxy keeps
//! between syncs.

use super::graph::SceneGraph;
use super::node::Node;
use super::NodeId;

pub trait SpatialNodeProxy {
    /// Builds a fresh node for this proxy.
    fn create_node(&self) -> Node;

    /// Pushes the proxy's current properties into `node`. Use the node's
    /// setters so the right dirty flags are raised.
    fn update_node(&self, node: &mut Node);

    /// Where a newly created node is attached.
    fn parent(&self) -> Option<NodeId> {
        None
    }
}

impl SceneGraph {
    /// Syncs `proxy` into the graph. Creates a node when `existing` is
    /// `None` or stale, otherwise updates it in place. Returns the handle
    /// the proxy must keep for the next sync.
    pub fn update_spatial_node(
        &mut self,
        proxy: &dyn SpatialNodeProxy,
        existing: Option<NodeId>,
    ) -> NodeId {
        if let Some(id) = existing.filter(|&id| self.contains_node(id)) {
            let changed = {
                let nodes = self.nodes_raw_mut();
                let node = &mut nodes[id];
                let before = node.flags();
                proxy.update_node(node);
                node.flags() != before
            };
            if changed {
                self.mark_ancestors(id);
            }
            return id;
        }

        let mut node = proxy.create_node();
        proxy.update_node(&mut node);
        self.add_node(proxy.parent(), node)
    }
}
