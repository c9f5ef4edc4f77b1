//! Hierarchy System
//!
//! Recomputes global values (transform, opacity, active, pickable) top-down
//! and is the single place node dirty flags are cleared.
//!
//! The traversal uses an explicit stack instead of recursion so deep
//! hierarchies cannot overflow the thread stack. Each node is visited twice:
//! on `Enter` its globals are recomputed if it or an ancestor changed; on
//! `Exit`, after the whole subtree, its `SUB_NODE_DIRTY` flag is cleared.
//! Flags therefore clear bottom-up.
//!
//! A subtree is skipped when its root neither changed nor carries
//! `SUB_NODE_DIRTY`, so an unchanged frame costs one visit per pass root.
//! Changes made through a raw `&mut Node` must mark ancestors themselves.

use glam::Affine3A;
use slotmap::SlotMap;
use smallvec::SmallVec;

use super::NodeId;
use super::node::{Node, NodeFlags, NodeKind};

#[derive(Debug, Clone, Copy)]
struct ParentGlobals {
    world: Affine3A,
    opacity: f32,
    active: bool,
    pickable: bool,
}

impl ParentGlobals {
    const ROOT: Self = Self {
        world: Affine3A::IDENTITY,
        opacity: 1.0,
        active: true,
        pickable: false,
    };

    fn of(node: &Node) -> Self {
        Self {
            world: node.transform().world_matrix,
            opacity: node.global_opacity,
            active: node.global_active,
            pickable: node.global_pickable,
        }
    }
}

enum Visit {
    Enter {
        id: NodeId,
        parent: ParentGlobals,
        parent_changed: bool,
    },
    Exit(NodeId),
}

const CLEARED_ON_ENTER: NodeFlags = NodeFlags::GLOBAL_VALUES_DIRTY
    .union(NodeFlags::LIGHT_DIRTY)
    .union(NodeFlags::CAMERA_DIRTY);

/// Updates the subtree rooted at `root` and returns how many nodes had
/// their globals recomputed.
///
/// Ancestors of `root` must already be up to date; their stored globals
/// seed the traversal. An `ImportedScene` container pulls its target tree
/// into the same pass, seeded with identity globals.
pub fn update_globals(nodes: &mut SlotMap<NodeId, Node>, root: NodeId) -> usize {
    let seed = nodes
        .get(root)
        .and_then(|n| n.parent)
        .and_then(|p| nodes.get(p))
        .map_or(ParentGlobals::ROOT, ParentGlobals::of);

    let mut stack: Vec<Visit> = Vec::with_capacity(64);
    let mut imported: SmallVec<[NodeId; 2]> = SmallVec::new();
    let mut recomputed = 0;

    stack.push(Visit::Enter {
        id: root,
        parent: seed,
        parent_changed: false,
    });

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter {
                id,
                parent,
                parent_changed,
            } => {
                let Some(node) = nodes.get_mut(id) else {
                    continue;
                };

                let changed = parent_changed || node.flags.intersects(NodeFlags::GLOBAL_VALUES_DIRTY);
                let descend = changed || node.flags.contains(NodeFlags::SUB_NODE_DIRTY);
                if changed {
                    node.transform.world_matrix = parent.world * node.transform().local_matrix();
                    node.global_opacity = parent.opacity * node.opacity();
                    node.global_active = parent.active && node.is_locally_active();
                    node.global_pickable = parent.pickable || node.is_locally_pickable();
                    recomputed += 1;
                }
                node.flags.remove(CLEARED_ON_ENTER);

                stack.push(Visit::Exit(id));

                if !descend {
                    // Imported trees mark their own root, not the layer.
                    if let Some(target) = node.as_layer().and_then(|l| l.imported_scene())
                        && !imported.contains(&target)
                    {
                        imported.push(target);
                        stack.push(Visit::Enter {
                            id: target,
                            parent: ParentGlobals::ROOT,
                            parent_changed: false,
                        });
                    }
                    continue;
                }

                let globals = ParentGlobals::of(node);
                for &child in node.children.iter().rev() {
                    stack.push(Visit::Enter {
                        id: child,
                        parent: globals,
                        parent_changed: changed,
                    });
                }

                if let NodeKind::ImportedScene { root: target } = *node.kind()
                    && !imported.contains(&target)
                {
                    imported.push(target);
                    stack.push(Visit::Enter {
                        id: target,
                        parent: ParentGlobals::ROOT,
                        parent_changed: false,
                    });
                }
            }
            Visit::Exit(id) => {
                if let Some(node) = nodes.get_mut(id) {
                    node.flags.remove(NodeFlags::SUB_NODE_DIRTY);
                }
            }
        }
    }

    recomputed
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn chain(nodes: &mut SlotMap<NodeId, Node>, depth: usize) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut parent: Option<NodeId> = None;
        for _ in 0..depth {
            let mut node = Node::group();
            node.transform_mut().position = Vec3::X;
            node.parent = parent;
            let id = nodes.insert(node);
            if let Some(p) = parent {
                nodes[p].children.push(id);
            }
            parent = Some(id);
            ids.push(id);
        }
        ids
    }

    #[test]
    fn test_deep_chain_no_recursion() {
        let mut nodes = SlotMap::with_key();
        let ids = chain(&mut nodes, 10_000);
        assert_eq!(update_globals(&mut nodes, ids[0]), 10_000);
        let last = nodes[ids[9_999]].world_matrix().translation;
        assert!((last.x - 10_000.0).abs() < 1e-1);
    }

    #[test]
    fn test_second_pass_recomputes_nothing() {
        let mut nodes = SlotMap::with_key();
        let ids = chain(&mut nodes, 4);
        update_globals(&mut nodes, ids[0]);
        let before: Vec<_> = ids.iter().map(|&id| *nodes[id].world_matrix()).collect();
        assert_eq!(update_globals(&mut nodes, ids[0]), 0);
        let after: Vec<_> = ids.iter().map(|&id| *nodes[id].world_matrix()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_inactive_parent_deactivates_subtree() {
        let mut nodes = SlotMap::with_key();
        let ids = chain(&mut nodes, 3);
        nodes[ids[1]].set_active(false);
        update_globals(&mut nodes, ids[0]);
        assert!(nodes[ids[0]].is_active());
        assert!(!nodes[ids[1]].is_active());
        assert!(!nodes[ids[2]].is_active());
    }

    #[test]
    fn test_clean_subtrees_are_skipped() {
        let mut nodes = SlotMap::with_key();
        let ids = chain(&mut nodes, 6);
        assert_eq!(update_globals(&mut nodes, ids[0]), 6);

        // Leaf edit with its ancestors marked: only the leaf is recomputed.
        nodes[ids[5]].transform_mut().position = Vec3::Y;
        for &id in &ids[..5] {
            nodes[id].flags.insert(NodeFlags::SUB_NODE_DIRTY);
        }
        assert_eq!(update_globals(&mut nodes, ids[0]), 1);
        assert!(ids.iter().all(|&id| nodes[id].flags.is_empty()));

        // Without the ancestor marks the clean root stops the walk.
        nodes[ids[5]].transform_mut().position = Vec3::Z;
        assert_eq!(update_globals(&mut nodes, ids[0]), 0);
        assert!(nodes[ids[5]].flags.contains(NodeFlags::TRANSFORM_DIRTY));
    }
}
