/*
 * Created on Fri Jan 12 2024
 *
 * This file is a part of Scened
 * Scened is a free and open-source replicated scene-graph store that
 * provides ACID multi-shard transactions over a tree of nodes without
 * compromising on consistency or recoverability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {
    super::{NodeId, NodeState, NIL},
    crate::engine::repl::ShardId,
    std::collections::BTreeMap,
};

#[derive(Debug, Clone, PartialEq)]
/// A single property write inside a `batch_update`
pub struct PropertyUpdate {
    pub node: NodeId,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
/// A scene operation: the commands the state machine applies deterministically.
///
/// The last four variants are the fan-out primitives a `move_shard` decomposes into at
/// the coordinator; clients never submit them directly.
pub enum SceneOp {
    /// Make `new_node` the new first child of `target` (pushing the former first child
    /// to `new_node.right_sibling`). With `target = NIL` this is root creation
    AddChild {
        target: NodeId,
        new_node: NodeId,
        properties: BTreeMap<String, String>,
    },
    /// Splice `new_node` immediately after `target` in the sibling chain
    AddSibling {
        target: NodeId,
        new_node: NodeId,
        properties: BTreeMap<String, String>,
    },
    /// Delete `node` and its entire descendant closure
    RemoveNode { node: NodeId },
    /// Upsert `key -> value` on `node`
    SetProperty {
        node: NodeId,
        key: String,
        value: String,
    },
    /// Detach `node` from its parent and splice it under `new_parent`: after
    /// `new_sibling` when non-nil, else as the new first child
    MoveSubtree {
        node: NodeId,
        new_parent: NodeId,
        new_sibling: NodeId,
    },
    /// Reposition `child_node` at `to_index` among the ordered children of `parent`.
    /// Negative indices count from the end; an invalid index or a non-child is a no-op
    MoveChild {
        parent: NodeId,
        child_node: NodeId,
        to_index: i32,
    },
    /// Property writes applied in order under a single log entry
    BatchUpdate { updates: Vec<PropertyUpdate> },
    /// Structural edits applied in order under a single log entry; an invalid nested
    /// edit is a no-op
    BatchStructure { structure_ops: Vec<SceneOp> },
    /// Migrate the subtree rooted at `node` to `new_shard`. Synthesized into the
    /// primitives below by the coordinator; never appears in a log
    MoveShard { node: NodeId, new_shard: ShardId },
    /// Install `state` as the authoritative record of `node` (shard migration delivery)
    StateTransfer {
        node: NodeId,
        shard: ShardId,
        state: NodeState,
    },
    /// Drop the local record of `node` (the old shard's side of a migration)
    ShardRemove { node: NodeId },
    /// Splice `child` out of `parent`'s child chain, rewriting exactly one pointer
    DetachChild { parent: NodeId, child: NodeId },
    /// Insert `child` at `position` among `parent`'s ordered children. `parent = NIL`
    /// means the migrated subtree is the root and no pointer needs rewriting
    AttachChild {
        parent: NodeId,
        child: NodeId,
        position: u16,
    },
}

impl SceneOp {
    /// The node this operation is anchored to for shard routing and conflict analysis.
    /// Pointer rewrites anchor to the parent whose chain they edit
    pub fn primary_node(&self) -> NodeId {
        match self {
            Self::AddChild {
                target, new_node, ..
            } => {
                if *target == NIL {
                    *new_node
                } else {
                    *target
                }
            }
            Self::AddSibling { target, .. } => *target,
            Self::RemoveNode { node } => *node,
            Self::SetProperty { node, .. } => *node,
            Self::MoveSubtree { node, .. } => *node,
            Self::MoveChild { child_node, .. } => *child_node,
            Self::MoveShard { node, .. } => *node,
            Self::StateTransfer { node, .. } => *node,
            Self::ShardRemove { node } => *node,
            Self::DetachChild { parent, .. } => *parent,
            Self::AttachChild { parent, .. } => *parent,
            Self::BatchUpdate { .. } | Self::BatchStructure { .. } => NIL,
        }
    }
    /// Whether this operation rewrites tree structure (vs a property write)
    pub fn is_tree_mutation(&self) -> bool {
        matches!(
            self,
            Self::MoveSubtree { .. } | Self::RemoveNode { .. } | Self::MoveChild { .. }
        )
    }
    /// The node this operation brings into existence, if any
    pub fn created_node(&self) -> Option<NodeId> {
        match self {
            Self::AddChild { new_node, .. } | Self::AddSibling { new_node, .. } => {
                Some(*new_node)
            }
            _ => None,
        }
    }
    /// Flatten batches into the individual operations they carry. Conflict analysis and
    /// atomicity checks run over this view
    pub fn atomic_ops(&self) -> Vec<&SceneOp> {
        match self {
            Self::BatchStructure { structure_ops } => structure_ops
                .iter()
                .flat_map(|op| op.atomic_ops())
                .collect(),
            _ => vec![self],
        }
    }
}
