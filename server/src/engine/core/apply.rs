/*
 * Created on Sat Jan 13 2024
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

//! Deterministic application of scene operations. Apply functions are strict: an
//! operation that references a missing node errors instead of silently diverging, with
//! two documented exceptions (`move_child` with invalid input and invalid nested edits
//! inside a `batch_structure`, both of which are no-ops).

use {
    super::{Link, NodeId, NodeState, PropertyUpdate, Scene, SceneOp, NIL},
    crate::engine::error::{RuntimeResult, SceneError},
    std::collections::BTreeMap,
};

impl Scene {
    /// Apply one operation. The caller (the applier loop) serializes invocations per
    /// shard, so no locking happens at this level
    pub fn apply(&mut self, op: &SceneOp) -> RuntimeResult<()> {
        match op {
            SceneOp::AddChild {
                target,
                new_node,
                properties,
            } => self.apply_add_child(*target, *new_node, properties.clone()),
            SceneOp::AddSibling {
                target,
                new_node,
                properties,
            } => self.apply_add_sibling(*target, *new_node, properties.clone()),
            SceneOp::RemoveNode { node } => self.apply_remove_node(*node),
            SceneOp::SetProperty { node, key, value } => {
                self.apply_set_property(*node, key.clone(), value.clone())
            }
            SceneOp::MoveSubtree {
                node,
                new_parent,
                new_sibling,
            } => self.apply_move_subtree(*node, *new_parent, *new_sibling),
            SceneOp::MoveChild {
                parent,
                child_node,
                to_index,
            } => self.apply_move_child(*parent, *child_node, *to_index),
            SceneOp::BatchUpdate { updates } => self.apply_batch_update(updates),
            SceneOp::BatchStructure { structure_ops } => {
                self.apply_batch_structure(structure_ops)
            }
            SceneOp::StateTransfer { node, state, .. } => self.install(*node, state.clone()),
            SceneOp::ShardRemove { node } => {
                self.evict(*node);
                Ok(())
            }
            SceneOp::DetachChild { child, .. } => self.detach_splice(*child),
            SceneOp::AttachChild {
                parent,
                child,
                position,
            } => self.apply_attach_child(*parent, *child, *position),
            // a bare move_shard never reaches the state machine: the coordinator
            // synthesizes it into the four primitives above
            SceneOp::MoveShard { .. } => Ok(()),
        }
    }

    fn apply_add_child(
        &mut self,
        target: NodeId,
        new_node: NodeId,
        properties: BTreeMap<String, String>,
    ) -> RuntimeResult<()> {
        self.check_id(new_node)?;
        if self.contains(new_node) {
            return Err(SceneError::NodeAlreadyExists.into());
        }
        if target == NIL {
            // root creation: install a standalone node
            return self.install(new_node, NodeState::with_properties(properties));
        }
        let former_first = self.require(target)?.left_child();
        self.install(
            new_node,
            NodeState::assemble(NIL, former_first, properties),
        )?;
        self.node_mut(target)?.left_child = new_node;
        Ok(())
    }

    fn apply_add_sibling(
        &mut self,
        target: NodeId,
        new_node: NodeId,
        properties: BTreeMap<String, String>,
    ) -> RuntimeResult<()> {
        self.check_id(new_node)?;
        if self.contains(new_node) {
            return Err(SceneError::NodeAlreadyExists.into());
        }
        let successor = self.require(target)?.right_sibling();
        self.install(new_node, NodeState::assemble(NIL, successor, properties))?;
        self.node_mut(target)?.right_sibling = new_node;
        Ok(())
    }

    fn apply_remove_node(&mut self, node: NodeId) -> RuntimeResult<()> {
        if !self.contains(node) {
            // the record may have already migrated or been removed upstream
            return Ok(());
        }
        let removed = self.descendants(node);
        for dead in &removed {
            self.evict(*dead);
        }
        // rewrite any surviving pointer into the removed set (this includes the old
        // parent's pointer to `node`)
        let cap = self.cap();
        for id in 1..=cap {
            let Some(slot) = self.slots[id as usize].as_mut() else {
                continue;
            };
            if removed.contains(&slot.left_child) {
                slot.left_child = NIL;
            }
            if removed.contains(&slot.right_sibling) {
                slot.right_sibling = NIL;
            }
        }
        Ok(())
    }

    fn apply_set_property(
        &mut self,
        node: NodeId,
        key: String,
        value: String,
    ) -> RuntimeResult<()> {
        self.node_mut(node)?.set_property(key, value);
        Ok(())
    }

    fn apply_move_subtree(
        &mut self,
        node: NodeId,
        new_parent: NodeId,
        new_sibling: NodeId,
    ) -> RuntimeResult<()> {
        self.require(node)?;
        self.require(new_parent)?;
        if self.descendants(node).contains(&new_parent) {
            // moving a subtree under itself would cycle the tree
            return Err(SceneError::TreeInvariantViolation.into());
        }
        self.detach_splice(node)?;
        if new_sibling != NIL {
            if !self.ordered_children(new_parent)?.contains(&new_sibling) {
                return Err(SceneError::NodeNotFound.into());
            }
            let successor = self.require(new_sibling)?.right_sibling();
            self.node_mut(node)?.right_sibling = successor;
            self.node_mut(new_sibling)?.right_sibling = node;
        } else {
            let former_first = self.require(new_parent)?.left_child();
            self.node_mut(node)?.right_sibling = former_first;
            self.node_mut(new_parent)?.left_child = node;
        }
        Ok(())
    }

    fn apply_move_child(
        &mut self,
        parent: NodeId,
        child_node: NodeId,
        to_index: i32,
    ) -> RuntimeResult<()> {
        if !self.contains(parent) {
            return Ok(());
        }
        let children = self.ordered_children(parent)?;
        let index = if to_index >= 0 {
            to_index as i64
        } else {
            children.len() as i64 + to_index as i64
        };
        if !children.contains(&child_node) || index < 0 || index >= children.len() as i64 {
            return Ok(());
        }
        let mut reordered: Vec<NodeId> =
            children.into_iter().filter(|&c| c != child_node).collect();
        reordered.insert((index as usize).min(reordered.len()), child_node);
        self.rebuild_children(parent, &reordered)
    }

    fn apply_batch_update(&mut self, updates: &[PropertyUpdate]) -> RuntimeResult<()> {
        for PropertyUpdate { node, key, value } in updates {
            self.apply_set_property(*node, key.clone(), value.clone())?;
        }
        Ok(())
    }

    fn apply_batch_structure(&mut self, structure_ops: &[SceneOp]) -> RuntimeResult<()> {
        for op in structure_ops {
            // an invalid nested edit is a no-op, matching the top-level `move_child`
            // policy; a later edit observes the effects of earlier ones
            if let Err(e) = self.apply(op) {
                log::warn!("skipping invalid edit in structure batch: {e}");
            }
        }
        Ok(())
    }

    fn apply_attach_child(
        &mut self,
        parent: NodeId,
        child: NodeId,
        position: u16,
    ) -> RuntimeResult<()> {
        if parent == NIL {
            // the migrated subtree is the whole tree; its record was installed by the
            // preceding state transfer
            return Ok(());
        }
        self.require(child)?;
        let children = self.ordered_children(parent)?;
        let mut reordered: Vec<NodeId> =
            children.into_iter().filter(|&c| c != child).collect();
        reordered.insert((position as usize).min(reordered.len()), child);
        self.rebuild_children(parent, &reordered)
    }

    /*
        pointer surgery
    */

    /// Remove `node` from its position by rewriting the unique pointer that references
    /// it to `node.right_sibling`, keeping the remaining sibling chain intact
    pub(in crate::engine::core) fn detach_splice(&mut self, node: NodeId) -> RuntimeResult<()> {
        let successor = self.require(node)?.right_sibling();
        match self.referencing_link(node) {
            Some((referrer, Link::LeftChild)) => {
                self.node_mut(referrer)?.left_child = successor;
            }
            Some((referrer, Link::RightSibling)) => {
                self.node_mut(referrer)?.right_sibling = successor;
            }
            // a root has no referrer
            None => {}
        }
        self.node_mut(node)?.right_sibling = NIL;
        Ok(())
    }

    /// Rewrite `parent.left_child` and every involved `right_sibling` so the child chain
    /// matches `children` exactly
    fn rebuild_children(&mut self, parent: NodeId, children: &[NodeId]) -> RuntimeResult<()> {
        self.node_mut(parent)?.left_child = children.first().copied().unwrap_or(NIL);
        for window in children.windows(2) {
            self.node_mut(window[0])?.right_sibling = window[1];
        }
        if let Some(last) = children.last() {
            self.node_mut(*last)?.right_sibling = NIL;
        }
        Ok(())
    }
}
