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

//! The scene state machine: a deterministic applier of scene operations against a
//! left-child/right-sibling (LCRS) tree.
//!
//! The tree lives in an arena indexed by node id. The ordered children of a parent are
//! obtained by following `left_child` and then chaining `right_sibling` until the nil
//! sentinel. All traversals are explicit work-lists; nothing here recurses, so the
//! descendant closure is safe on any tree the node space admits and is reused verbatim
//! by the conflict detector.

mod apply;
mod op;
#[cfg(test)]
mod tests;

pub use op::{PropertyUpdate, SceneOp};

use {
    crate::engine::error::{RuntimeResult, SceneError},
    std::collections::BTreeMap,
};

/// A scene node id. Ids live in `1..=cap`; [`NIL`] is the "no node" sentinel
pub type NodeId = u16;
/// The distinguished "no node" sentinel
pub const NIL: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which pointer of a referencing node points at a given node
pub enum Link {
    LeftChild,
    RightSibling,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// A single scene node record. This is also the unit shipped wholesale by a
/// `state_transfer` during shard migration
pub struct NodeState {
    left_child: NodeId,
    right_sibling: NodeId,
    properties: BTreeMap<String, String>,
}

impl NodeState {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_links(left_child: NodeId, right_sibling: NodeId) -> Self {
        Self {
            left_child,
            right_sibling,
            properties: BTreeMap::new(),
        }
    }
    pub fn with_properties(properties: BTreeMap<String, String>) -> Self {
        Self {
            left_child: NIL,
            right_sibling: NIL,
            properties,
        }
    }
    pub fn assemble(
        left_child: NodeId,
        right_sibling: NodeId,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            left_child,
            right_sibling,
            properties,
        }
    }
    pub fn left_child(&self) -> NodeId {
        self.left_child
    }
    pub fn right_sibling(&self) -> NodeId {
        self.right_sibling
    }
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|v| v.as_str())
    }
    pub(in crate::engine::core) fn set_property(&mut self, key: String, value: String) {
        self.properties.insert(key, value);
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The scene tree of one replica: an arena of node slots keyed by node id. A vacant slot
/// means "no such node"
pub struct Scene {
    slots: Vec<Option<NodeState>>,
}

impl Scene {
    /// An empty scene admitting node ids `1..=cap`
    pub fn empty(cap: NodeId) -> Self {
        Self {
            slots: vec![None; cap as usize + 1],
        }
    }
    pub fn cap(&self) -> NodeId {
        (self.slots.len() - 1) as NodeId
    }
    fn check_id(&self, node: NodeId) -> RuntimeResult<()> {
        if node == NIL || node as usize >= self.slots.len() {
            return Err(SceneError::NodeIdOutOfRange.into());
        }
        Ok(())
    }
    pub fn contains(&self, node: NodeId) -> bool {
        node != NIL
            && (node as usize) < self.slots.len()
            && self.slots[node as usize].is_some()
    }
    pub fn node(&self, node: NodeId) -> Option<&NodeState> {
        if node == NIL || node as usize >= self.slots.len() {
            return None;
        }
        self.slots[node as usize].as_ref()
    }
    fn node_mut(&mut self, node: NodeId) -> RuntimeResult<&mut NodeState> {
        self.check_id(node)?;
        self.slots[node as usize]
            .as_mut()
            .ok_or_else(|| SceneError::NodeNotFound.into())
    }
    fn require(&self, node: NodeId) -> RuntimeResult<&NodeState> {
        self.check_id(node)?;
        self.slots[node as usize]
            .as_ref()
            .ok_or_else(|| SceneError::NodeNotFound.into())
    }
    /// Install (or wholesale replace) a node record. This is the authoritative
    /// representation post-migration
    pub fn install(&mut self, node: NodeId, state: NodeState) -> RuntimeResult<()> {
        self.check_id(node)?;
        self.slots[node as usize] = Some(state);
        Ok(())
    }
    /// Drop a node record without touching any pointer that may reference it
    pub fn evict(&mut self, node: NodeId) {
        if node != NIL && (node as usize) < self.slots.len() {
            self.slots[node as usize] = None;
        }
    }
    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, s)| s.as_ref().map(|_| id as NodeId))
    }

    /*
        traversal
    */

    /// The node (if any) whose `left_child` or `right_sibling` references `node`. In a
    /// valid tree there is at most one
    pub fn referencing_link(&self, node: NodeId) -> Option<(NodeId, Link)> {
        if node == NIL {
            return None;
        }
        for (id, slot) in self.slots.iter().enumerate() {
            let Some(s) = slot else { continue };
            if s.left_child == node {
                return Some((id as NodeId, Link::LeftChild));
            }
            if s.right_sibling == node {
                return Some((id as NodeId, Link::RightSibling));
            }
        }
        None
    }
    /// The parent of `node` under the LCRS encoding: walk `right_sibling` back-references
    /// until a `left_child` reference is found
    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        let mut current = node;
        // bounded by the arena size; a longer walk means the chain is cyclic
        for _ in 0..self.slots.len() {
            match self.referencing_link(current)? {
                (p, Link::LeftChild) => return Some(p),
                (p, Link::RightSibling) => current = p,
            }
        }
        None
    }
    /// The ordered children of `parent`: `left_child`, then the `right_sibling` chain
    pub fn ordered_children(&self, parent: NodeId) -> RuntimeResult<Vec<NodeId>> {
        let mut children = Vec::new();
        let mut current = self.require(parent)?.left_child;
        while current != NIL {
            if children.len() > self.slots.len() {
                return Err(SceneError::TreeInvariantViolation.into());
            }
            children.push(current);
            current = self.require(current)?.right_sibling;
        }
        Ok(children)
    }
    /// The descendant closure of `node` (inclusive), via an explicit work-list
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        if !self.contains(node) {
            return Vec::new();
        }
        // `pending` doubles as the cycle guard: a corrupted sibling chain revisits a
        // marked node and the walk terminates instead of spinning
        let mut pending = vec![false; self.slots.len()];
        pending[node as usize] = true;
        let mut closure = Vec::new();
        let mut worklist = vec![node];
        while let Some(current) = worklist.pop() {
            closure.push(current);
            let mut child = self.node(current).map(|s| s.left_child).unwrap_or(NIL);
            while child != NIL && !pending[child as usize] {
                pending[child as usize] = true;
                worklist.push(child);
                child = self.node(child).map(|s| s.right_sibling).unwrap_or(NIL);
            }
        }
        closure
    }
    /// All live nodes that no other node references
    pub fn roots(&self) -> Vec<NodeId> {
        let mut referenced = vec![false; self.slots.len()];
        for slot in self.slots.iter().flatten() {
            if slot.left_child != NIL {
                referenced[slot.left_child as usize] = true;
            }
            if slot.right_sibling != NIL {
                referenced[slot.right_sibling as usize] = true;
            }
        }
        self.live_nodes()
            .filter(|&n| !referenced[n as usize])
            .collect()
    }

    /*
        validation
        ---
        A failed check here is fatal for the owning replica: it halts rather than
        diverging from its peers.
    */

    /// Check the LCRS invariants: every pointer targets a live node, every non-root node
    /// is referenced exactly once, there is exactly one root (if the scene is nonempty)
    /// and every live node is reachable from it
    pub fn verify_tree(&self) -> RuntimeResult<()> {
        let live: Vec<NodeId> = self.live_nodes().collect();
        if live.is_empty() {
            return Ok(());
        }
        let mut ref_count = vec![0usize; self.slots.len()];
        for slot in self.slots.iter().flatten() {
            for link in [slot.left_child, slot.right_sibling] {
                if link == NIL {
                    continue;
                }
                if !self.contains(link) {
                    // dangling pointer
                    return Err(SceneError::TreeInvariantViolation.into());
                }
                ref_count[link as usize] += 1;
            }
        }
        if live.iter().any(|&n| ref_count[n as usize] > 1) {
            return Err(SceneError::TreeInvariantViolation.into());
        }
        let roots: Vec<NodeId> = live
            .iter()
            .copied()
            .filter(|&n| ref_count[n as usize] == 0)
            .collect();
        if roots.len() != 1 {
            return Err(SceneError::TreeInvariantViolation.into());
        }
        // reachability from the root covers the live set iff there are no cycles
        let mut seen = vec![false; self.slots.len()];
        let mut worklist = vec![roots[0]];
        let mut reached = 0usize;
        while let Some(current) = worklist.pop() {
            if seen[current as usize] {
                continue;
            }
            seen[current as usize] = true;
            reached += 1;
            let Some(slot) = self.node(current) else {
                return Err(SceneError::TreeInvariantViolation.into());
            };
            for link in [slot.left_child, slot.right_sibling] {
                if link != NIL {
                    worklist.push(link);
                }
            }
        }
        if reached != live.len() {
            return Err(SceneError::TreeInvariantViolation.into());
        }
        Ok(())
    }
}
