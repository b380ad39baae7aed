/*
 * Created on Wed Jan 17 2024
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

//! The conflict detector: a pure function over a candidate transaction and a snapshot of
//! the committed prefix of every shard log. Two operations conflict when:
//!
//! 1. both write the same property of the same node,
//! 2. either is a tree mutation and the other's node lies in the descendant closure of
//!    the first's (or vice versa),
//! 3. both reposition the same `{parent, child}` pair, or
//! 4. one repositions children of a parent the other adds under (symmetric).
//!
//! A candidate must abort if any of its operations conflicts with any committed entry
//! whose HLC strictly precedes the candidate's, expanding participant stubs through the
//! referenced transaction's operations.

use {
    super::{PendingTxns, TxnState, TxnStatus},
    crate::engine::{
        core::{NodeId, Scene, SceneOp, NIL},
        repl::{Command, LogRegistry},
        time::Hlc,
    },
    std::collections::BTreeSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The conflict-relevant footprint of a single operation
enum Effect<'a> {
    PropWrite { node: NodeId, key: &'a str },
    TreeMut { node: NodeId },
    ChildMove { parent: NodeId, child: NodeId },
    ChildAdd { parent: NodeId },
}

impl<'a> Effect<'a> {
    /// The node this effect is anchored to, for the descendant-closure rule
    fn anchor(&self) -> NodeId {
        match self {
            Self::PropWrite { node, .. } | Self::TreeMut { node } => *node,
            Self::ChildMove { child, .. } => *child,
            Self::ChildAdd { parent } => *parent,
        }
    }
}

/// The effects of one (batch-flattened) operation
fn effects(op: &SceneOp) -> Vec<Effect<'_>> {
    match op {
        SceneOp::SetProperty { node, key, .. } => vec![Effect::PropWrite {
            node: *node,
            key: key.as_str(),
        }],
        SceneOp::BatchUpdate { updates } => updates
            .iter()
            .map(|u| Effect::PropWrite {
                node: u.node,
                key: u.key.as_str(),
            })
            .collect(),
        SceneOp::RemoveNode { node } | SceneOp::MoveSubtree { node, .. } => {
            vec![Effect::TreeMut { node: *node }]
        }
        SceneOp::MoveChild {
            parent, child_node, ..
        } => vec![
            Effect::TreeMut { node: *child_node },
            Effect::ChildMove {
                parent: *parent,
                child: *child_node,
            },
        ],
        SceneOp::AddChild { target, .. } | SceneOp::AddSibling { target, .. } => {
            if *target == NIL {
                // root creation has no parent to collide on
                vec![]
            } else {
                vec![Effect::ChildAdd { parent: *target }]
            }
        }
        // migration primitives rewrite records and pointers wholesale; treat them as
        // tree mutations on their subject so concurrent writes into a migrating
        // subtree collide
        SceneOp::MoveShard { node, .. }
        | SceneOp::StateTransfer { node, .. }
        | SceneOp::ShardRemove { node } => vec![Effect::TreeMut { node: *node }],
        SceneOp::DetachChild { child, .. } | SceneOp::AttachChild { child, .. } => {
            vec![Effect::TreeMut { node: *child }]
        }
        SceneOp::BatchStructure { .. } => vec![],
    }
}

fn pair_conflicts(scene: &Scene, a: Effect<'_>, b: Effect<'_>) -> bool {
    // rule 1
    if let (Effect::PropWrite { node: n1, key: k1 }, Effect::PropWrite { node: n2, key: k2 }) =
        (a, b)
    {
        return n1 == n2 && k1 == k2;
    }
    // rule 3
    if let (
        Effect::ChildMove {
            parent: p1,
            child: c1,
        },
        Effect::ChildMove {
            parent: p2,
            child: c2,
        },
    ) = (a, b)
    {
        if p1 == p2 && c1 == c2 {
            return true;
        }
    }
    // rule 4, applied symmetrically
    match (a, b) {
        (Effect::ChildMove { parent, .. }, Effect::ChildAdd { parent: added })
        | (Effect::ChildAdd { parent: added }, Effect::ChildMove { parent, .. }) => {
            if parent == added {
                return true;
            }
        }
        _ => {}
    }
    // rule 2: the non-mutating side's node must fall inside the mutated subtree
    for (mutation, other) in [(a, b), (b, a)] {
        if let Effect::TreeMut { node } = mutation {
            if scene.descendants(node).contains(&other.anchor()) {
                return true;
            }
        }
    }
    false
}

/// Whether two operations conflict under the rules above. Symmetric
pub fn ops_conflict(scene: &Scene, a: &SceneOp, b: &SceneOp) -> bool {
    a.atomic_ops().iter().any(|&x| {
        b.atomic_ops()
            .iter()
            .any(|&y| conflict_atomic(scene, x, y))
    })
}

fn conflict_atomic(scene: &Scene, a: &SceneOp, b: &SceneOp) -> bool {
    effects(a)
        .into_iter()
        .any(|ea| effects(b).into_iter().any(|eb| pair_conflicts(scene, ea, eb)))
}

/// Decide whether `candidate` must abort given the committed prefixes in `registry`.
/// Pure and deterministic on the snapshot it is handed.
///
/// Only entries inside the `max_latency` drift window count: anything older is
/// causally settled (its effects were visible when the candidate was validated) and is
/// exactly the set of records the GC watermark is allowed to collect
pub fn must_abort(
    scene: &Scene,
    registry: &LogRegistry,
    txns: &PendingTxns,
    candidate: &TxnState,
    max_latency: u64,
) -> bool {
    let mut expanded = BTreeSet::new();
    let mut committed_ops: Vec<SceneOp> = Vec::new();
    for shard in registry.shards() {
        let Ok(log) = registry.get(shard) else { continue };
        for entry in log.committed_entries() {
            if entry.hlc >= candidate.hlc
                || Hlc::window_distance(candidate.hlc, entry.hlc) > max_latency
            {
                continue;
            }
            match entry.cmd {
                Command::Scene(op) => committed_ops.push(op),
                Command::Txn(state) => {
                    if state.txn_id != candidate.txn_id
                        && expanded.insert(state.txn_id)
                        && !is_aborted(state.txn_id, txns, registry)
                    {
                        committed_ops.extend(state.ops);
                    }
                }
                Command::Commit { txn_id, .. } => {
                    if txn_id != candidate.txn_id
                        && expanded.insert(txn_id)
                        && !is_aborted(txn_id, txns, registry)
                    {
                        if let Some(state) = registry.find_committed_intent(txn_id) {
                            committed_ops.extend(state.ops);
                        }
                    }
                }
                Command::Abort { .. } => {}
            }
        }
    }
    candidate
        .ops
        .iter()
        .any(|mine| committed_ops.iter().any(|theirs| ops_conflict(scene, mine, theirs)))
}

/// A referenced transaction's operations are excluded from the conflict scan once it is
/// known aborted: they will never touch the scene
fn is_aborted(txn_id: u64, txns: &PendingTxns, registry: &LogRegistry) -> bool {
    txns.status(txn_id) == Some(TxnStatus::Aborted) || registry.has_committed_abort(txn_id)
}
