/*
 * Created on Fri Jan 19 2024
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

//! The per-(replica, shard) applier: advances the applied index through the committed
//! prefix, dispatching each entry to the scene state machine or the pending-transaction
//! table exactly once. All scene mutations of a replica funnel through here, serialized
//! by the replica state lock, so the state machine itself needs no further locking.

use {
    super::{Command, LogEntry, LogRegistry, ReplicaId, ShardId, ShardMap, ShardSet},
    crate::engine::{
        core::{NodeId, Scene, SceneOp, NIL},
        error::{ErrorKind, RuntimeResult, TransactionError},
        time::ReplicaClock,
        txn::{coordinator, PendingTxns, TxnStatus},
    },
    std::collections::BTreeMap,
};

/// Everything an applier (or the coordinator machinery it calls into) touches on one
/// replica. Constructed under the replica state lock
pub struct ApplyContext<'a> {
    pub me: ReplicaId,
    pub local_shards: ShardSet,
    pub max_latency: u64,
    pub scene: &'a mut Scene,
    pub shard_map: &'a mut ShardMap,
    pub txns: &'a mut PendingTxns,
    /// per-shard applied cursors: the highest log position reflected in local state
    pub applied: &'a mut BTreeMap<ShardId, u64>,
    pub clock: &'a ReplicaClock,
    pub registry: &'a LogRegistry,
}

/// Drain newly committed entries of `shard` into local state. Returns how many entries
/// were applied. Each committed entry is applied exactly once per replica per shard
pub fn pump_shard(shard: ShardId, cx: &mut ApplyContext<'_>) -> RuntimeResult<usize> {
    let log = cx.registry.get(shard)?.clone();
    let mut applied_now = 0;
    loop {
        let cursor = cx.applied.get(&shard).copied().unwrap_or(0);
        if cursor >= log.commit_index() {
            break;
        }
        let entry = log.entry(cursor + 1).ok_or_else(|| {
            crate::engine::Error::with_kind(ErrorKind::Other(format!(
                "shard {shard}: committed entry {} is unreadable",
                cursor + 1
            )))
        })?;
        // receive-side HLC join, then advance the cursor so ready-checks against the
        // applied index include the entry being dispatched
        cx.clock.observe(entry.hlc);
        cx.applied.insert(shard, cursor + 1);
        dispatch(entry, cx)?;
        applied_now += 1;
    }
    Ok(applied_now)
}

fn dispatch(entry: LogEntry, cx: &mut ApplyContext<'_>) -> RuntimeResult<()> {
    match entry.cmd {
        Command::Scene(op) => apply_scoped_op(&op, entry.shard, cx, false),
        Command::Txn(state) => {
            let txn_id = state.txn_id;
            cx.txns.admit(state, false);
            coordinator::check_parallel_commit(txn_id, cx).map(|_| ())
        }
        Command::Commit { txn_id, .. } => {
            if !cx.txns.contains(txn_id) {
                // a stub can arrive before this replica pumps the coordinator shard;
                // resolve the intent from the committed prefixes if it is out already
                if let Some(state) = cx.registry.find_committed_intent(txn_id) {
                    cx.txns.admit(state, false);
                }
            }
            if cx.txns.contains(txn_id) {
                coordinator::check_parallel_commit(txn_id, cx)?;
            }
            Ok(())
        }
        Command::Abort { txn_id } => match cx.txns.status(txn_id) {
            Some(TxnStatus::Committing) => cx.txns.transition(txn_id, TxnStatus::Aborted),
            // a committed transaction can never be aborted after the fact; this replica
            // has diverged and must halt
            Some(TxnStatus::Committed) => Err(TransactionError::AlreadyTerminal.into()),
            Some(TxnStatus::Aborted) | None => Ok(()),
        },
    }
}

/// Apply one operation, honoring shard scope, and keep the shard map in step. With
/// `lenient` set (nested edits of a `batch_structure`) an invalid operation is skipped
/// instead of propagated
pub(crate) fn apply_scoped_op(
    op: &SceneOp,
    origin: ShardId,
    cx: &mut ApplyContext<'_>,
    lenient: bool,
) -> RuntimeResult<()> {
    match op {
        // a bare move_shard never reaches a log; the coordinator expands it
        SceneOp::MoveShard { .. } => return Ok(()),
        SceneOp::BatchStructure { structure_ops } => {
            for inner in structure_ops {
                apply_scoped_op(inner, origin, cx, true)?;
            }
            return Ok(());
        }
        _ => {}
    }
    // the removal closure must be captured before the scene mutates
    let removed = match op {
        SceneOp::RemoveNode { node } => cx.scene.descendants(*node),
        _ => Vec::new(),
    };
    if op_in_scope(op, cx) {
        match cx.scene.apply(op) {
            Ok(()) => {}
            Err(e) if lenient => {
                log::warn!("skipping invalid edit in structure batch: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
    update_shard_map(op, origin, &removed, cx.shard_map);
    Ok(())
}

/// Whether this replica applies `op` to its scene: the operation's node must be in
/// shard-map scope of a locally replicated shard
fn op_in_scope(op: &SceneOp, cx: &ApplyContext<'_>) -> bool {
    let local = cx.local_shards;
    let owned_locally = |node: NodeId| cx.shard_map.owners(node).intersects(&local);
    match op {
        SceneOp::AddChild { target, .. } => *target == NIL || owned_locally(*target),
        SceneOp::AddSibling { target, .. } => owned_locally(*target),
        SceneOp::RemoveNode { node }
        | SceneOp::SetProperty { node, .. }
        | SceneOp::MoveSubtree { node, .. }
        | SceneOp::ShardRemove { node } => owned_locally(*node),
        SceneOp::MoveChild { child_node, .. } => owned_locally(*child_node),
        SceneOp::BatchUpdate { updates } => updates.iter().any(|u| owned_locally(u.node)),
        SceneOp::StateTransfer { shard, .. } => local.contains(*shard),
        SceneOp::DetachChild { parent, .. } => owned_locally(*parent),
        SceneOp::AttachChild { parent, .. } => *parent == NIL || owned_locally(*parent),
        SceneOp::BatchStructure { .. } | SceneOp::MoveShard { .. } => false,
    }
}

/// Shard-map bookkeeping mirroring a successfully applied operation. Creation inherits
/// the target's owners (the origin shard for root creation); migration deliveries move
/// ownership to the destination shard
fn update_shard_map(op: &SceneOp, origin: ShardId, removed: &[NodeId], map: &mut ShardMap) {
    match op {
        SceneOp::AddChild {
            target, new_node, ..
        } => {
            let owners = if *target == NIL {
                ShardSet::single(origin)
            } else {
                map.owners(*target)
            };
            map.assign(*new_node, owners);
        }
        SceneOp::AddSibling {
            target, new_node, ..
        } => {
            let owners = map.owners(*target);
            map.assign(*new_node, owners);
        }
        SceneOp::RemoveNode { .. } => {
            for node in removed {
                map.unassign(*node);
            }
        }
        SceneOp::StateTransfer { node, shard, .. } => {
            map.assign(*node, ShardSet::single(*shard));
        }
        SceneOp::ShardRemove { node } => {
            map.unassign(*node);
        }
        _ => {}
    }
}
