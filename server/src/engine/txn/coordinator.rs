/*
 * Created on Sat Jan 20 2024
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

//! The parallel-commit coordinator. Starting a transaction stages an intent on the
//! coordinator shard's log and a stub on every other participant's log; the transaction
//! is implicitly committed the moment every participant carries a committed reference,
//! with no second coordinator round trip. The decision is re-evaluated by every applier
//! advance ([`check_parallel_commit`]), which is also where the conflict detector and
//! the HLC drift window are enforced.

use {
    super::{conflict, TxnId, TxnState, TxnStatus},
    crate::engine::{
        core::{Scene, SceneOp, NIL},
        error::{RuntimeResult, SceneError, TransactionError},
        repl::{applier, ApplyContext, Command, LogEntry, LogRegistry, ReplicaId, ShardId, ShardMap, ShardSet},
        time::Hlc,
    },
    std::sync::atomic::{AtomicU64, Ordering},
};

/// How many times an append is retried against a re-read leader before the transaction
/// is given up on
const APPEND_RETRY_LIMIT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a client gets back for a submitted transaction
pub struct CommitOutcome {
    pub txn_id: TxnId,
    pub status: TxnStatus,
    pub hlc: Hlc,
}

#[derive(Debug)]
/// The per-replica transaction coordinator. Only hands out ids and drives the start
/// path; the decision lives in [`check_parallel_commit`]
pub struct Coordinator {
    me: ReplicaId,
    seq: AtomicU64,
}

impl Coordinator {
    pub fn new(me: ReplicaId) -> Self {
        Self {
            me,
            seq: AtomicU64::new(0),
        }
    }
    /// Globally unique: the replica id occupies the high half
    fn next_txn_id(&self) -> TxnId {
        (self.me << 32) | (self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
    /// Validate, expand and stage a transaction. On return the transaction is either
    /// `Committing` (intent and stubs appended) or already `Aborted` (validation or
    /// leader failure); the final status is driven by the appliers
    pub fn start(
        &self,
        cx: &mut ApplyContext<'_>,
        ops: Vec<SceneOp>,
    ) -> RuntimeResult<(TxnId, Hlc)> {
        if ops.is_empty() {
            return Err(TransactionError::EmptyTransaction.into());
        }
        let hlc = cx.clock.tick();
        let txn_id = self.next_txn_id();
        let ops = match expand_ops(cx.scene, cx.shard_map, ops)
            .and_then(|ops| validate_ops(cx.scene, &ops).map(|_| ops))
        {
            Ok(ops) => ops,
            Err(e) => {
                // an operation rejection aborts the enclosing transaction before
                // anything is staged; no state was touched
                log::warn!("txn {txn_id}: rejected ({e})");
                cx.txns.admit(
                    TxnState {
                        txn_id,
                        status: TxnStatus::Aborted,
                        shards: ShardSet::EMPTY,
                        coord_shard: 0,
                        hlc,
                        ops: Vec::new(),
                    },
                    true,
                );
                return Ok((txn_id, hlc));
            }
        };
        let mut shards = participants(cx.scene, cx.shard_map, &ops);
        if shards.is_empty() {
            // pure root creation: route through the first shard
            shards = ShardSet::single(cx.registry.shards().next().unwrap_or(0));
        }
        // deterministic tie-break: the smallest participating shard coordinates
        let coord_shard = ShardSet::min(&shards).unwrap_or(0);
        let state = TxnState {
            txn_id,
            status: TxnStatus::Committing,
            shards,
            coord_shard,
            hlc,
            ops,
        };
        cx.txns.admit(state.clone(), true);
        let mut staged = ShardSet::EMPTY;
        for shard in shards.iter() {
            let cmd = if shard == coord_shard {
                Command::Txn(state.clone())
            } else {
                Command::Commit { txn_id, hlc }
            };
            let entry = LogEntry {
                term: 0,
                shard,
                hlc,
                cmd,
            };
            match append_with_retry(cx.registry, shard, entry) {
                Ok(_) => staged.insert(shard),
                Err(e) => {
                    log::error!("txn {txn_id}: staging on shard {shard} failed ({e}); aborting");
                    cx.txns.transition(txn_id, TxnStatus::Aborted)?;
                    write_abort_records(cx, txn_id, staged);
                    return Ok((txn_id, hlc));
                }
            }
        }
        log::info!(
            "txn {txn_id}: staged on {} shard(s), coordinated by shard {coord_shard}",
            shards.len()
        );
        Ok((txn_id, hlc))
    }
}

/// Evaluate the parallel-commit decision for one transaction. Invoked on every applier
/// advance that touches the transaction and by the periodic coordinator sweep
pub fn check_parallel_commit(
    txn_id: TxnId,
    cx: &mut ApplyContext<'_>,
) -> RuntimeResult<TxnStatus> {
    let Some(record) = cx.txns.get(txn_id) else {
        return Err(TransactionError::UnknownTxn.into());
    };
    let state = record.state.clone();
    let already_applied = record.applied;
    let coordinator_local = record.coordinator_local;
    match state.status {
        TxnStatus::Committed => {
            if !already_applied && refs_applied_locally(&state, cx) {
                apply_committed_ops(&state, cx)?;
            }
            return Ok(TxnStatus::Committed);
        }
        TxnStatus::Aborted => return Ok(TxnStatus::Aborted),
        TxnStatus::Committing => {}
    }
    // a committed abort record anywhere is terminal, whatever else the logs carry
    if cx.registry.has_committed_abort(txn_id) {
        log::warn!("txn {txn_id} aborted (abort record observed)");
        cx.txns.transition(txn_id, TxnStatus::Aborted)?;
        return Ok(TxnStatus::Aborted);
    }
    // implicit commit: every participant must carry a committed reference
    let mut resolvable = true;
    for shard in state.shards.iter() {
        if !cx.registry.get(shard)?.has_committed_ref(txn_id) {
            resolvable = false;
            break;
        }
    }
    if resolvable {
        if conflict::must_abort(cx.scene, cx.registry, cx.txns, &state, cx.max_latency) {
            log::warn!("txn {txn_id} aborted (conflict)");
            abort_txn(txn_id, &state, coordinator_local, cx)?;
            return Ok(TxnStatus::Aborted);
        }
        cx.txns.transition(txn_id, TxnStatus::Committed)?;
        log::info!("txn {txn_id} committed at {:?}", state.hlc);
        if refs_applied_locally(&state, cx) {
            apply_committed_ops(&state, cx)?;
        }
        return Ok(TxnStatus::Committed);
    }
    // unresolved: bound the wait by the HLC drift window
    if Hlc::window_distance(cx.clock.peek(), state.hlc) > cx.max_latency {
        log::warn!(
            "txn {txn_id} aborted (exceeded the {}-tick commit window)",
            cx.max_latency
        );
        abort_txn(txn_id, &state, coordinator_local, cx)?;
        return Ok(TxnStatus::Aborted);
    }
    Ok(TxnStatus::Committing)
}

fn abort_txn(
    txn_id: TxnId,
    state: &TxnState,
    coordinator_local: bool,
    cx: &mut ApplyContext<'_>,
) -> RuntimeResult<()> {
    cx.txns.transition(txn_id, TxnStatus::Aborted)?;
    // only the coordinating replica writes abort records; every other replica reaches
    // the same verdict through them (or through the same deterministic check)
    if coordinator_local {
        write_abort_records(cx, txn_id, state.shards);
    }
    Ok(())
}

fn write_abort_records(cx: &mut ApplyContext<'_>, txn_id: TxnId, shards: ShardSet) {
    for shard in shards.iter() {
        let Ok(log) = cx.registry.get(shard) else {
            continue;
        };
        let entry = LogEntry {
            term: 0,
            shard,
            hlc: cx.clock.tick(),
            cmd: Command::Abort { txn_id },
        };
        if let Err(e) = log.append_forwarded(entry) {
            log::warn!("txn {txn_id}: abort record on shard {shard} not written: {e}");
        }
    }
}

/// Application is gated on the local applied cursors having reached the transaction's
/// reference entry on every locally replicated participant, so a commit decision made
/// early (from another shard's log) cannot reorder ahead of entries that precede the
/// reference in log order
fn refs_applied_locally(state: &TxnState, cx: &ApplyContext<'_>) -> bool {
    for shard in state.shards.iter() {
        if !cx.local_shards.contains(shard) {
            continue;
        }
        let Ok(log) = cx.registry.get(shard) else {
            return false;
        };
        let Some(ref_index) = log.committed_ref_index(state.txn_id) else {
            return false;
        };
        if cx.applied.get(&shard).copied().unwrap_or(0) < ref_index {
            return false;
        }
    }
    true
}

/// Hand the transaction's operations to the scene state machine, in order, exactly once
fn apply_committed_ops(state: &TxnState, cx: &mut ApplyContext<'_>) -> RuntimeResult<()> {
    for op in &state.ops {
        applier::apply_scoped_op(op, state.coord_shard, cx, false)?;
    }
    cx.txns.mark_applied(state.txn_id)
}

fn append_with_retry(
    registry: &LogRegistry,
    shard: ShardId,
    entry: LogEntry,
) -> RuntimeResult<u64> {
    let log = registry.get(shard)?;
    let mut last_err = None;
    for _ in 0..APPEND_RETRY_LIMIT {
        // the leader is re-read on every attempt, so an election between retries is
        // transparent
        match log.append_forwarded(entry.clone()) {
            Ok(index) => return Ok(index),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| crate::engine::error::ReplError::NoLeader.into()))
}

/*
    synthesis
*/

/// Expand client-level operations: a `move_shard` fans out into shard removals, state
/// transfers and the detach/attach pointer rewrites, all under the enclosing
/// transaction so a partially migrated subtree can never become visible
fn expand_ops(
    scene: &Scene,
    shard_map: &ShardMap,
    ops: Vec<SceneOp>,
) -> RuntimeResult<Vec<SceneOp>> {
    let mut expanded = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            SceneOp::MoveShard { node, new_shard } => {
                let closure = scene.descendants(node);
                if closure.is_empty() {
                    return Err(SceneError::NodeNotFound.into());
                }
                let owners = shard_map.owners(node);
                if closure.iter().any(|d| shard_map.owners(*d) != owners) {
                    return Err(SceneError::SubtreeNotColocated.into());
                }
                for d in &closure {
                    expanded.push(SceneOp::ShardRemove { node: *d });
                }
                for d in &closure {
                    let record = scene.node(*d).ok_or(SceneError::NodeNotFound)?;
                    expanded.push(SceneOp::StateTransfer {
                        node: *d,
                        shard: new_shard,
                        state: record.clone(),
                    });
                }
                match scene.parent_of(node) {
                    Some(parent) => {
                        let position = scene
                            .ordered_children(parent)?
                            .iter()
                            .position(|&c| c == node)
                            .unwrap_or(0) as u16;
                        expanded.push(SceneOp::DetachChild {
                            parent,
                            child: node,
                        });
                        expanded.push(SceneOp::AttachChild {
                            parent,
                            child: node,
                            position,
                        });
                    }
                    None => expanded.push(SceneOp::AttachChild {
                        parent: NIL,
                        child: node,
                        position: 0,
                    }),
                }
            }
            other => expanded.push(other),
        }
    }
    Ok(expanded)
}

/// Validate the expanded operation sequence against a scratch copy of the scene. A
/// failure is an operation rejection: the transaction aborts before anything is staged
fn validate_ops(scene: &Scene, ops: &[SceneOp]) -> RuntimeResult<()> {
    let mut scratch = scene.clone();
    for op in ops {
        if scratch.apply(op).is_err() {
            return Err(TransactionError::RejectedOp.into());
        }
    }
    scratch
        .verify_tree()
        .map_err(|_| TransactionError::RejectedOp.into())
}

/// The set of shards a transaction touches
fn participants(scene: &Scene, shard_map: &ShardMap, ops: &[SceneOp]) -> ShardSet {
    let mut shards = ShardSet::EMPTY;
    for op in ops {
        for atomic in op.atomic_ops() {
            shards = shards.union(op_shards(scene, shard_map, atomic));
        }
    }
    shards
}

fn op_shards(scene: &Scene, shard_map: &ShardMap, op: &SceneOp) -> ShardSet {
    match op {
        SceneOp::AddChild { target, .. } | SceneOp::AddSibling { target, .. } => {
            shard_map.owners(*target)
        }
        SceneOp::SetProperty { node, .. } => shard_map.owners(*node),
        SceneOp::RemoveNode { node } => scene
            .descendants(*node)
            .into_iter()
            .fold(ShardSet::EMPTY, |acc, d| acc.union(shard_map.owners(d))),
        SceneOp::MoveSubtree {
            node, new_parent, ..
        } => shard_map.owners(*node).union(shard_map.owners(*new_parent)),
        SceneOp::MoveChild {
            parent, child_node, ..
        } => shard_map
            .owners(*parent)
            .union(shard_map.owners(*child_node)),
        SceneOp::BatchUpdate { updates } => updates
            .iter()
            .fold(ShardSet::EMPTY, |acc, u| acc.union(shard_map.owners(u.node))),
        SceneOp::StateTransfer { shard, .. } => ShardSet::single(*shard),
        SceneOp::ShardRemove { node } => shard_map.owners(*node),
        SceneOp::DetachChild { parent, .. } | SceneOp::AttachChild { parent, .. } => {
            shard_map.owners(*parent)
        }
        SceneOp::MoveShard { .. } | SceneOp::BatchStructure { .. } => ShardSet::EMPTY,
    }
}
