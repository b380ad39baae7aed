/*
 * Created on Tue Jan 23 2024
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

//! Cluster assembly: replicas, the client-facing surface (`submit`, `get`,
//! `ordered_children`) and the background services that keep appliers draining. In the
//! reference configuration every replica hosts every shard, so each shard is carried by
//! `replicas_per_shard` replicas and reads are served by whichever replica currently
//! leads the owning shard.


use {
    crate::engine::{
        config::Configuration,
        core::{NodeId, NodeState, Scene, SceneOp},
        error::{ErrorKind, ReplError, RuntimeResult, TransactionError},
        repl::{
            applier, recovery, ApplyContext, LogRegistry, ReplicaId, ShardId, ShardMap, ShardSet,
        },
        time::{Hlc, HlcClock, ReplicaClock, TickSource},
        txn::{
            coordinator::{self, CommitOutcome, Coordinator},
            PendingTxns, TxnId, TxnStatus,
        },
    },
    parking_lot::Mutex,
    std::{collections::BTreeMap, sync::Arc, time::Duration},
    tokio::{sync::watch, task::JoinHandle},
    uuid::Uuid,
};

/// How often the background sweep collects terminal transaction records
pub const GC_SWEEP_WINDOW: u64 = 5 * 60;

#[derive(Debug)]
struct ReplicaState {
    scene: Scene,
    shard_map: ShardMap,
    txns: PendingTxns,
    applied: BTreeMap<ShardId, u64>,
    crashed: bool,
}

#[derive(Debug)]
/// One cluster replica: its scene view, shard cursors, pending transactions and clock.
/// All state mutations funnel through the state lock, giving the per-replica
/// serialization the state machine relies on
pub struct Replica {
    id: ReplicaId,
    boot_id: Uuid,
    local_shards: ShardSet,
    max_latency: u64,
    clock: ReplicaClock,
    registry: LogRegistry,
    coordinator: Coordinator,
    state: Mutex<ReplicaState>,
}

impl Replica {
    fn new(
        id: ReplicaId,
        config: &Configuration,
        registry: LogRegistry,
        tick: Arc<TickSource>,
    ) -> Self {
        let boot_id = Uuid::new_v4();
        log::info!("replica {id} booting (instance {boot_id})");
        Self {
            id,
            boot_id,
            local_shards: ShardSet::all(config.shards),
            max_latency: config.max_latency,
            clock: HlcClock::new(tick),
            registry,
            coordinator: Coordinator::new(id),
            state: Mutex::new(ReplicaState {
                scene: Scene::empty(config.node_space_cap),
                shard_map: ShardMap::new(),
                txns: PendingTxns::new(),
                applied: BTreeMap::new(),
                crashed: false,
            }),
        }
    }
    pub fn id(&self) -> ReplicaId {
        self.id
    }
    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }
    pub fn is_crashed(&self) -> bool {
        self.state.lock().crashed
    }
    /// Run `f` under the state lock with a fully wired [`ApplyContext`]. Refuses while
    /// crashed
    fn with_ctx<T>(
        &self,
        f: impl FnOnce(&mut ApplyContext<'_>) -> RuntimeResult<T>,
    ) -> RuntimeResult<T> {
        let mut state = self.state.lock();
        if state.crashed {
            return Err(ReplError::Crashed.into());
        }
        let ReplicaState {
            scene,
            shard_map,
            txns,
            applied,
            ..
        } = &mut *state;
        let mut cx = ApplyContext {
            me: self.id,
            local_shards: self.local_shards,
            max_latency: self.max_latency,
            scene,
            shard_map,
            txns,
            applied,
            clock: &self.clock,
            registry: &self.registry,
        };
        f(&mut cx)
    }
    /// Drain every locally replicated shard once, then re-evaluate in-flight
    /// transactions (the coordinator sweep: this is where commit windows expire)
    pub fn pump(&self) -> RuntimeResult<usize> {
        self.with_ctx(|cx| {
            let mut applied = 0;
            let shards: Vec<ShardId> = cx
                .registry
                .shards()
                .filter(|s| cx.local_shards.contains(*s))
                .collect();
            for shard in shards {
                applied += applier::pump_shard(shard, cx)?;
            }
            let committing = cx.txns.committing();
            if !committing.is_empty() {
                // fold physical time into the HLC so drift-window checks see it
                cx.clock.tick();
            }
            for txn_id in committing {
                coordinator::check_parallel_commit(txn_id, cx)?;
            }
            Ok(applied)
        })
    }
    /// Stage a transaction from this replica
    pub fn start_txn(&self, ops: Vec<SceneOp>) -> RuntimeResult<(TxnId, Hlc)> {
        self.with_ctx(|cx| self.coordinator.start(cx, ops))
    }
    pub fn txn_status(&self, txn_id: TxnId) -> Option<TxnStatus> {
        self.state.lock().txns.status(txn_id)
    }
    /// Serve a point read. Leader-only: reads target the leader of the owning shard
    pub fn serve_get(&self, node: NodeId) -> RuntimeResult<NodeState> {
        self.check_leadership(node)?;
        self.with_ctx(|cx| {
            cx.scene
                .node(node)
                .cloned()
                .ok_or_else(|| crate::engine::error::SceneError::NodeNotFound.into())
        })
    }
    /// Serve an ordered-children read. Leader-only
    pub fn serve_ordered_children(&self, node: NodeId) -> RuntimeResult<Vec<NodeId>> {
        self.check_leadership(node)?;
        self.with_ctx(|cx| cx.scene.ordered_children(node))
    }
    fn check_leadership(&self, node: NodeId) -> RuntimeResult<()> {
        let shard = self
            .state
            .lock()
            .shard_map
            .primary(node)
            .ok_or(crate::engine::error::SceneError::NodeNotFound)?;
        match self.registry.get(shard)?.current_leader() {
            Some(leader) if leader == self.id => Ok(()),
            Some(_) => Err(ReplError::NotLeader.into()),
            None => Err(ReplError::NoLeader.into()),
        }
    }
    /// Mark this replica crashed. Its in-memory scene and cursors stay put (the durable
    /// image the recovery replay starts from); it stops serving until recovery
    pub fn crash(&self) {
        log::warn!("replica {} marked crashed", self.id);
        self.state.lock().crashed = true;
    }
    /// Rejoin after a crash: replay everything between the applied cursors and each
    /// shard's commit index, then clear the crashed mark
    pub fn recover(&self) -> RuntimeResult<usize> {
        let mut state = self.state.lock();
        let ReplicaState {
            scene,
            shard_map,
            txns,
            applied,
            crashed,
        } = &mut *state;
        let mut cx = ApplyContext {
            me: self.id,
            local_shards: self.local_shards,
            max_latency: self.max_latency,
            scene,
            shard_map,
            txns,
            applied,
            clock: &self.clock,
            registry: &self.registry,
        };
        let replayed = recovery::replay(&mut cx)?;
        *crashed = false;
        log::info!("replica {} recovered ({replayed} entries replayed)", self.id);
        Ok(replayed)
    }
    /// Collect terminal transaction records older than every transaction still able to
    /// run a conflict check against them
    pub fn gc_txns(&self) -> RuntimeResult<usize> {
        self.with_ctx(|cx| {
            let floor = cx.txns.in_flight_floor().unwrap_or_else(|| cx.clock.peek());
            let watermark = Hlc::new(floor.l().saturating_sub(cx.max_latency), floor.c());
            Ok(cx.txns.gc(watermark))
        })
    }
    /// Validate the local tree invariants. A failure here means this replica must halt
    pub fn verify(&self) -> RuntimeResult<()> {
        self.with_ctx(|cx| cx.scene.verify_tree())
    }
}

#[derive(Debug)]
struct ClusterInner {
    registry: LogRegistry,
    replicas: Vec<Arc<Replica>>,
    tick: Arc<TickSource>,
    max_latency: u64,
}

#[derive(Debug, Clone)]
/// A handle to the whole (in-process) cluster
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Bring up `replicas_per_shard` replicas over `shards` fresh logs, every shard
    /// initially led by replica 0
    pub fn bootstrap(config: &Configuration) -> RuntimeResult<Self> {
        let registry = LogRegistry::bootstrap(config.shards, 0);
        let tick = TickSource::new_shared();
        let replicas = (0..config.replicas_per_shard as ReplicaId)
            .map(|id| {
                Arc::new(Replica::new(
                    id,
                    config,
                    registry.clone(),
                    tick.clone(),
                ))
            })
            .collect();
        Ok(Self {
            inner: Arc::new(ClusterInner {
                registry,
                replicas,
                tick,
                max_latency: config.max_latency,
            }),
        })
    }
    pub fn registry(&self) -> &LogRegistry {
        &self.inner.registry
    }
    pub fn tick_source(&self) -> &Arc<TickSource> {
        &self.inner.tick
    }
    pub fn replica(&self, index: usize) -> &Arc<Replica> {
        &self.inner.replicas[index]
    }
    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.inner.replicas
    }
    fn replica_by_id(&self, id: ReplicaId) -> RuntimeResult<&Arc<Replica>> {
        self.inner
            .replicas
            .iter()
            .find(|r| r.id() == id)
            .ok_or_else(|| ReplError::NoLeader.into())
    }
    fn first_live_replica(&self) -> RuntimeResult<&Arc<Replica>> {
        self.inner
            .replicas
            .iter()
            .find(|r| !r.is_crashed())
            .ok_or_else(|| ReplError::Crashed.into())
    }
    /// Install a new leader for a shard (an election, from the engine's point of view)
    pub fn elect(&self, shard: ShardId, leader: ReplicaId) -> RuntimeResult<()> {
        self.inner.registry.get(shard)?.set_leader(Some(leader));
        Ok(())
    }
    /// Pump every live replica until no replica makes progress
    pub fn settle(&self) -> RuntimeResult<usize> {
        let mut total = 0;
        loop {
            let mut progressed = 0;
            for replica in &self.inner.replicas {
                if replica.is_crashed() {
                    continue;
                }
                progressed += replica.pump()?;
            }
            if progressed == 0 {
                break;
            }
            total += progressed;
        }
        Ok(total)
    }
    /// Submit a transaction and drive it to a terminal status
    pub fn submit(&self, ops: Vec<SceneOp>) -> RuntimeResult<CommitOutcome> {
        let replica = self.first_live_replica()?;
        let (txn_id, hlc) = replica.start_txn(ops)?;
        // bounded: every sweep folds at least one tick into the submitting replica's
        // clock, so the commit window cannot outlive this loop
        for _ in 0..self.inner.max_latency + 4 {
            self.settle()?;
            if let Some(status) = replica.txn_status(txn_id) {
                if status.is_terminal() {
                    return Ok(CommitOutcome {
                        txn_id,
                        status,
                        hlc,
                    });
                }
            }
            self.inner.tick.advance(1);
        }
        Err(TransactionError::HlcWindowExpired.into())
    }
    /// Point read, served by the leader of the shard owning `node`
    pub fn get(&self, node: NodeId) -> RuntimeResult<NodeState> {
        let replica = self.leader_for(node)?;
        replica.serve_get(node)
    }
    /// Ordered children of `node`, served by the leader of the owning shard
    pub fn ordered_children(&self, node: NodeId) -> RuntimeResult<Vec<NodeId>> {
        let replica = self.leader_for(node)?;
        replica.serve_ordered_children(node)
    }
    fn leader_for(&self, node: NodeId) -> RuntimeResult<Arc<Replica>> {
        let probe = self.first_live_replica()?;
        let shard = probe
            .state
            .lock()
            .shard_map
            .primary(node)
            .ok_or(crate::engine::error::SceneError::NodeNotFound)?;
        let leader = self
            .inner
            .registry
            .get(shard)?
            .current_leader()
            .ok_or(ReplError::NoLeader)?;
        Ok(self.replica_by_id(leader)?.clone())
    }
    /// Final drain + invariant verification across live replicas
    pub fn close(&self) -> RuntimeResult<()> {
        self.settle()?;
        for replica in &self.inner.replicas {
            if !replica.is_crashed() {
                replica.verify()?;
            }
        }
        Ok(())
    }
}

/*
    background services
*/

/// Handles to the spawned background services: one applier drainer per (replica, shard)
/// pair plus the transaction-record GC sweep
pub struct ClusterServices {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ClusterServices {
    pub fn start(cluster: Cluster) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut handles = Vec::new();
        let shard_ids: Vec<ShardId> = cluster.registry().shards().collect();
        for (index, _) in cluster.replicas().iter().enumerate() {
            for &shard in &shard_ids {
                let Ok(log) = cluster.registry().get(shard) else {
                    continue;
                };
                let mut commits = log.subscribe_commits();
                let mut shutdown = shutdown_tx.subscribe();
                let cluster = cluster.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            changed = commits.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                let replica = cluster.replica(index).clone();
                                match replica.pump() {
                                    Ok(_) => {}
                                    Err(e)
                                        if matches!(
                                            e.kind(),
                                            ErrorKind::Repl(ReplError::Crashed)
                                        ) => {}
                                    Err(e) => {
                                        // a broken invariant: halt this replica rather
                                        // than let it diverge
                                        log::error!("replica {} halted: {e}", replica.id());
                                        replica.crash();
                                        return;
                                    }
                                }
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }));
            }
        }
        let mut shutdown = shutdown_tx.subscribe();
        let gc_cluster = cluster.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(GC_SWEEP_WINDOW)) => {
                        for replica in gc_cluster.replicas() {
                            match replica.gc_txns() {
                                Ok(0) => {}
                                Ok(n) => log::info!("replica {}: collected {n} transaction record(s)", replica.id()),
                                Err(_) => {}
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }));
        Self {
            shutdown_tx,
            handles,
        }
    }
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
