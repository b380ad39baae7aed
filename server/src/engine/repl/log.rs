/*
 * Created on Thu Jan 18 2024
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

//! The in-process implementation of the consensus contract: one shared log per shard,
//! replicas attach through [`LogHandle`]s. Commit-index advancement can be paused per
//! shard, which is how slow participants and partitions are emulated (the paused log
//! keeps accepting appends but nothing past the pause point commits until resume).

use {
    super::{Command, ConsensusLog, LogEntry, ReplicaId, ShardId},
    crate::engine::{
        error::{ReplError, RuntimeResult},
        txn::TxnId,
    },
    parking_lot::RwLock,
    std::{collections::BTreeMap, sync::Arc},
    tokio::sync::watch,
};

#[derive(Debug)]
struct LogState {
    entries: Vec<LogEntry>,
    term: u64,
    leader: Option<ReplicaId>,
    commit_index: u64,
    paused: bool,
}

#[derive(Debug)]
/// A single shard's replicated log
pub struct InProcessLog {
    shard: ShardId,
    state: RwLock<LogState>,
    commit_tx: watch::Sender<u64>,
    leader_tx: watch::Sender<Option<ReplicaId>>,
}

impl InProcessLog {
    pub fn new(shard: ShardId, leader: ReplicaId) -> Arc<Self> {
        let (commit_tx, _) = watch::channel(0);
        let (leader_tx, _) = watch::channel(Some(leader));
        Arc::new(Self {
            shard,
            state: RwLock::new(LogState {
                entries: Vec::new(),
                term: 1,
                leader: Some(leader),
                commit_index: 0,
                paused: false,
            }),
            commit_tx,
            leader_tx,
        })
    }
    pub fn shard(&self) -> ShardId {
        self.shard
    }
    /// Append on behalf of `replica`. Fails with `NotLeader` unless `replica` currently
    /// leads this shard. The entry's term is stamped here
    pub fn append_as(&self, replica: ReplicaId, mut entry: LogEntry) -> RuntimeResult<u64> {
        let mut state = self.state.write();
        match state.leader {
            Some(leader) if leader == replica => {}
            Some(_) => return Err(ReplError::NotLeader.into()),
            None => return Err(ReplError::NoLeader.into()),
        }
        entry.term = state.term;
        entry.shard = self.shard;
        state.entries.push(entry);
        if !state.paused {
            state.commit_index = state.entries.len() as u64;
            let _ = self.commit_tx.send(state.commit_index);
        }
        Ok(state.entries.len() as u64)
    }
    /// Append by routing through whatever replica currently leads this shard. This is
    /// the path a coordinator takes for shards it does not lead itself
    pub fn append_forwarded(&self, entry: LogEntry) -> RuntimeResult<u64> {
        let leader = self
            .state
            .read()
            .leader
            .ok_or(ReplError::NoLeader)?;
        self.append_as(leader, entry)
    }
    pub fn commit_index(&self) -> u64 {
        self.state.read().commit_index
    }
    pub fn len(&self) -> u64 {
        self.state.read().entries.len() as u64
    }
    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.state.read().entries.get(index as usize - 1).cloned()
    }
    pub fn current_leader(&self) -> Option<ReplicaId> {
        self.state.read().leader
    }
    pub fn current_term(&self) -> u64 {
        self.state.read().term
    }
    /// Install a new leader (or none), bumping the term. Emulates an election
    pub fn set_leader(&self, leader: Option<ReplicaId>) {
        let mut state = self.state.write();
        state.term += 1;
        state.leader = leader;
        let _ = self.leader_tx.send(leader);
        log::info!(
            "shard {}: leader changed to {:?} (term {})",
            self.shard,
            leader,
            state.term
        );
    }
    pub fn subscribe_leader(&self) -> watch::Receiver<Option<ReplicaId>> {
        self.leader_tx.subscribe()
    }
    /// Freeze commit-index advancement. Appends still land but stay uncommitted
    pub fn pause(&self) {
        self.state.write().paused = true;
    }
    /// Resume commit-index advancement, committing everything appended meanwhile
    pub fn resume(&self) {
        let mut state = self.state.write();
        state.paused = false;
        state.commit_index = state.entries.len() as u64;
        let _ = self.commit_tx.send(state.commit_index);
    }
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }
    /// The committed prefix as a snapshot. Identical across replicas by the consensus
    /// safety contract
    pub fn committed_entries(&self) -> Vec<LogEntry> {
        let state = self.state.read();
        state.entries[..state.commit_index as usize].to_vec()
    }
    /// Whether the committed prefix carries an entry referencing `txn_id`
    pub fn has_committed_ref(&self, txn_id: TxnId) -> bool {
        self.committed_ref_index(txn_id).is_some()
    }
    /// The (1-based) position of the first committed entry referencing `txn_id`
    pub fn committed_ref_index(&self, txn_id: TxnId) -> Option<u64> {
        let state = self.state.read();
        state.entries[..state.commit_index as usize]
            .iter()
            .position(|e| e.cmd.txn_ref() == Some(txn_id))
            .map(|i| i as u64 + 1)
    }
}

#[derive(Debug, Clone)]
/// A replica's handle to one shard's log: the [`ConsensusLog`] implementation handed to
/// the engine
pub struct LogHandle {
    log: Arc<InProcessLog>,
    me: ReplicaId,
}

impl LogHandle {
    pub fn new(log: Arc<InProcessLog>, me: ReplicaId) -> Self {
        Self { log, me }
    }
}

impl ConsensusLog for LogHandle {
    fn append(&self, entry: LogEntry) -> RuntimeResult<u64> {
        self.log.append_as(self.me, entry)
    }
    fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }
    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.log.entry(index)
    }
    fn current_leader(&self) -> Option<ReplicaId> {
        self.log.current_leader()
    }
    fn current_term(&self) -> u64 {
        self.log.current_term()
    }
    fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.log.subscribe_commits()
    }
    fn subscribe_leader(&self) -> watch::Receiver<Option<ReplicaId>> {
        self.log.subscribe_leader()
    }
}

#[derive(Debug, Clone)]
/// All shard logs of the cluster. Replicas share one registry; the committed prefixes it
/// exposes are what the parallel-commit check and the conflict detector read
pub struct LogRegistry {
    logs: BTreeMap<ShardId, Arc<InProcessLog>>,
}

impl LogRegistry {
    /// Build a registry with `shard_count` logs, every shard initially led by `leader`
    pub fn bootstrap(shard_count: u16, leader: ReplicaId) -> Self {
        let logs = (0..shard_count)
            .map(|shard| (shard, InProcessLog::new(shard, leader)))
            .collect();
        Self { logs }
    }
    pub fn shard_count(&self) -> u16 {
        self.logs.len() as u16
    }
    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.logs.keys().copied()
    }
    pub fn get(&self, shard: ShardId) -> RuntimeResult<&Arc<InProcessLog>> {
        self.logs
            .get(&shard)
            .ok_or_else(|| ReplError::UnknownShard.into())
    }
    /// Whether any shard's committed prefix carries an abort record for `txn_id`. An
    /// abort record anywhere is terminal for the transaction
    pub fn has_committed_abort(&self, txn_id: TxnId) -> bool {
        self.logs.values().any(|log| {
            log.committed_entries()
                .iter()
                .any(|e| matches!(e.cmd, Command::Abort { txn_id: t } if t == txn_id))
        })
    }
    /// Locate the committed coordinator intent for `txn_id`, searching every shard's
    /// committed prefix
    pub fn find_committed_intent(&self, txn_id: TxnId) -> Option<crate::engine::txn::TxnState> {
        for log in self.logs.values() {
            for entry in log.committed_entries() {
                if let Command::Txn(state) = entry.cmd {
                    if state.txn_id == txn_id {
                        return Some(state);
                    }
                }
            }
        }
        None
    }
}
