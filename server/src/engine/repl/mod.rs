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

//! The replication layer: shard identity, the node-to-shard map, the per-shard log entry
//! model and the consensus-service contract the engine consumes. The consensus machinery
//! itself (elections, heartbeats, snapshotting) is opaque; the engine depends only on the
//! [`ConsensusLog`] surface and its safety guarantees (at most one leader per term,
//! identical committed prefixes, no lost committed entries).

pub(crate) mod applier;
mod log;
pub mod recovery;
#[cfg(test)]
mod tests;

pub use {
    applier::{pump_shard, ApplyContext},
    log::{InProcessLog, LogHandle, LogRegistry},
};

use {
    crate::engine::{
        core::NodeId,
        error::RuntimeResult,
        time::Hlc,
        txn::{TxnId, TxnState},
    },
    std::collections::BTreeMap,
    tokio::sync::watch,
};

/// A shard id: a replication group with its own consensus log
pub type ShardId = u16;
/// A cluster replica id
pub type ReplicaId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
/// A set of shards as a bitset. This is also the wire representation of a transaction's
/// participant set, which caps the cluster at 16 shards
pub struct ShardSet {
    bits: u16,
}

impl ShardSet {
    pub const EMPTY: Self = Self { bits: 0 };
    pub fn single(shard: ShardId) -> Self {
        Self { bits: 1 << shard }
    }
    pub fn all(shard_count: u16) -> Self {
        Self {
            bits: if shard_count >= u16::BITS as u16 {
                u16::MAX
            } else {
                (1u16 << shard_count) - 1
            },
        }
    }
    pub const fn from_bits(bits: u16) -> Self {
        Self { bits }
    }
    pub const fn bits(&self) -> u16 {
        self.bits
    }
    pub fn insert(&mut self, shard: ShardId) {
        self.bits |= 1 << shard;
    }
    pub const fn contains(&self, shard: ShardId) -> bool {
        self.bits & (1 << shard) != 0
    }
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }
    pub const fn intersects(&self, other: &Self) -> bool {
        self.bits & other.bits != 0
    }
    pub const fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }
    /// The smallest member, which is the deterministic coordinator pick
    pub fn min(&self) -> Option<ShardId> {
        if self.is_empty() {
            None
        } else {
            Some(self.bits.trailing_zeros() as ShardId)
        }
    }
    pub fn iter(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..u16::BITS as ShardId).filter(|s| self.contains(*s))
    }
}

impl FromIterator<ShardId> for ShardSet {
    fn from_iter<I: IntoIterator<Item = ShardId>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for shard in iter {
            set.insert(shard);
        }
        set
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// The node-to-shard map: which shards replicate each scene node. Mutated only by
/// applying committed migration entries (and by node creation/removal)
pub struct ShardMap {
    owners: BTreeMap<NodeId, ShardSet>,
}

impl ShardMap {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn owners(&self, node: NodeId) -> ShardSet {
        self.owners.get(&node).copied().unwrap_or(ShardSet::EMPTY)
    }
    /// The shard that hosts `node`'s operations (the smallest owner)
    pub fn primary(&self, node: NodeId) -> Option<ShardId> {
        ShardSet::min(&self.owners(node))
    }
    pub fn assign(&mut self, node: NodeId, owners: ShardSet) {
        self.owners.insert(node, owners);
    }
    pub fn unassign(&mut self, node: NodeId) {
        self.owners.remove(&node);
    }
    pub fn is_scoped(&self, node: NodeId, shard: ShardId) -> bool {
        self.owners(node).contains(shard)
    }
    pub fn mapped_count(&self) -> usize {
        self.owners.len()
    }
}

/*
    log entries
*/

#[derive(Debug, Clone, PartialEq)]
/// The command carried by a log entry
pub enum Command {
    /// a scene operation outside any transaction (single-shard fast path)
    Scene(crate::engine::core::SceneOp),
    /// the coordinator intent: the full transaction record
    Txn(TxnState),
    /// a participant stub: this shard participates in `txn_id`
    Commit { txn_id: TxnId, hlc: Hlc },
    /// terminal abort record
    Abort { txn_id: TxnId },
}

impl Command {
    /// The transaction this command references, if any
    pub fn txn_ref(&self) -> Option<TxnId> {
        match self {
            Self::Txn(state) => Some(state.txn_id),
            Self::Commit { txn_id, .. } | Self::Abort { txn_id } => Some(*txn_id),
            Self::Scene(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A single replicated log entry. Immutable once appended
pub struct LogEntry {
    pub term: u64,
    pub shard: ShardId,
    pub hlc: Hlc,
    pub cmd: Command,
}

/*
    the consensus contract
*/

/// The per-shard consensus service surface the engine consumes. Everything behind it
/// (leader election, replication, snapshotting) is assumed library
pub trait ConsensusLog {
    /// Append an entry through this handle. Leader-only: a non-leader append fails
    fn append(&self, entry: LogEntry) -> RuntimeResult<u64>;
    /// The commit index; monotonically non-decreasing
    fn commit_index(&self) -> u64;
    /// Read a (1-based) entry. Committed entries are immutable
    fn entry(&self, index: u64) -> Option<LogEntry>;
    fn current_leader(&self) -> Option<ReplicaId>;
    fn current_term(&self) -> u64;
    /// Change notification for commit-index advancement (edge-triggered)
    fn subscribe_commits(&self) -> watch::Receiver<u64>;
    /// Change notification for leadership handovers
    fn subscribe_leader(&self) -> watch::Receiver<Option<ReplicaId>>;
}
