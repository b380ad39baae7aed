/*
 * Created on Tue Jan 16 2024
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

//! Multi-shard transactions. A transaction is born `Committing`, transitions exactly once
//! to `Committed` or `Aborted`, and stays addressable on every participant until the
//! garbage collection watermark passes it (the record must outlive every in-flight
//! transaction that might still run a conflict check against it).

pub mod conflict;
pub mod coordinator;
#[cfg(test)]
mod tests;

use {
    crate::engine::{
        core::SceneOp,
        error::{RuntimeResult, TransactionError},
        repl::{ShardId, ShardSet},
        time::Hlc,
    },
    std::collections::BTreeMap,
};

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Transaction lifecycle. `Committing` is the only non-terminal state
pub enum TxnStatus {
    Committing = 0,
    Committed = 1,
    Aborted = 2,
}

impl TxnStatus {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Committing)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The full transaction record: the coordinator intent carried by the coordinator
/// shard's log entry
pub struct TxnState {
    pub txn_id: TxnId,
    pub status: TxnStatus,
    pub shards: ShardSet,
    pub coord_shard: ShardId,
    pub hlc: Hlc,
    pub ops: Vec<SceneOp>,
}

#[derive(Debug)]
/// A replica's view of one transaction
pub struct TxnRecord {
    pub state: TxnState,
    /// set on the replica that coordinates this transaction; only that replica writes
    /// abort records on its behalf
    pub coordinator_local: bool,
    /// whether the ops have been handed to the scene state machine (exactly once)
    pub applied: bool,
}

#[derive(Debug, Default)]
/// The per-replica pending-transaction table. Owned by the replica's applier/coordinator
/// machinery; every mutation funnels through the methods below so the one-shot status
/// transition is enforced in one place
pub struct PendingTxns {
    map: BTreeMap<TxnId, TxnRecord>,
}

impl PendingTxns {
    pub fn new() -> Self {
        Self::default()
    }
    /// Admit a transaction record. If the transaction is already known the existing
    /// record wins: a stub or a replayed intent never regresses local status
    pub fn admit(&mut self, state: TxnState, coordinator_local: bool) {
        self.map.entry(state.txn_id).or_insert(TxnRecord {
            state,
            coordinator_local,
            applied: false,
        });
    }
    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.map.contains_key(&txn_id)
    }
    pub fn get(&self, txn_id: TxnId) -> Option<&TxnRecord> {
        self.map.get(&txn_id)
    }
    pub fn status(&self, txn_id: TxnId) -> Option<TxnStatus> {
        self.map.get(&txn_id).map(|r| r.state.status)
    }
    /// Ids of transactions still in flight
    pub fn committing(&self) -> Vec<TxnId> {
        self.map
            .iter()
            .filter(|(_, r)| r.state.status == TxnStatus::Committing)
            .map(|(id, _)| *id)
            .collect()
    }
    /// Transition a transaction to a terminal status. The transition is one-shot:
    /// re-asserting the same terminal status is idempotent, flipping between terminal
    /// states is an error
    pub fn transition(&mut self, txn_id: TxnId, to: TxnStatus) -> RuntimeResult<()> {
        let record = self
            .map
            .get_mut(&txn_id)
            .ok_or(TransactionError::UnknownTxn)?;
        if record.state.status.is_terminal() {
            if record.state.status == to {
                return Ok(());
            }
            return Err(TransactionError::AlreadyTerminal.into());
        }
        record.state.status = to;
        Ok(())
    }
    pub fn mark_applied(&mut self, txn_id: TxnId) -> RuntimeResult<()> {
        self.map
            .get_mut(&txn_id)
            .ok_or(TransactionError::UnknownTxn)?
            .applied = true;
        Ok(())
    }
    /// The smallest HLC among in-flight transactions, which anchors the GC watermark
    pub fn in_flight_floor(&self) -> Option<Hlc> {
        self.map
            .values()
            .filter(|r| r.state.status == TxnStatus::Committing)
            .map(|r| r.state.hlc)
            .min()
    }
    /// Drop terminal records older than the watermark. Returns how many were collected
    pub fn gc(&mut self, watermark: Hlc) -> usize {
        let before = self.map.len();
        self.map
            .retain(|_, r| !(r.state.status.is_terminal() && r.state.hlc < watermark));
        before - self.map.len()
    }
    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
