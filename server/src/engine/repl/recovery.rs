/*
 * Created on Sun Jan 21 2024
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

//! Crash recovery: a rejoining replica replays `(applied_index, commit_index]` of every
//! shard it replicates through the ordinary applier, so replay and live application are
//! literally the same code path and replaying a prefix twice cannot diverge. State
//! transfers encountered mid-replay overwrite the local record wholesale; they are the
//! authoritative representation after a migration.

use {
    super::{applier, ApplyContext, ShardId},
    crate::engine::{error::RuntimeResult, txn::coordinator},
};

/// Replay every locally replicated shard to its commit index and settle cross-shard
/// transaction state. Runs in rounds: a round that applies nothing and resolves nothing
/// means the replica has caught up
pub fn replay(cx: &mut ApplyContext<'_>) -> RuntimeResult<usize> {
    let mut total = 0;
    loop {
        let mut progressed = 0;
        let shards: Vec<ShardId> = cx
            .registry
            .shards()
            .filter(|s| cx.local_shards.contains(*s))
            .collect();
        for shard in shards {
            progressed += applier::pump_shard(shard, cx)?;
        }
        // transactions whose entries were all drained above may still be undecided
        // (e.g. the stub landed in an earlier round); re-evaluate them
        for txn_id in cx.txns.committing() {
            coordinator::check_parallel_commit(txn_id, cx)?;
        }
        if progressed == 0 {
            break;
        }
        total += progressed;
    }
    Ok(total)
}
