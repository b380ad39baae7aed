/*
 * Created on Tue Jan 09 2024
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

#![allow(dead_code)]

#[macro_use]
mod macros;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod repl;
pub mod storage;
pub mod time;
pub mod txn;

pub use error::{Error, RuntimeResult};

/*

    A word on tests:

    Most assertions in this crate are made at quiescent points: after the appliers have drained
    every committed entry. The runtime interleavings in between are emulated by pausing commit
    advancement on individual shard logs, which is how the suite reproduces partitions and
    slow participants deterministically.
*/
