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

//! The shared library for Scened
//!
//! This contains definitions shared by the `server` crate and any client tooling

use std::error::Error;

/// The version of this build
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// The project homepage
pub const URL: &str = "https://github.com/scened/scened";
/// A generic result
pub type TResult<T> = Result<T, Box<dyn Error>>;
