/*
 * Created on Thu Jan 11 2024
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

//! Hybrid logical clocks. Every log entry carries an [`Hlc`]; the per-replica [`HlcClock`]
//! advances it on local events (appends) and joins it on receive, so any two causally related
//! entries are ordered and concurrent entries are ordered consistently across replicas.
//!
//! The physical component is sourced through the [`ClockSource`] seam. Safety never depends
//! on it; only the `MaxLatency` abort rule (liveness) does.

use {
    parking_lot::Mutex,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
/// A hybrid logical timestamp: `l` tracks the highest observed physical tick, `c` breaks
/// ties between events sharing `l`. Comparison is lexicographic
pub struct Hlc {
    l: u64,
    c: u32,
}

impl Hlc {
    pub const ZERO: Self = Self::new(0, 0);
    pub const fn new(l: u64, c: u32) -> Self {
        Self { l, c }
    }
    pub const fn l(&self) -> u64 {
        self.l
    }
    pub const fn c(&self) -> u32 {
        self.c
    }
    /// Distance between the logical components, used by the commit-window abort rule.
    /// Saturating: a timestamp from the future is within any window
    pub const fn window_distance(local: Self, remote: Self) -> u64 {
        local.l.saturating_sub(remote.l)
    }
}

/// The clock adapter. `now_pt` must be monotonic per source; it is never interpreted as
/// wall-clock time
pub trait ClockSource: Send + Sync + 'static {
    fn now_pt(&self) -> u64;
}

#[derive(Debug, Default)]
/// The default physical source: a shared monotonic tick counter that advances on every
/// read. Replicas of one process share a single instance so their `l` components stay
/// within a bounded drift of one another
pub struct TickSource {
    ticks: AtomicU64,
}

impl TickSource {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
    /// Push the physical component forward without an event. Emulates elapsed quiet time
    /// (the suite uses this to trip the commit window)
    pub fn advance(&self, by: u64) {
        self.ticks.fetch_add(by, Ordering::SeqCst);
    }
}

impl ClockSource for TickSource {
    fn now_pt(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst)
    }
}

impl<C: ClockSource> ClockSource for Arc<C> {
    fn now_pt(&self) -> u64 {
        C::now_pt(self)
    }
}

/// The clock a replica runs on: the shared in-process tick source behind the HLC
pub type ReplicaClock = HlcClock<Arc<TickSource>>;

#[derive(Debug)]
/// A per-replica hybrid logical clock
pub struct HlcClock<C: ClockSource> {
    inner: Mutex<Hlc>,
    source: C,
}

impl<C: ClockSource> HlcClock<C> {
    pub fn new(source: C) -> Self {
        Self {
            inner: Mutex::new(Hlc::ZERO),
            source,
        }
    }
    /// Advance for a local event (an append). `pt' = pt + 1`; if `l >= pt'` the logical
    /// component is kept and `c` incremented, else `l` jumps to `pt'` and `c` resets
    pub fn tick(&self) -> Hlc {
        let mut hlc = self.inner.lock();
        let pt = self.source.now_pt() + 1;
        if hlc.l >= pt {
            hlc.c += 1;
        } else {
            hlc.l = pt;
            hlc.c = 0;
        }
        *hlc
    }
    /// Join an incoming timestamp (a receive). `l' = max(l, incoming.l, pt)` with `c`
    /// picked from whichever argument supplied the maximum
    pub fn observe(&self, incoming: Hlc) -> Hlc {
        let mut hlc = self.inner.lock();
        let pt = self.source.now_pt();
        let l = hlc.l.max(incoming.l).max(pt);
        let c = if l == hlc.l && l == incoming.l {
            hlc.c.max(incoming.c) + 1
        } else if l == hlc.l {
            hlc.c + 1
        } else if l == incoming.l {
            incoming.c + 1
        } else {
            0
        };
        *hlc = Hlc::new(l, c);
        *hlc
    }
    /// The current timestamp without advancing it
    pub fn peek(&self) -> Hlc {
        *self.inner.lock()
    }
}
