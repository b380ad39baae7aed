/*
 * Created on Mon Jan 29 2024
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

use {
    super::{
        applier, ApplyContext, Command, ConsensusLog, LogEntry, LogHandle, LogRegistry, ShardMap,
        ShardSet,
    },
    crate::engine::{
        core::{Scene, SceneOp, NIL},
        error::{ErrorKind, ReplError},
        time::{Hlc, HlcClock, TickSource},
        txn::PendingTxns,
    },
    std::collections::BTreeMap,
};

fn scene_entry(shard: u16, hlc: Hlc, op: SceneOp) -> LogEntry {
    LogEntry {
        term: 0,
        shard,
        hlc,
        cmd: Command::Scene(op),
    }
}

fn add_child(target: u16, new_node: u16) -> SceneOp {
    SceneOp::AddChild {
        target,
        new_node,
        properties: BTreeMap::new(),
    }
}

#[test]
fn shard_sets() {
    let mut set = ShardSet::EMPTY;
    assert!(set.is_empty());
    set.insert(3);
    set.insert(0);
    assert_eq!(set.len(), 2);
    assert_eq!(ShardSet::min(&set), Some(0));
    assert!(set.contains(3));
    assert!(!set.contains(1));
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3]);
    assert_eq!(ShardSet::all(2), [0u16, 1].into_iter().collect());
    assert!(ShardSet::all(2).intersects(&ShardSet::single(1)));
    assert!(!ShardSet::single(0).intersects(&ShardSet::single(1)));
}

#[test]
fn shard_map_assignment() {
    let mut map = ShardMap::new();
    assert_eq!(map.primary(4), None);
    map.assign(4, ShardSet::single(1));
    assert_eq!(map.primary(4), Some(1));
    assert!(map.is_scoped(4, 1));
    assert!(!map.is_scoped(4, 0));
    map.unassign(4);
    assert_eq!(map.mapped_count(), 0);
}

#[test]
fn append_is_leader_only() {
    let registry = LogRegistry::bootstrap(1, 0);
    let log = registry.get(0).unwrap();
    let entry = scene_entry(0, Hlc::new(1, 0), add_child(NIL, 1));
    assert_eq!(log.append_as(0, entry.clone()).unwrap(), 1);
    let err = log.append_as(1, entry.clone()).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Repl(ReplError::NotLeader));
    log.set_leader(None);
    let err = log.append_forwarded(entry).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Repl(ReplError::NoLeader));
}

#[test]
fn leader_change_bumps_the_term() {
    let registry = LogRegistry::bootstrap(1, 0);
    let log = registry.get(0).unwrap();
    let term = log.current_term();
    let leader_rx = log.subscribe_leader();
    log.set_leader(Some(2));
    assert_eq!(log.current_term(), term + 1);
    assert_eq!(log.current_leader(), Some(2));
    assert_eq!(*leader_rx.borrow(), Some(2));
    // entries are stamped with the term of the leader that appended them
    let index = log
        .append_forwarded(scene_entry(0, Hlc::new(1, 0), add_child(NIL, 1)))
        .unwrap();
    assert_eq!(log.entry(index).unwrap().term, term + 1);
}

#[test]
fn paused_logs_accept_but_do_not_commit() {
    let registry = LogRegistry::bootstrap(1, 0);
    let log = registry.get(0).unwrap();
    log.append_as(0, scene_entry(0, Hlc::new(1, 0), add_child(NIL, 1)))
        .unwrap();
    assert_eq!(log.commit_index(), 1);
    log.pause();
    log.append_as(0, scene_entry(0, Hlc::new(2, 0), add_child(1, 2)))
        .unwrap();
    assert_eq!(log.commit_index(), 1);
    assert_eq!(log.len(), 2);
    log.resume();
    assert_eq!(log.commit_index(), 2);
}

#[test]
fn commit_watch_sees_advancement() {
    let registry = LogRegistry::bootstrap(1, 0);
    let log = registry.get(0).unwrap();
    let rx = log.subscribe_commits();
    assert_eq!(*rx.borrow(), 0);
    log.append_as(0, scene_entry(0, Hlc::new(1, 0), add_child(NIL, 1)))
        .unwrap();
    assert_eq!(*rx.borrow(), 1);
}

#[test]
fn handles_expose_the_consensus_contract() {
    let registry = LogRegistry::bootstrap(1, 7);
    let handle = LogHandle::new(registry.get(0).unwrap().clone(), 7);
    let index = handle
        .append(scene_entry(0, Hlc::new(1, 0), add_child(NIL, 1)))
        .unwrap();
    assert_eq!(handle.commit_index(), index);
    assert_eq!(handle.current_leader(), Some(7));
    assert!(handle.entry(index).is_some());
    let other = LogHandle::new(registry.get(0).unwrap().clone(), 8);
    let err = other
        .append(scene_entry(0, Hlc::new(2, 0), add_child(1, 2)))
        .unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Repl(ReplError::NotLeader));
}

/// A bare (non-transactional) entry stream: pumped exactly once, scoped by the shard map
#[test]
fn pump_applies_committed_entries_exactly_once() {
    let registry = LogRegistry::bootstrap(2, 0);
    let log = registry.get(0).unwrap();
    log.append_as(0, scene_entry(0, Hlc::new(1, 0), add_child(NIL, 1)))
        .unwrap();
    log.append_as(0, scene_entry(0, Hlc::new(2, 0), add_child(1, 2)))
        .unwrap();

    let mut scene = Scene::empty(16);
    let mut shard_map = ShardMap::new();
    let mut txns = PendingTxns::new();
    let mut applied = BTreeMap::new();
    let clock = HlcClock::new(TickSource::new_shared());
    let mut cx = ApplyContext {
        me: 0,
        local_shards: ShardSet::all(2),
        max_latency: 16,
        scene: &mut scene,
        shard_map: &mut shard_map,
        txns: &mut txns,
        applied: &mut applied,
        clock: &clock,
        registry: &registry,
    };
    assert_eq!(applier::pump_shard(0, &mut cx).unwrap(), 2);
    assert_eq!(applier::pump_shard(0, &mut cx).unwrap(), 0);
    assert_eq!(*cx.applied.get(&0).unwrap(), 2);
    assert!(cx.scene.contains(1));
    assert!(cx.scene.contains(2));
    // creations landed in the shard map against the originating shard
    assert_eq!(cx.shard_map.primary(1), Some(0));
    assert_eq!(cx.shard_map.primary(2), Some(0));
    // the applier folds entry timestamps into the local clock
    assert!(cx.clock.peek() >= Hlc::new(2, 0));
    cx.scene.verify_tree().unwrap();
}
