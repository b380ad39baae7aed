/*
 * Created on Sun Jan 28 2024
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
    super::{conflict, PendingTxns, TxnState, TxnStatus},
    crate::engine::{
        core::{NodeId, PropertyUpdate, Scene, SceneOp, NIL},
        error::{ErrorKind, TransactionError},
        repl::{Command, LogEntry, LogRegistry, ShardSet},
        time::Hlc,
    },
    std::collections::BTreeMap,
};

fn set_prop(node: NodeId, key: &str, value: &str) -> SceneOp {
    SceneOp::SetProperty {
        node,
        key: key.to_owned(),
        value: value.to_owned(),
    }
}

/// root 1 -> [2, 3]; 2 -> [4]; 4 -> [5]
fn fixture() -> Scene {
    let mut scene = Scene::empty(16);
    for (target, new_node) in [(NIL, 1), (1, 3), (1, 2), (2, 4), (4, 5)] {
        scene
            .apply(&SceneOp::AddChild {
                target,
                new_node,
                properties: BTreeMap::new(),
            })
            .unwrap();
    }
    scene
}

#[test]
fn same_property_writes_conflict() {
    let scene = fixture();
    let a = set_prop(2, "k", "x");
    let b = set_prop(2, "k", "y");
    let c = set_prop(2, "other", "y");
    let d = set_prop(3, "k", "y");
    assert!(conflict::ops_conflict(&scene, &a, &b));
    assert!(!conflict::ops_conflict(&scene, &a, &c));
    assert!(!conflict::ops_conflict(&scene, &a, &d));
}

#[test]
fn tree_mutation_conflicts_inside_its_closure() {
    let scene = fixture();
    let mutation = SceneOp::MoveSubtree {
        node: 2,
        new_parent: 3,
        new_sibling: NIL,
    };
    // 5 is a transitive descendant of 2
    assert!(conflict::ops_conflict(&scene, &mutation, &set_prop(5, "k", "v")));
    assert!(conflict::ops_conflict(&scene, &set_prop(5, "k", "v"), &mutation));
    assert!(conflict::ops_conflict(
        &scene,
        &SceneOp::RemoveNode { node: 2 },
        &set_prop(4, "k", "v")
    ));
    // 3 is a sibling, outside the closure
    assert!(!conflict::ops_conflict(&scene, &mutation, &set_prop(3, "k", "v")));
    // a property write on an ancestor does not collide with a deep mutation
    assert!(!conflict::ops_conflict(
        &scene,
        &SceneOp::RemoveNode { node: 4 },
        &set_prop(1, "k", "v")
    ));
}

#[test]
fn same_pair_repositioning_conflicts() {
    let scene = fixture();
    let a = SceneOp::MoveChild {
        parent: 1,
        child_node: 2,
        to_index: 0,
    };
    let b = SceneOp::MoveChild {
        parent: 1,
        child_node: 2,
        to_index: 1,
    };
    let c = SceneOp::MoveChild {
        parent: 1,
        child_node: 3,
        to_index: 0,
    };
    assert!(conflict::ops_conflict(&scene, &a, &b));
    assert!(!conflict::ops_conflict(&scene, &a, &c));
}

#[test]
fn reposition_vs_insertion_on_the_same_parent_conflicts() {
    let scene = fixture();
    let reposition = SceneOp::MoveChild {
        parent: 1,
        child_node: 2,
        to_index: 0,
    };
    let insert = SceneOp::AddChild {
        target: 1,
        new_node: 6,
        properties: BTreeMap::new(),
    };
    let splice = SceneOp::AddSibling {
        target: 1,
        new_node: 6,
        properties: BTreeMap::new(),
    };
    let elsewhere = SceneOp::AddChild {
        target: 3,
        new_node: 6,
        properties: BTreeMap::new(),
    };
    // symmetric in both directions
    assert!(conflict::ops_conflict(&scene, &reposition, &insert));
    assert!(conflict::ops_conflict(&scene, &insert, &reposition));
    assert!(conflict::ops_conflict(&scene, &reposition, &splice));
    assert!(!conflict::ops_conflict(&scene, &reposition, &elsewhere));
    // two insertions never conflict with each other
    assert!(!conflict::ops_conflict(&scene, &insert, &splice));
}

#[test]
fn batches_conflict_through_their_contents() {
    let scene = fixture();
    let batch = SceneOp::BatchUpdate {
        updates: vec![
            PropertyUpdate {
                node: 3,
                key: "a".to_owned(),
                value: "1".to_owned(),
            },
            PropertyUpdate {
                node: 2,
                key: "k".to_owned(),
                value: "2".to_owned(),
            },
        ],
    };
    assert!(conflict::ops_conflict(&scene, &batch, &set_prop(2, "k", "x")));
    assert!(!conflict::ops_conflict(&scene, &batch, &set_prop(2, "other", "x")));
    let structure = SceneOp::BatchStructure {
        structure_ops: vec![SceneOp::MoveChild {
            parent: 1,
            child_node: 2,
            to_index: 0,
        }],
    };
    assert!(conflict::ops_conflict(
        &scene,
        &structure,
        &SceneOp::AddChild {
            target: 1,
            new_node: 6,
            properties: BTreeMap::new(),
        }
    ));
}

#[test]
fn candidate_aborts_against_preceding_committed_entries() {
    let scene = fixture();
    let registry = LogRegistry::bootstrap(1, 0);
    let log = registry.get(0).unwrap();
    log.append_as(
        0,
        LogEntry {
            term: 0,
            shard: 0,
            hlc: Hlc::new(10, 0),
            cmd: Command::Scene(SceneOp::MoveSubtree {
                node: 2,
                new_parent: 3,
                new_sibling: NIL,
            }),
        },
    )
    .unwrap();
    let txns = PendingTxns::new();
    let candidate = |hlc: Hlc| TxnState {
        txn_id: 7,
        status: TxnStatus::Committing,
        shards: ShardSet::single(0),
        coord_shard: 0,
        hlc,
        ops: vec![set_prop(5, "k", "v")],
    };
    // inside the drift window and HLC-after the mutation: conflict
    assert!(conflict::must_abort(
        &scene,
        &registry,
        &txns,
        &candidate(Hlc::new(12, 0)),
        16
    ));
    // HLC-before the committed entry: not considered
    assert!(!conflict::must_abort(
        &scene,
        &registry,
        &txns,
        &candidate(Hlc::new(9, 0)),
        16
    ));
    // outside the drift window: causally settled, not considered
    assert!(!conflict::must_abort(
        &scene,
        &registry,
        &txns,
        &candidate(Hlc::new(40, 0)),
        16
    ));
}

#[test]
fn status_transitions_are_one_shot() {
    let mut txns = PendingTxns::new();
    txns.admit(
        TxnState {
            txn_id: 1,
            status: TxnStatus::Committing,
            shards: ShardSet::single(0),
            coord_shard: 0,
            hlc: Hlc::new(1, 0),
            ops: vec![],
        },
        true,
    );
    txns.transition(1, TxnStatus::Committed).unwrap();
    // idempotent re-assertion is fine
    txns.transition(1, TxnStatus::Committed).unwrap();
    // flipping a terminal status is not
    let err = txns.transition(1, TxnStatus::Aborted).unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Txn(TransactionError::AlreadyTerminal)
    );
    let err = txns.transition(99, TxnStatus::Aborted).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Txn(TransactionError::UnknownTxn));
}

#[test]
fn gc_respects_the_in_flight_floor() {
    let mut txns = PendingTxns::new();
    let admit = |txns: &mut PendingTxns, id: u64, l: u64, status: TxnStatus| {
        txns.admit(
            TxnState {
                txn_id: id,
                status: TxnStatus::Committing,
                shards: ShardSet::single(0),
                coord_shard: 0,
                hlc: Hlc::new(l, 0),
                ops: vec![],
            },
            false,
        );
        if status.is_terminal() {
            txns.transition(id, status).unwrap();
        }
    };
    admit(&mut txns, 1, 5, TxnStatus::Committed);
    admit(&mut txns, 2, 10, TxnStatus::Aborted);
    admit(&mut txns, 3, 12, TxnStatus::Committing);
    admit(&mut txns, 4, 50, TxnStatus::Committed);
    assert_eq!(txns.in_flight_floor(), Some(Hlc::new(12, 0)));
    // watermark passes 1 and 2 but never the in-flight record or anything younger
    let collected = txns.gc(Hlc::new(12, 0));
    assert_eq!(collected, 2);
    assert_eq!(txns.len(), 2);
    assert!(txns.contains(3));
    assert!(txns.contains(4));
}
