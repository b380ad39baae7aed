/*
 * Created on Sat Jan 13 2024
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
    super::{NodeId, PropertyUpdate, Scene, SceneOp, NIL},
    crate::engine::error::{ErrorKind, SceneError},
    std::collections::BTreeMap,
};

fn add_child(target: NodeId, new_node: NodeId) -> SceneOp {
    SceneOp::AddChild {
        target,
        new_node,
        properties: BTreeMap::new(),
    }
}

fn add_sibling(target: NodeId, new_node: NodeId) -> SceneOp {
    SceneOp::AddSibling {
        target,
        new_node,
        properties: BTreeMap::new(),
    }
}

fn move_child(parent: NodeId, child_node: NodeId, to_index: i32) -> SceneOp {
    SceneOp::MoveChild {
        parent,
        child_node,
        to_index,
    }
}

/// Builds the three-node tree of the seed suite: root 1 with children [3, 2]
fn seed_tree() -> Scene {
    let mut scene = Scene::empty(16);
    scene.apply(&add_child(NIL, 1)).unwrap();
    scene.apply(&add_child(1, 2)).unwrap();
    scene.apply(&add_child(1, 3)).unwrap();
    scene
}

fn assert_scene_error(scene: &mut Scene, op: &SceneOp, expected: SceneError) {
    let err = scene.apply(op).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Scene(expected));
}

#[test]
fn root_creation_and_children() {
    let scene = seed_tree();
    assert_eq!(scene.ordered_children(1).unwrap(), vec![3, 2]);
    assert_eq!(scene.node(1).unwrap().left_child(), 3);
    assert_eq!(scene.node(3).unwrap().right_sibling(), 2);
    assert_eq!(scene.node(2).unwrap().right_sibling(), NIL);
    scene.verify_tree().unwrap();
}

#[test]
fn move_child_repositions() {
    let mut scene = seed_tree();
    scene.apply(&move_child(1, 2, 0)).unwrap();
    assert_eq!(scene.ordered_children(1).unwrap(), vec![2, 3]);
    scene.verify_tree().unwrap();
}

#[test]
fn move_child_negative_index_counts_from_end() {
    let mut scene = seed_tree();
    scene.apply(&add_child(1, 4)).unwrap();
    // children are [4, 3, 2]; -3 normalizes to 0
    scene.apply(&move_child(1, 2, -3)).unwrap();
    assert_eq!(scene.ordered_children(1).unwrap(), vec![2, 4, 3]);
}

#[test]
fn move_child_invalid_input_is_a_noop() {
    let mut scene = seed_tree();
    let before = scene.clone();
    // not a child of 1
    scene.apply(&move_child(1, 9, 0)).unwrap();
    // adjusted index out of range
    scene.apply(&move_child(1, 2, 2)).unwrap();
    scene.apply(&move_child(1, 2, -3)).unwrap();
    assert_eq!(scene, before);
}

#[test]
fn batched_property_update() {
    let mut scene = seed_tree();
    scene
        .apply(&SceneOp::BatchUpdate {
            updates: vec![
                PropertyUpdate {
                    node: 1,
                    key: "x".to_owned(),
                    value: "a".to_owned(),
                },
                PropertyUpdate {
                    node: 1,
                    key: "y".to_owned(),
                    value: "b".to_owned(),
                },
                PropertyUpdate {
                    node: 2,
                    key: "x".to_owned(),
                    value: "c".to_owned(),
                },
            ],
        })
        .unwrap();
    assert_eq!(scene.node(1).unwrap().property("x"), Some("a"));
    assert_eq!(scene.node(1).unwrap().property("y"), Some("b"));
    assert_eq!(scene.node(2).unwrap().property("x"), Some("c"));
}

#[test]
fn set_property_upserts() {
    let mut scene = seed_tree();
    scene
        .apply(&SceneOp::SetProperty {
            node: 2,
            key: "k".to_owned(),
            value: "v1".to_owned(),
        })
        .unwrap();
    scene
        .apply(&SceneOp::SetProperty {
            node: 2,
            key: "k".to_owned(),
            value: "v2".to_owned(),
        })
        .unwrap();
    assert_eq!(scene.node(2).unwrap().property("k"), Some("v2"));
    assert_eq!(scene.node(2).unwrap().properties().len(), 1);
}

#[test]
fn add_child_rejects_bad_input() {
    let mut scene = seed_tree();
    assert_scene_error(&mut scene, &add_child(9, 10), SceneError::NodeNotFound);
    assert_scene_error(&mut scene, &add_child(1, 2), SceneError::NodeAlreadyExists);
    assert_scene_error(&mut scene, &add_child(1, NIL), SceneError::NodeIdOutOfRange);
    assert_scene_error(&mut scene, &add_child(1, 17), SceneError::NodeIdOutOfRange);
}

#[test]
fn add_sibling_splices_after_target() {
    let mut scene = seed_tree();
    scene.apply(&add_sibling(3, 4)).unwrap();
    assert_eq!(scene.ordered_children(1).unwrap(), vec![3, 4, 2]);
    scene.verify_tree().unwrap();
}

#[test]
fn remove_leaf_and_remove_subtree() {
    let mut scene = seed_tree();
    scene.apply(&add_child(2, 4)).unwrap();
    scene.apply(&add_child(4, 5)).unwrap();
    // leaf removal deletes a single node
    scene.apply(&SceneOp::RemoveNode { node: 3 }).unwrap();
    assert!(!scene.contains(3));
    assert_eq!(scene.ordered_children(1).unwrap(), vec![2]);
    // internal removal deletes the whole subtree
    scene.apply(&SceneOp::RemoveNode { node: 2 }).unwrap();
    multi_assert_eq!(scene.contains(2), scene.contains(4), scene.contains(5) => false);
    assert_eq!(scene.live_count(), 1);
    scene.verify_tree().unwrap();
}

#[test]
fn remove_rewrites_dangling_sibling_pointers() {
    let mut scene = seed_tree();
    // children of 1 are [3, 2]; removing 2 must clear 3.right_sibling
    scene.apply(&SceneOp::RemoveNode { node: 2 }).unwrap();
    assert_eq!(scene.node(3).unwrap().right_sibling(), NIL);
    scene.verify_tree().unwrap();
}

#[test]
fn move_subtree_roundtrip_restores_shape() {
    let mut scene = seed_tree();
    scene.apply(&add_child(2, 4)).unwrap();
    scene.apply(&add_child(3, 5)).unwrap();
    let before = scene.clone();
    scene
        .apply(&SceneOp::MoveSubtree {
            node: 4,
            new_parent: 3,
            new_sibling: 5,
        })
        .unwrap();
    assert_eq!(scene.ordered_children(3).unwrap(), vec![5, 4]);
    assert_eq!(scene.ordered_children(2).unwrap(), Vec::<NodeId>::new());
    scene.verify_tree().unwrap();
    // the inverse move returns the tree to its prior shape
    scene
        .apply(&SceneOp::MoveSubtree {
            node: 4,
            new_parent: 2,
            new_sibling: NIL,
        })
        .unwrap();
    assert_eq!(scene, before);
}

#[test]
fn move_subtree_rejects_cycles() {
    let mut scene = seed_tree();
    scene.apply(&add_child(2, 4)).unwrap();
    assert_scene_error(
        &mut scene,
        &SceneOp::MoveSubtree {
            node: 2,
            new_parent: 4,
            new_sibling: NIL,
        },
        SceneError::TreeInvariantViolation,
    );
}

#[test]
fn move_subtree_out_of_middle_keeps_chain() {
    let mut scene = seed_tree();
    scene.apply(&add_child(1, 4)).unwrap();
    // children are [4, 3, 2]; moving 3 away must splice 4 -> 2
    scene
        .apply(&SceneOp::MoveSubtree {
            node: 3,
            new_parent: 2,
            new_sibling: NIL,
        })
        .unwrap();
    assert_eq!(scene.ordered_children(1).unwrap(), vec![4, 2]);
    assert_eq!(scene.ordered_children(2).unwrap(), vec![3]);
    scene.verify_tree().unwrap();
}

#[test]
fn batch_structure_applies_in_order_and_skips_invalid() {
    let mut scene = seed_tree();
    scene
        .apply(&SceneOp::BatchStructure {
            structure_ops: vec![
                add_child(2, 4),
                // later edits observe earlier ones: 4 exists by now
                add_sibling(4, 5),
                // invalid: 9 does not exist; must be skipped, not abort the batch
                add_child(9, 6),
                move_child(2, 5, 0),
            ],
        })
        .unwrap();
    assert_eq!(scene.ordered_children(2).unwrap(), vec![5, 4]);
    assert!(!scene.contains(6));
    scene.verify_tree().unwrap();
}

#[test]
fn descendants_is_inclusive_and_bounded() {
    let mut scene = seed_tree();
    scene.apply(&add_child(2, 4)).unwrap();
    scene.apply(&add_child(4, 5)).unwrap();
    let mut closure = scene.descendants(2);
    closure.sort_unstable();
    assert_eq!(closure, vec![2, 4, 5]);
    assert_eq!(scene.descendants(9), Vec::<NodeId>::new());
}

#[test]
fn parent_resolution_walks_sibling_chains() {
    let scene = seed_tree();
    assert_eq!(scene.parent_of(3), Some(1));
    assert_eq!(scene.parent_of(2), Some(1));
    assert_eq!(scene.parent_of(1), None);
}

#[test]
fn tree_validation_catches_double_reference() {
    let mut scene = seed_tree();
    scene.verify_tree().unwrap();
    // corrupt: make 2 also the left child of 3
    scene.node_mut(3).unwrap().left_child = 2;
    assert!(scene.verify_tree().is_err());
}

#[test]
fn randomized_edits_preserve_the_invariants() {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(0xca7);
    let mut scene = Scene::empty(64);
    scene.apply(&add_child(NIL, 1)).unwrap();
    let mut next_id: NodeId = 2;
    for _ in 0..512 {
        let live: Vec<NodeId> = scene.live_nodes().collect();
        let anchor = live[rng.gen_range(0..live.len())];
        match rng.gen_range(0..5u8) {
            0 | 1 if next_id <= scene.cap() => {
                scene.apply(&add_child(anchor, next_id)).unwrap();
                next_id += 1;
            }
            2 if anchor != 1 && next_id <= scene.cap() => {
                scene.apply(&add_sibling(anchor, next_id)).unwrap();
                next_id += 1;
            }
            3 if anchor != 1 => {
                let target = live[rng.gen_range(0..live.len())];
                if !scene.descendants(anchor).contains(&target) {
                    scene
                        .apply(&SceneOp::MoveSubtree {
                            node: anchor,
                            new_parent: target,
                            new_sibling: NIL,
                        })
                        .unwrap();
                }
            }
            4 if anchor != 1 => {
                scene.apply(&SceneOp::RemoveNode { node: anchor }).unwrap();
            }
            _ => {}
        }
        scene.verify_tree().unwrap();
    }
}
