/*
 * Created on Tue Jan 30 2024
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
    super::{decode_entry, encode_entry},
    crate::engine::{
        core::{NodeState, PropertyUpdate, SceneOp, NIL},
        error::{ErrorKind, StorageError},
        repl::{Command, LogEntry, ShardSet},
        time::Hlc,
        txn::{TxnState, TxnStatus},
    },
    std::collections::BTreeMap,
};

/// A transaction intent exercising every body shape: fixed slots, properties, nested
/// batches and a migration state snapshot
fn intent_entry() -> LogEntry {
    let mut properties = BTreeMap::new();
    properties.insert("name".to_owned(), "camera".to_owned());
    properties.insert("視点".to_owned(), "主".to_owned());
    LogEntry {
        term: 3,
        shard: 1,
        hlc: Hlc::new(42, 7),
        cmd: Command::Txn(TxnState {
            txn_id: (9 << 32) | 4,
            status: TxnStatus::Committing,
            shards: ShardSet::all(2),
            coord_shard: 0,
            hlc: Hlc::new(42, 7),
            ops: vec![
                SceneOp::AddChild {
                    target: NIL,
                    new_node: 1,
                    properties: properties.clone(),
                },
                SceneOp::MoveChild {
                    parent: 1,
                    child_node: 2,
                    to_index: -2,
                },
                SceneOp::BatchUpdate {
                    updates: vec![PropertyUpdate {
                        node: 2,
                        key: "x".to_owned(),
                        value: "1".to_owned(),
                    }],
                },
                SceneOp::BatchStructure {
                    structure_ops: vec![SceneOp::MoveSubtree {
                        node: 3,
                        new_parent: 1,
                        new_sibling: 2,
                    }],
                },
                SceneOp::StateTransfer {
                    node: 5,
                    shard: 1,
                    state: NodeState::assemble(6, NIL, properties),
                },
                SceneOp::ShardRemove { node: 5 },
                SceneOp::DetachChild { parent: 1, child: 5 },
                SceneOp::AttachChild {
                    parent: 1,
                    child: 5,
                    position: 2,
                },
            ],
        }),
    }
}

#[test]
fn entry_roundtrip() {
    let entry = intent_entry();
    let frame = encode_entry(&entry);
    assert_eq!(decode_entry(&frame).unwrap(), entry);
    let stub = LogEntry {
        term: 2,
        shard: 1,
        hlc: Hlc::new(42, 7),
        cmd: Command::Commit {
            txn_id: 77,
            hlc: Hlc::new(42, 7),
        },
    };
    assert_eq!(decode_entry(&encode_entry(&stub)).unwrap(), stub);
    let abort = LogEntry {
        term: 2,
        shard: 0,
        hlc: Hlc::new(50, 0),
        cmd: Command::Abort { txn_id: 77 },
    };
    assert_eq!(decode_entry(&encode_entry(&abort)).unwrap(), abort);
}

#[test]
fn corrupted_body_is_rejected() {
    let mut frame = encode_entry(&intent_entry()).to_vec();
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    let err = decode_entry(&frame).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Storage(StorageError::ChecksumMismatch));
}

#[test]
fn truncated_frames_are_rejected() {
    let frame = encode_entry(&intent_entry());
    let err = decode_entry(&frame[..frame.len() - 4]).unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Storage(StorageError::DecodeUnexpectedEof)
    );
    // even a header alone is not enough
    let err = decode_entry(&frame[..10]).unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Storage(StorageError::DecodeUnexpectedEof)
    );
}

#[test]
fn unknown_tags_are_rejected() {
    let entry = LogEntry {
        term: 0,
        shard: 0,
        hlc: Hlc::new(1, 0),
        cmd: Command::Abort { txn_id: 1 },
    };
    let mut frame = encode_entry(&entry).to_vec();
    frame[super::OFFSET_4_CMD_TAG.start] = 0xaa;
    let err = decode_entry(&frame).unwrap_err();
    assert_eq!(
        *err.kind(),
        ErrorKind::Storage(StorageError::DecodeUnknownTag)
    );
}
