/*
 * Created on Mon Jan 22 2024
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

//! The wire/persistent layout of log entries. Every entry is framed as:
//!
//! ```text
//! +----------+-----------+------------+------------+---------+--------------+--------------+
//! | 8B: term | 2B: shard | 8B: hlc.l  | 4B: hlc.c  | 1B: tag | 4B: body len | 8B: checksum |
//! +----------+-----------+------------+------------+---------+--------------+--------------+
//! ```
//!
//! followed by the command body. The checksum (CRC-64/XZ) covers the body alone and is
//! verified on decode; strings are length-prefixed utf-8; all integers little-endian.
//! Decoding never panics: an unknown tag, a short body or trailing garbage is a storage
//! error.

#[cfg(test)]
mod tests;

use {
    crate::engine::{
        core::{NodeId, NodeState, PropertyUpdate, SceneOp},
        error::{RuntimeResult, StorageError},
        repl::{Command, LogEntry, ShardSet},
        time::Hlc,
        txn::{TxnState, TxnStatus},
    },
    bytes::Bytes,
    crc::{Crc, CRC_64_XZ},
    std::{collections::BTreeMap, ops::Range},
};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

const OFFSET_0_TERM: Range<usize> = 0..sizeof!(u64);
const OFFSET_1_SHARD: Range<usize> = OFFSET_0_TERM.end..OFFSET_0_TERM.end + sizeof!(u16);
const OFFSET_2_HLC_L: Range<usize> = OFFSET_1_SHARD.end..OFFSET_1_SHARD.end + sizeof!(u64);
const OFFSET_3_HLC_C: Range<usize> = OFFSET_2_HLC_L.end..OFFSET_2_HLC_L.end + sizeof!(u32);
const OFFSET_4_CMD_TAG: Range<usize> = OFFSET_3_HLC_C.end..OFFSET_3_HLC_C.end + sizeof!(u8);
const OFFSET_5_BODY_LEN: Range<usize> =
    OFFSET_4_CMD_TAG.end..OFFSET_4_CMD_TAG.end + sizeof!(u32);
const OFFSET_6_CHECKSUM: Range<usize> =
    OFFSET_5_BODY_LEN.end..OFFSET_5_BODY_LEN.end + sizeof!(u64);
const HEADER_SIZE: usize = OFFSET_6_CHECKSUM.end;

/*
    command tags
*/

consts! {
    TAG_ADD_CHILD: u8 = 0;
    TAG_ADD_SIBLING: u8 = 1;
    TAG_REMOVE_NODE: u8 = 2;
    TAG_SET_PROPERTY: u8 = 3;
    TAG_MOVE_SUBTREE: u8 = 4;
    TAG_MOVE_CHILD: u8 = 5;
    TAG_BATCH_UPDATE: u8 = 6;
    TAG_BATCH_STRUCTURE: u8 = 7;
    TAG_MOVE_SHARD: u8 = 8;
    TAG_STATE_TRANSFER: u8 = 9;
    TAG_SHARD_REMOVE: u8 = 10;
    TAG_DETACH_CHILD: u8 = 11;
    TAG_ATTACH_CHILD: u8 = 12;
    TAG_TXN: u8 = 16;
    TAG_COMMIT: u8 = 17;
    TAG_ABORT: u8 = 18;
}

fn cmd_tag(cmd: &Command) -> u8 {
    match cmd {
        Command::Scene(op) => scene_op_tag(op),
        Command::Txn(_) => TAG_TXN,
        Command::Commit { .. } => TAG_COMMIT,
        Command::Abort { .. } => TAG_ABORT,
    }
}

fn scene_op_tag(op: &SceneOp) -> u8 {
    match op {
        SceneOp::AddChild { .. } => TAG_ADD_CHILD,
        SceneOp::AddSibling { .. } => TAG_ADD_SIBLING,
        SceneOp::RemoveNode { .. } => TAG_REMOVE_NODE,
        SceneOp::SetProperty { .. } => TAG_SET_PROPERTY,
        SceneOp::MoveSubtree { .. } => TAG_MOVE_SUBTREE,
        SceneOp::MoveChild { .. } => TAG_MOVE_CHILD,
        SceneOp::BatchUpdate { .. } => TAG_BATCH_UPDATE,
        SceneOp::BatchStructure { .. } => TAG_BATCH_STRUCTURE,
        SceneOp::MoveShard { .. } => TAG_MOVE_SHARD,
        SceneOp::StateTransfer { .. } => TAG_STATE_TRANSFER,
        SceneOp::ShardRemove { .. } => TAG_SHARD_REMOVE,
        SceneOp::DetachChild { .. } => TAG_DETACH_CHILD,
        SceneOp::AttachChild { .. } => TAG_ATTACH_CHILD,
    }
}

/*
    encode
*/

/// Encode an entry into its wire frame
pub fn encode_entry(entry: &LogEntry) -> Bytes {
    let mut body = Vec::new();
    encode_cmd_body(&entry.cmd, &mut body);
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&entry.term.to_le_bytes());
    frame.extend_from_slice(&entry.shard.to_le_bytes());
    frame.extend_from_slice(&entry.hlc.l().to_le_bytes());
    frame.extend_from_slice(&entry.hlc.c().to_le_bytes());
    frame.push(cmd_tag(&entry.cmd));
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&CRC64.checksum(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    Bytes::from(frame)
}

fn encode_cmd_body(cmd: &Command, buf: &mut Vec<u8>) {
    match cmd {
        Command::Scene(op) => encode_scene_op_body(op, buf),
        Command::Txn(state) => {
            buf.extend_from_slice(&state.txn_id.to_le_bytes());
            buf.push(state.status as u8);
            buf.extend_from_slice(&state.shards.bits().to_le_bytes());
            buf.extend_from_slice(&state.coord_shard.to_le_bytes());
            encode_hlc(state.hlc, buf);
            buf.extend_from_slice(&(state.ops.len() as u32).to_le_bytes());
            for op in &state.ops {
                buf.push(scene_op_tag(op));
                encode_scene_op_body(op, buf);
            }
        }
        Command::Commit { txn_id, hlc } => {
            buf.extend_from_slice(&txn_id.to_le_bytes());
            encode_hlc(*hlc, buf);
        }
        Command::Abort { txn_id } => buf.extend_from_slice(&txn_id.to_le_bytes()),
    }
}

fn encode_scene_op_body(op: &SceneOp, buf: &mut Vec<u8>) {
    match op {
        SceneOp::AddChild {
            target,
            new_node,
            properties,
        }
        | SceneOp::AddSibling {
            target,
            new_node,
            properties,
        } => {
            buf.extend_from_slice(&target.to_le_bytes());
            buf.extend_from_slice(&new_node.to_le_bytes());
            encode_properties(properties, buf);
        }
        SceneOp::RemoveNode { node } | SceneOp::ShardRemove { node } => {
            buf.extend_from_slice(&node.to_le_bytes());
        }
        SceneOp::SetProperty { node, key, value } => {
            buf.extend_from_slice(&node.to_le_bytes());
            encode_str(key, buf);
            encode_str(value, buf);
        }
        SceneOp::MoveSubtree {
            node,
            new_parent,
            new_sibling,
        } => {
            buf.extend_from_slice(&node.to_le_bytes());
            buf.extend_from_slice(&new_parent.to_le_bytes());
            buf.extend_from_slice(&new_sibling.to_le_bytes());
        }
        SceneOp::MoveChild {
            parent,
            child_node,
            to_index,
        } => {
            buf.extend_from_slice(&parent.to_le_bytes());
            buf.extend_from_slice(&child_node.to_le_bytes());
            buf.extend_from_slice(&to_index.to_le_bytes());
        }
        SceneOp::BatchUpdate { updates } => {
            buf.extend_from_slice(&(updates.len() as u32).to_le_bytes());
            for update in updates {
                buf.extend_from_slice(&update.node.to_le_bytes());
                encode_str(&update.key, buf);
                encode_str(&update.value, buf);
            }
        }
        SceneOp::BatchStructure { structure_ops } => {
            buf.extend_from_slice(&(structure_ops.len() as u32).to_le_bytes());
            for inner in structure_ops {
                buf.push(scene_op_tag(inner));
                encode_scene_op_body(inner, buf);
            }
        }
        SceneOp::MoveShard { node, new_shard } => {
            buf.extend_from_slice(&node.to_le_bytes());
            buf.extend_from_slice(&new_shard.to_le_bytes());
        }
        SceneOp::StateTransfer { node, shard, state } => {
            buf.extend_from_slice(&node.to_le_bytes());
            buf.extend_from_slice(&shard.to_le_bytes());
            buf.extend_from_slice(&state.left_child().to_le_bytes());
            buf.extend_from_slice(&state.right_sibling().to_le_bytes());
            encode_properties(state.properties(), buf);
        }
        SceneOp::DetachChild { parent, child } => {
            buf.extend_from_slice(&parent.to_le_bytes());
            buf.extend_from_slice(&child.to_le_bytes());
        }
        SceneOp::AttachChild {
            parent,
            child,
            position,
        } => {
            buf.extend_from_slice(&parent.to_le_bytes());
            buf.extend_from_slice(&child.to_le_bytes());
            buf.extend_from_slice(&position.to_le_bytes());
        }
    }
}

fn encode_hlc(hlc: Hlc, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&hlc.l().to_le_bytes());
    buf.extend_from_slice(&hlc.c().to_le_bytes());
}

fn encode_str(s: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn encode_properties(properties: &BTreeMap<String, String>, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(properties.len() as u32).to_le_bytes());
    for (key, value) in properties {
        encode_str(key, buf);
        encode_str(value, buf);
    }
}

/*
    decode
*/

/// Decode an entry from its wire frame, verifying the body checksum
pub fn decode_entry(frame: &[u8]) -> RuntimeResult<LogEntry> {
    if frame.len() < HEADER_SIZE {
        return Err(StorageError::DecodeUnexpectedEof.into());
    }
    let term = u64::from_le_bytes(frame[OFFSET_0_TERM].try_into().unwrap());
    let shard = u16::from_le_bytes(frame[OFFSET_1_SHARD].try_into().unwrap());
    let hlc = Hlc::new(
        u64::from_le_bytes(frame[OFFSET_2_HLC_L].try_into().unwrap()),
        u32::from_le_bytes(frame[OFFSET_3_HLC_C].try_into().unwrap()),
    );
    let tag = frame[OFFSET_4_CMD_TAG.start];
    let body_len = u32::from_le_bytes(frame[OFFSET_5_BODY_LEN].try_into().unwrap()) as usize;
    let checksum = u64::from_le_bytes(frame[OFFSET_6_CHECKSUM].try_into().unwrap());
    let body = &frame[HEADER_SIZE..];
    if body.len() != body_len {
        return Err(if body.len() < body_len {
            StorageError::DecodeUnexpectedEof.into()
        } else {
            StorageError::DecodeCorruptedPayloadMoreBytes.into()
        });
    }
    if CRC64.checksum(body) != checksum {
        return Err(StorageError::ChecksumMismatch.into());
    }
    let mut reader = BodyReader::new(body);
    let cmd = decode_cmd(tag, &mut reader)?;
    reader.finish()?;
    Ok(LogEntry {
        term,
        shard,
        hlc,
        cmd,
    })
}

fn decode_cmd(tag: u8, r: &mut BodyReader<'_>) -> RuntimeResult<Command> {
    match tag {
        TAG_TXN => {
            let txn_id = r.read_u64()?;
            let status = match r.read_u8()? {
                0 => TxnStatus::Committing,
                1 => TxnStatus::Committed,
                2 => TxnStatus::Aborted,
                _ => return Err(StorageError::DecodeUnknownTag.into()),
            };
            let shards = ShardSet::from_bits(r.read_u16()?);
            let coord_shard = r.read_u16()?;
            let hlc = r.read_hlc()?;
            let op_count = r.read_u32()?;
            let mut ops = Vec::with_capacity(op_count as usize);
            for _ in 0..op_count {
                let inner_tag = r.read_u8()?;
                ops.push(decode_scene_op(inner_tag, r)?);
            }
            Ok(Command::Txn(TxnState {
                txn_id,
                status,
                shards,
                coord_shard,
                hlc,
                ops,
            }))
        }
        TAG_COMMIT => Ok(Command::Commit {
            txn_id: r.read_u64()?,
            hlc: r.read_hlc()?,
        }),
        TAG_ABORT => Ok(Command::Abort {
            txn_id: r.read_u64()?,
        }),
        scene_tag => Ok(Command::Scene(decode_scene_op(scene_tag, r)?)),
    }
}

fn decode_scene_op(tag: u8, r: &mut BodyReader<'_>) -> RuntimeResult<SceneOp> {
    let op = match tag {
        TAG_ADD_CHILD | TAG_ADD_SIBLING => {
            let target = r.read_node()?;
            let new_node = r.read_node()?;
            let properties = r.read_properties()?;
            if tag == TAG_ADD_CHILD {
                SceneOp::AddChild {
                    target,
                    new_node,
                    properties,
                }
            } else {
                SceneOp::AddSibling {
                    target,
                    new_node,
                    properties,
                }
            }
        }
        TAG_REMOVE_NODE => SceneOp::RemoveNode {
            node: r.read_node()?,
        },
        TAG_SET_PROPERTY => SceneOp::SetProperty {
            node: r.read_node()?,
            key: r.read_str()?,
            value: r.read_str()?,
        },
        TAG_MOVE_SUBTREE => SceneOp::MoveSubtree {
            node: r.read_node()?,
            new_parent: r.read_node()?,
            new_sibling: r.read_node()?,
        },
        TAG_MOVE_CHILD => SceneOp::MoveChild {
            parent: r.read_node()?,
            child_node: r.read_node()?,
            to_index: r.read_i32()?,
        },
        TAG_BATCH_UPDATE => {
            let count = r.read_u32()?;
            let mut updates = Vec::with_capacity(count as usize);
            for _ in 0..count {
                updates.push(PropertyUpdate {
                    node: r.read_node()?,
                    key: r.read_str()?,
                    value: r.read_str()?,
                });
            }
            SceneOp::BatchUpdate { updates }
        }
        TAG_BATCH_STRUCTURE => {
            let count = r.read_u32()?;
            let mut structure_ops = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let inner_tag = r.read_u8()?;
                structure_ops.push(decode_scene_op(inner_tag, r)?);
            }
            SceneOp::BatchStructure { structure_ops }
        }
        TAG_MOVE_SHARD => SceneOp::MoveShard {
            node: r.read_node()?,
            new_shard: r.read_u16()?,
        },
        TAG_STATE_TRANSFER => {
            let node = r.read_node()?;
            let shard = r.read_u16()?;
            let left_child = r.read_node()?;
            let right_sibling = r.read_node()?;
            let properties = r.read_properties()?;
            SceneOp::StateTransfer {
                node,
                shard,
                state: NodeState::assemble(left_child, right_sibling, properties),
            }
        }
        TAG_SHARD_REMOVE => SceneOp::ShardRemove {
            node: r.read_node()?,
        },
        TAG_DETACH_CHILD => SceneOp::DetachChild {
            parent: r.read_node()?,
            child: r.read_node()?,
        },
        TAG_ATTACH_CHILD => SceneOp::AttachChild {
            parent: r.read_node()?,
            child: r.read_node()?,
            position: r.read_u16()?,
        },
        _ => return Err(StorageError::DecodeUnknownTag.into()),
    };
    Ok(op)
}

/// A bounds-checked cursor over a command body
struct BodyReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }
    fn take(&mut self, n: usize) -> RuntimeResult<&'a [u8]> {
        if self.cursor + n > self.buf.len() {
            return Err(StorageError::DecodeUnexpectedEof.into());
        }
        let slice = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }
    fn read_u8(&mut self) -> RuntimeResult<u8> {
        Ok(self.take(1)?[0])
    }
    fn read_u16(&mut self) -> RuntimeResult<u16> {
        Ok(u16::from_le_bytes(self.take(sizeof!(u16))?.try_into().unwrap()))
    }
    fn read_u32(&mut self) -> RuntimeResult<u32> {
        Ok(u32::from_le_bytes(self.take(sizeof!(u32))?.try_into().unwrap()))
    }
    fn read_u64(&mut self) -> RuntimeResult<u64> {
        Ok(u64::from_le_bytes(self.take(sizeof!(u64))?.try_into().unwrap()))
    }
    fn read_i32(&mut self) -> RuntimeResult<i32> {
        Ok(i32::from_le_bytes(self.take(sizeof!(i32))?.try_into().unwrap()))
    }
    fn read_node(&mut self) -> RuntimeResult<NodeId> {
        self.read_u16()
    }
    fn read_hlc(&mut self) -> RuntimeResult<Hlc> {
        Ok(Hlc::new(self.read_u64()?, self.read_u32()?))
    }
    fn read_str(&mut self) -> RuntimeResult<String> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| StorageError::DecodeBadString.into())
    }
    fn read_properties(&mut self) -> RuntimeResult<BTreeMap<String, String>> {
        let count = self.read_u32()?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_str()?;
            let value = self.read_str()?;
            properties.insert(key, value);
        }
        Ok(properties)
    }
    /// The body must be fully consumed
    fn finish(self) -> RuntimeResult<()> {
        if self.cursor != self.buf.len() {
            return Err(StorageError::DecodeCorruptedPayloadMoreBytes.into());
        }
        Ok(())
    }
}
