/*
 * Created on Wed Jan 10 2024
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

use {super::config::ConfigError, core::fmt};

pub type RuntimeResult<T> = Result<T, Error>;

#[derive(Debug)]
#[cfg_attr(test, derive(PartialEq))]
/// The all-encompassing error type at the engine boundary. Every subsystem error is
/// classified into an [`ErrorKind`] and propagated with `?`
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn with_kind(kind: ErrorKind) -> Self {
        Self { kind }
    }
    /// Returns the error kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}", self.kind)
    }
}

impl std::error::Error for Error {}

impl<E: Into<ErrorKind>> From<E> for Error {
    fn from(e: E) -> Self {
        Self::with_kind(e.into())
    }
}

#[derive(Debug)]
#[cfg_attr(test, derive(PartialEq))]
/// Classification of engine errors by subsystem
pub enum ErrorKind {
    /// configuration errors
    Config(ConfigError),
    /// scene state machine errors
    Scene(SceneError),
    /// transaction errors
    Txn(TransactionError),
    /// replication/consensus errors
    Repl(ReplError),
    /// entry encoding/decoding errors
    Storage(StorageError),
    /// any other error
    Other(String),
}

direct_from! {
    ErrorKind => {
        ConfigError as Config,
        SceneError as Scene,
        TransactionError as Txn,
        ReplError as Repl,
        StorageError as Storage,
        String as Other,
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Scene(e) => write!(f, "scene error: {e:?}"),
            Self::Txn(e) => write!(f, "transaction error: {e:?}"),
            Self::Repl(e) => write!(f, "replication error: {e:?}"),
            Self::Storage(e) => write!(f, "storage error: {e:?}"),
            Self::Other(e) => write!(f, "error: {e}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Scene state machine errors
pub enum SceneError {
    /// the node id lies outside the configured node space
    NodeIdOutOfRange,
    /// an operation attempted to create a node that already exists
    NodeAlreadyExists,
    /// an operation referenced a node that does not exist
    NodeNotFound,
    /// root creation was attempted while the target root id is live
    RootAlreadyExists,
    /// a structural edit would orphan or cycle the tree. fatal for the applying replica
    TreeInvariantViolation,
    /// a `move_shard` subtree spans more than its source shard(s)
    SubtreeNotColocated,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Transaction errors
pub enum TransactionError {
    /// the submitted transaction contains no operations
    EmptyTransaction,
    /// an operation failed input validation, aborting the enclosing transaction
    RejectedOp,
    /// the conflict detector tripped
    Conflict,
    /// the transaction overran the HLC drift window while committing
    HlcWindowExpired,
    /// the referenced transaction is not known to this replica
    UnknownTxn,
    /// a terminal transaction received a second terminal transition
    AlreadyTerminal,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Replication layer errors
pub enum ReplError {
    /// an append was attempted against a non-leader replica
    NotLeader,
    /// no leader is available for the shard within the bounded retry interval
    NoLeader,
    /// the shard id is not part of the cluster
    UnknownShard,
    /// the replica is marked crashed and cannot serve
    Crashed,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Entry encode/decode errors
pub enum StorageError {
    /// unknown command tag. usually indicates a corrupted payload
    DecodeUnknownTag,
    /// the payload has fewer bytes than expected
    DecodeUnexpectedEof,
    /// the payload has trailing bytes beyond the declared body
    DecodeCorruptedPayloadMoreBytes,
    /// a non-utf8 byte sequence where a string was expected
    DecodeBadString,
    /// the body checksum did not match
    ChecksumMismatch,
}
