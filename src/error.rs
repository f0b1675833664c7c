// This file is part of SEELE-CORE.
//
// Copyright (C) 2022 Seele Contributors.
//
// SEELE-CORE is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// SEELE-CORE is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with SEELE-CORE. If not, see <https://www.gnu.org/licenses/>.

//! Library error codes and results.

use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Serialization or framing failure.
    MalformedData,
    /// Transaction or debt signature check failure.
    InvalidSignature,
    /// Transaction already present in the pool or on the chain.
    DuplicatedTx,
    /// Block already present in the chain store.
    DuplicatedBlock,
    /// Block previous hash does not resolve on the target chain.
    UnknownParent,
    /// Structurally broken block: height, timestamp or merkle root disagree
    /// with the parent and body.
    InvalidBlock,
    /// Proof-of-work seal above target or difficulty mismatch.
    InvalidSeal,
    /// Block execution outcome disagrees with the header state root or
    /// violates balance/nonce rules.
    InvalidState,
    /// Stored genesis disagrees with the configured one. Fatal at start.
    GenesisMismatch,
    /// Persistent store failure.
    DatabaseFault,
    /// Peer status exchange failed.
    HandshakeFailed,
    /// A synchronization round is already running.
    AlreadySynchronizing,
    /// Miner start requested while it is running.
    MinerIsRunning,
    /// Miner operation requested while it is administratively stopped.
    MinerIsStopped,
    /// Miner start requested while chains are synchronizing.
    NodeIsSyncing,
    /// Requested entity not found.
    ResourceNotFound,
    /// Pool capacity exhausted.
    PoolFull,
    Other,
}

/// Error kind strings.
pub(crate) mod error_kind_str {
    pub const MALFORMED_DATA: &str = "malformed data";
    pub const INVALID_SIGNATURE: &str = "invalid signature";
    pub const DUPLICATED_TX: &str = "duplicated transaction";
    pub const DUPLICATED_BLOCK: &str = "duplicated block";
    pub const UNKNOWN_PARENT: &str = "unknown parent block";
    pub const INVALID_BLOCK: &str = "invalid block";
    pub const INVALID_SEAL: &str = "invalid proof-of-work seal";
    pub const INVALID_STATE: &str = "invalid state transition";
    pub const GENESIS_MISMATCH: &str = "genesis mismatch";
    pub const DATABASE_FAULT: &str = "database fault";
    pub const HANDSHAKE_FAILED: &str = "handshake failed";
    pub const ALREADY_SYNCHRONIZING: &str = "already synchronizing";
    pub const MINER_IS_RUNNING: &str = "miner is running";
    pub const MINER_IS_STOPPED: &str = "miner is stopped";
    pub const NODE_IS_SYNCING: &str = "can not start miner when syncing";
    pub const RESOURCE_NOT_FOUND: &str = "resource not found";
    pub const POOL_FULL: &str = "pool capacity exhausted";
    pub const OTHER: &str = "other";
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        let kind_str = match self {
            MalformedData => error_kind_str::MALFORMED_DATA,
            InvalidSignature => error_kind_str::INVALID_SIGNATURE,
            DuplicatedTx => error_kind_str::DUPLICATED_TX,
            DuplicatedBlock => error_kind_str::DUPLICATED_BLOCK,
            UnknownParent => error_kind_str::UNKNOWN_PARENT,
            InvalidBlock => error_kind_str::INVALID_BLOCK,
            InvalidSeal => error_kind_str::INVALID_SEAL,
            InvalidState => error_kind_str::INVALID_STATE,
            GenesisMismatch => error_kind_str::GENESIS_MISMATCH,
            DatabaseFault => error_kind_str::DATABASE_FAULT,
            HandshakeFailed => error_kind_str::HANDSHAKE_FAILED,
            AlreadySynchronizing => error_kind_str::ALREADY_SYNCHRONIZING,
            MinerIsRunning => error_kind_str::MINER_IS_RUNNING,
            MinerIsStopped => error_kind_str::MINER_IS_STOPPED,
            NodeIsSyncing => error_kind_str::NODE_IS_SYNCING,
            ResourceNotFound => error_kind_str::RESOURCE_NOT_FOUND,
            PoolFull => error_kind_str::POOL_FULL,
            Other => error_kind_str::OTHER,
        };
        write!(f, "{}", kind_str)
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that
/// may have propagated the error.
#[derive(Debug)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Optional lower-level cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            source: None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new_ext(ErrorKind::Other, s)
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(kind.into())
    }
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error {
            kind,
            source: Some(error.into()),
        }
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.source.is_none() && other.source.is_none() {
            true
        } else if self.source.is_some() && other.source.is_some() {
            format!("{:?}", self.source) == format!("{:?}", other.source)
        } else {
            false
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}
