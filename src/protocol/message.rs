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

//! Wire protocol frames.
//!
//! Every frame is a 16-bit code plus a MessagePack payload. The code
//! assignments are fixed and must match on both ends of a connection.

use crate::{
    base::schema::{Block, BlockHeader, TotalDifficulty},
    base::serialize::{rmp_deserialize, rmp_serialize},
    crypto::Hash,
    Result, Transaction,
};

/// Protocol identifier.
pub const PROTOCOL_NAME: &str = "seele";

/// Protocol version exchanged during the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the protocol code space.
pub const PROTOCOL_CODE_LENGTH: u16 = 14;

pub const TRANSACTION_HASH_MSG_CODE: u16 = 0;
pub const TRANSACTION_REQUEST_MSG_CODE: u16 = 1;
pub const TRANSACTIONS_MSG_CODE: u16 = 2;
pub const BLOCK_HASH_MSG_CODE: u16 = 3;
pub const BLOCK_REQUEST_MSG_CODE: u16 = 4;
pub const BLOCK_MSG_CODE: u16 = 5;
pub const STATUS_DATA_MSG_CODE: u16 = 6;
pub const STATUS_CHAIN_HEAD_MSG_CODE: u16 = 7;
pub const GET_BLOCK_HEADERS_MSG_CODE: u16 = 8;
pub const BLOCK_HEADERS_MSG_CODE: u16 = 9;
pub const GET_BLOCKS_MSG_CODE: u16 = 10;
pub const BLOCKS_PRE_MSG_CODE: u16 = 11;
pub const BLOCKS_MSG_CODE: u16 = 12;
pub const DEBT_MSG_CODE: u16 = 13;

/// Human readable code name for log lines.
pub fn code_to_str(code: u16) -> &'static str {
    match code {
        TRANSACTION_HASH_MSG_CODE => "transactionHashMsgCode",
        TRANSACTION_REQUEST_MSG_CODE => "transactionRequestMsgCode",
        TRANSACTIONS_MSG_CODE => "transactionsMsgCode",
        BLOCK_HASH_MSG_CODE => "blockHashMsgCode",
        BLOCK_REQUEST_MSG_CODE => "blockRequestMsgCode",
        BLOCK_MSG_CODE => "blockMsgCode",
        STATUS_DATA_MSG_CODE => "statusDataMsgCode",
        STATUS_CHAIN_HEAD_MSG_CODE => "statusChainHeadMsgCode",
        GET_BLOCK_HEADERS_MSG_CODE => "downloader.getBlockHeadersMsg",
        BLOCK_HEADERS_MSG_CODE => "downloader.blockHeadersMsg",
        GET_BLOCKS_MSG_CODE => "downloader.getBlocksMsg",
        BLOCKS_PRE_MSG_CODE => "downloader.blocksPreMsg",
        BLOCKS_MSG_CODE => "downloader.blocksMsg",
        DEBT_MSG_CODE => "debtMsgCode",
        _ => "unknown",
    }
}

/// One framed message travelling on a peer connection.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ProtocolMessage {
    /// Message code.
    pub code: u16,
    /// Length-prefixed serialized payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    /// Frame a payload under the given code.
    pub fn new<T: serde::Serialize>(code: u16, payload: &T) -> Result<ProtocolMessage> {
        Ok(ProtocolMessage {
            code,
            payload: rmp_serialize(payload)?,
        })
    }

    /// Decode the payload.
    pub fn decode<'a, T: serde::Deserialize<'a>>(&'a self) -> Result<T> {
        rmp_deserialize(&self.payload)
    }
}

/// Handshake status frame.
///
/// Carries the remote chain landscape: one (head, total difficulty) entry
/// per chain. A handshake fails on network, genesis or array length
/// disagreement.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct StatusData {
    pub network_id: u64,
    pub shard: u64,
    pub protocol_version: u16,
    pub genesis_hash: Hash,
    pub genesis_difficulty: u64,
    pub td: Vec<TotalDifficulty>,
    pub current_block: Vec<Hash>,
}

/// Transaction hash announcement.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct TransactionHashMsg {
    pub chain_num: u64,
    pub tx_hash: Hash,
}

/// One transaction and the chain it is pending on.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct TransactionMsg {
    pub chain_num: u64,
    pub tx: Transaction,
}

/// Block hash announcement.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlockHashMsg {
    pub chain_num: u64,
    pub block_hash: Hash,
}

/// One full block.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlockMsg {
    pub chain_num: u64,
    pub block: Block,
}

/// Chain head advertisement, sent whenever a head moves.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ChainHeadStatus {
    pub chain_num: u64,
    pub current_block: Hash,
    pub td: TotalDifficulty,
}

/// Ranged header request, keyed by a per-request magic number.
///
/// When `hash` is non-empty it overrides `number` as the range start.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlockHeadersQuery {
    pub magic: u32,
    pub chain_num: u64,
    pub hash: Hash,
    pub number: u64,
    pub amount: u64,
    pub reverse: bool,
}

/// Header range response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlockHeadersMsg {
    pub magic: u32,
    pub chain_num: u64,
    pub headers: Vec<BlockHeader>,
}

/// Ranged body request, keyed by a per-request magic number.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlocksQuery {
    pub magic: u32,
    pub chain_num: u64,
    pub hash: Hash,
    pub number: u64,
    pub amount: u64,
}

/// Heights announcement preceding a block range response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlocksPreMsg {
    pub magic: u32,
    pub chain_num: u64,
    pub block_nums: Vec<u64>,
}

/// Block range response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlocksMsg {
    pub magic: u32,
    pub chain_num: u64,
    pub blocks: Vec<Block>,
}
