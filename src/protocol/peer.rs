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

//! Per-peer connection state.

use crate::{
    base::{queue_set::QueueSet, schema::TotalDifficulty, Mutex, RwLock},
    channel,
    crypto::Hash,
    protocol::message::*,
    Block, BlockHeader, Debt, Error, ErrorKind, Result, Transaction, NUM_CHAINS,
};
use num_bigint::BigUint;

/// Capacity of the per-peer known-hash sets.
const KNOWN_SET_CAPACITY: usize = 32 * 1024;

/// A connected remote node.
///
/// Outbound frames go through the bounded transport sender; a full queue is
/// treated as a broken connection so a stalled peer cannot block the node.
/// The known-hash sets suppress announcement reflection.
#[derive(Debug)]
pub struct Peer {
    /// Stable identifier of the remote node.
    pub node_id: String,
    /// Shard the remote node lives on.
    pub shard: u64,
    /// Outbound transport endpoint.
    tx: channel::Sender<ProtocolMessage>,
    /// Hashes of transactions the remote is known to have.
    known_txs: Mutex<QueueSet<Hash>>,
    /// Hashes of blocks the remote is known to have.
    known_blocks: Mutex<QueueSet<Hash>>,
    /// Hashes of debts the remote is known to have.
    known_debts: Mutex<QueueSet<Hash>>,
    /// Last advertised (head, total difficulty) per chain.
    head: RwLock<Vec<(Hash, BigUint)>>,
}

impl Peer {
    pub fn new(node_id: String, shard: u64, tx: channel::Sender<ProtocolMessage>) -> Self {
        Peer {
            node_id,
            shard,
            tx,
            known_txs: Mutex::new(QueueSet::with_capacity(KNOWN_SET_CAPACITY)),
            known_blocks: Mutex::new(QueueSet::with_capacity(KNOWN_SET_CAPACITY)),
            known_debts: Mutex::new(QueueSet::with_capacity(KNOWN_SET_CAPACITY)),
            head: RwLock::new(vec![(Hash::default(), BigUint::default()); NUM_CHAINS]),
        }
    }

    /// Record the advertised head of one remote chain.
    pub fn set_head(&self, chain_num: u64, hash: Hash, td: BigUint) {
        if let Some(entry) = self.head.write().get_mut(chain_num as usize) {
            *entry = (hash, td);
        }
    }

    /// Last advertised (head, total difficulty) of one remote chain.
    pub fn head_by_chain(&self, chain_num: u64) -> (Hash, BigUint) {
        self.head.read()[chain_num as usize].clone()
    }

    pub fn knows_tx(&self, hash: &Hash) -> bool {
        self.known_txs.lock().contains(hash)
    }

    pub fn mark_tx(&self, hash: Hash) {
        self.known_txs.lock().push(hash);
    }

    pub fn knows_block(&self, hash: &Hash) -> bool {
        self.known_blocks.lock().contains(hash)
    }

    pub fn mark_block(&self, hash: Hash) {
        self.known_blocks.lock().push(hash);
    }

    pub fn knows_debt(&self, hash: &Hash) -> bool {
        self.known_debts.lock().contains(hash)
    }

    pub fn mark_debt(&self, hash: Hash) {
        self.known_debts.lock().push(hash);
    }

    /// Push one frame to the remote without waiting.
    pub fn send(&self, msg: ProtocolMessage) -> Result<()> {
        self.tx
            .try_send(msg)
            .map_err(|err| Error::new_ext(ErrorKind::Other, format!("peer send: {}", err)))
    }

    pub fn send_transaction_hash(&self, msg: &TransactionHashMsg) -> Result<()> {
        self.send(ProtocolMessage::new(TRANSACTION_HASH_MSG_CODE, msg)?)
    }

    pub fn send_transaction_request(&self, msg: &TransactionHashMsg) -> Result<()> {
        self.send(ProtocolMessage::new(TRANSACTION_REQUEST_MSG_CODE, msg)?)
    }

    pub fn send_transactions(&self, msgs: &[TransactionMsg]) -> Result<()> {
        self.send(ProtocolMessage::new(TRANSACTIONS_MSG_CODE, &msgs)?)
    }

    pub fn send_transaction(&self, tx: Transaction, chain_num: u64) -> Result<()> {
        self.send_transactions(&[TransactionMsg { chain_num, tx }])
    }

    pub fn send_block_hash(&self, msg: &BlockHashMsg) -> Result<()> {
        self.send(ProtocolMessage::new(BLOCK_HASH_MSG_CODE, msg)?)
    }

    pub fn send_block_request(&self, msg: &BlockHashMsg) -> Result<()> {
        self.send(ProtocolMessage::new(BLOCK_REQUEST_MSG_CODE, msg)?)
    }

    pub fn send_block(&self, msg: &BlockMsg) -> Result<()> {
        self.send(ProtocolMessage::new(BLOCK_MSG_CODE, msg)?)
    }

    pub fn send_head_status(&self, msg: &ChainHeadStatus) -> Result<()> {
        self.send(ProtocolMessage::new(STATUS_CHAIN_HEAD_MSG_CODE, msg)?)
    }

    pub fn send_debts(&self, debts: &[Debt]) -> Result<()> {
        self.send(ProtocolMessage::new(DEBT_MSG_CODE, &debts)?)
    }

    pub fn send_block_headers(
        &self,
        magic: u32,
        chain_num: u64,
        headers: Vec<BlockHeader>,
    ) -> Result<()> {
        self.send(ProtocolMessage::new(
            BLOCK_HEADERS_MSG_CODE,
            &BlockHeadersMsg {
                magic,
                chain_num,
                headers,
            },
        )?)
    }

    pub fn send_blocks(&self, magic: u32, chain_num: u64, blocks: Vec<Block>) -> Result<()> {
        let block_nums = blocks.iter().map(|b| b.header.height).collect();
        self.send(ProtocolMessage::new(
            BLOCKS_PRE_MSG_CODE,
            &BlocksPreMsg {
                magic,
                chain_num,
                block_nums,
            },
        )?)?;
        self.send(ProtocolMessage::new(
            BLOCKS_MSG_CODE,
            &BlocksMsg {
                magic,
                chain_num,
                blocks,
            },
        )?)
    }

    /// Advertise the heads carried by a freshly received status frame.
    pub fn apply_status(&self, status: &StatusData) {
        for (i, (hash, TotalDifficulty(td))) in status
            .current_block
            .iter()
            .zip(status.td.iter())
            .enumerate()
        {
            self.set_head(i as u64, *hash, td.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::simple_channel;
    use crate::crypto::Hashable;

    fn create_peer() -> (Peer, channel::Receiver<ProtocolMessage>) {
        let (tx, rx) = simple_channel();
        (Peer::new("node-1".to_owned(), 1, tx), rx)
    }

    #[test]
    fn known_sets_deduplicate() {
        let (peer, _rx) = create_peer();
        let hash = "tx".primary_hash();

        assert!(!peer.knows_tx(&hash));
        peer.mark_tx(hash);
        assert!(peer.knows_tx(&hash));
        assert!(!peer.knows_block(&hash));
        assert!(!peer.knows_debt(&hash));
    }

    #[test]
    fn head_updates_per_chain() {
        let (peer, _rx) = create_peer();
        let hash = "head".primary_hash();

        peer.set_head(1, hash, BigUint::from(9_u32));

        let (h, td) = peer.head_by_chain(1);
        assert_eq!(h, hash);
        assert_eq!(td, BigUint::from(9_u32));
        let (h0, td0) = peer.head_by_chain(0);
        assert!(h0.is_empty());
        assert_eq!(td0, BigUint::default());
    }

    #[test]
    fn send_lands_on_transport() {
        let (peer, rx) = create_peer();
        let msg = TransactionHashMsg {
            chain_num: 0,
            tx_hash: "tx".primary_hash(),
        };

        peer.send_transaction_hash(&msg).unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.code, TRANSACTION_HASH_MSG_CODE);
        assert_eq!(frame.decode::<TransactionHashMsg>().unwrap(), msg);
    }

    #[test]
    fn send_blocks_emits_pre_announcement() {
        let (peer, rx) = create_peer();

        peer.send_blocks(42, 0, vec![]).unwrap();

        assert_eq!(rx.try_recv().unwrap().code, BLOCKS_PRE_MSG_CODE);
        assert_eq!(rx.try_recv().unwrap().code, BLOCKS_MSG_CODE);
    }

    #[test]
    fn send_to_closed_transport_fails() {
        let (peer, rx) = create_peer();
        drop(rx);

        let err = peer
            .send_transaction_hash(&TransactionHashMsg {
                chain_num: 0,
                tx_hash: Hash::default(),
            })
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Other);
    }
}
