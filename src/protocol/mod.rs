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

//! Peer protocol state machine.
//!
//! Each peer is a long-lived duplex message channel. After a successful
//! status handshake the peer enters the message loop, which runs in its own
//! task until the transport breaks or the peer commits a protocol violation.
//! The protocol reacts to bus events (new transactions, mined blocks) by
//! announcing hashes, answers request codes from the pools and stores, and
//! kicks the synchronizer whenever a peer advertises a better head.
//!
//! The raw transport and discovery are external collaborators: a connection
//! shows up here as a pair of framed-message channel endpoints.

pub mod downloader;
pub mod message;
pub mod peer;
pub mod peer_set;

pub use downloader::Downloader;
pub use message::ProtocolMessage;
pub use peer::Peer;
pub use peer_set::PeerSet;

use self::message::*;
use crate::{
    base::schema::{debts_by_shard, TotalDifficulty},
    chain::{Blockchain, Genesis},
    channel,
    crypto::Hash,
    event::{Event, EventBus, Topic},
    pool::{DebtPool, TxPool},
    store::Database,
    Block, Debt, Error, ErrorKind, Result, Transaction, CONFIRMED_BLOCK_NUMBER, NUM_CHAINS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the unconditional synchronization attempt.
const FORCE_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Max transactions per frame during the initial pending-transaction sync.
const TX_SYNC_PACK_SIZE: usize = 1024;

/// Max pending transactions dumped per chain to a fresh peer.
const PENDING_FETCH_LIMIT: usize = 4096;

/// Duplex framed-message endpoint of one peer connection.
pub struct PeerChannel {
    pub tx: channel::Sender<ProtocolMessage>,
    pub rx: channel::Receiver<ProtocolMessage>,
}

/// Two connected endpoints, one per side. Used by in-process setups and
/// tests; a network transport provides the same shape.
pub fn duplex_pair() -> (PeerChannel, PeerChannel) {
    let (a_tx, a_rx) = channel::simple_channel();
    let (b_tx, b_rx) = channel::simple_channel();
    (
        PeerChannel { tx: a_tx, rx: b_rx },
        PeerChannel { tx: b_tx, rx: a_rx },
    )
}

/// Static protocol parameters.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub network_id: u64,
    /// Shard this node lives on.
    pub shard: u64,
    /// Identifier advertised to remotes.
    pub node_id: String,
    /// Enables the chatty per-message traces.
    pub print_explosion_log: bool,
}

/// The `seele` protocol instance of one node.
pub struct SeeleProtocol<D: Database> {
    config: ProtocolConfig,
    genesis_hash: Hash,
    genesis_difficulty: u64,
    chains: [Arc<Blockchain<D>>; NUM_CHAINS],
    tx_pools: [Arc<TxPool<D>>; NUM_CHAINS],
    debt_pools: [Arc<DebtPool<D>>; NUM_CHAINS],
    peer_set: Arc<PeerSet>,
    downloader: Arc<Downloader<D>>,
    bus: Arc<EventBus>,
    sync_tx: channel::Sender<()>,
    sync_rx: channel::Receiver<()>,
    stopping: AtomicBool,
}

impl<D: Database> SeeleProtocol<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProtocolConfig,
        genesis: &Genesis,
        chains: [Arc<Blockchain<D>>; NUM_CHAINS],
        tx_pools: [Arc<TxPool<D>>; NUM_CHAINS],
        debt_pools: [Arc<DebtPool<D>>; NUM_CHAINS],
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let downloader = Arc::new(Downloader::new(chains.clone(), bus.clone()));
        let (sync_tx, sync_rx) = channel::simple_channel();
        Arc::new(SeeleProtocol {
            config,
            genesis_hash: genesis.header_hash(),
            genesis_difficulty: genesis.info.difficult as u64,
            chains,
            tx_pools,
            debt_pools,
            peer_set: Arc::new(PeerSet::new()),
            downloader,
            bus,
            sync_tx,
            sync_rx,
            stopping: AtomicBool::new(false),
        })
    }

    pub fn downloader(&self) -> Arc<Downloader<D>> {
        self.downloader.clone()
    }

    pub fn peer_set(&self) -> Arc<PeerSet> {
        self.peer_set.clone()
    }

    /// Register the bus listeners and spawn the syncer task.
    pub fn start(self: &Arc<Self>) {
        debug!("[protocol] starting");

        let weak = Arc::downgrade(self);
        self.bus
            .subscribe(Topic::TxInserted, "protocol", move |event| {
                if let (Some(proto), Event::TxInserted { chain_num, tx }) =
                    (weak.upgrade(), event)
                {
                    proto.handle_new_tx(*chain_num, tx);
                }
            });

        let weak = Arc::downgrade(self);
        self.bus
            .subscribe(Topic::BlockMined, "protocol", move |event| {
                if let (Some(proto), Event::BlockMined { chain_num, block }) =
                    (weak.upgrade(), event)
                {
                    proto.handle_new_mined_block(*chain_num, block);
                }
            });

        let weak: Weak<SeeleProtocol<D>> = Arc::downgrade(self);
        let sync_rx = self.sync_rx.clone();
        std::thread::spawn(move || loop {
            let trigger = sync_rx.recv_timeout_sync(FORCE_SYNC_INTERVAL);
            if matches!(trigger, Err(channel::ChannelError::RecvError)) {
                break;
            }
            let proto = match weak.upgrade() {
                Some(proto) => proto,
                None => break,
            };
            if proto.stopping.load(Ordering::SeqCst) {
                break;
            }
            proto.synchronise_round();
        });
    }

    /// Stop the syncer and stop reacting to bus events. Peer tasks die with
    /// their transports.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.sync_tx.close();
        self.bus.unsubscribe(Topic::TxInserted, "protocol");
        self.bus.unsubscribe(Topic::BlockMined, "protocol");
        debug!("[protocol] stopped");
    }

    /// One synchronization attempt: best same-shard peer per chain, then one
    /// downloader round. Shared entry point of the force-sync tick and the
    /// on-demand kicks.
    fn synchronise_round(&self) {
        if self.peer_set.is_empty() {
            return;
        }
        let heads_before: Vec<Hash> = self
            .chains
            .iter()
            .map(|chain| chain.head_hash().unwrap_or_default())
            .collect();
        let best = self.peer_set.best_peers(self.config.shard);
        match self.downloader.synchronise(best) {
            Ok(()) => {
                // Advertise only the chains this round actually moved.
                for chain_num in 0..NUM_CHAINS {
                    let now = self.chains[chain_num].head_hash().unwrap_or_default();
                    if now != heads_before[chain_num] {
                        self.broadcast_chain_head(chain_num as u64);
                    }
                }
            }
            Err(err) if err.kind == ErrorKind::AlreadySynchronizing => {
                debug!("[protocol] sync already running");
            }
            Err(err) => error!("[protocol] sync round failed: {}", err.to_string_full()),
        }
    }

    /// Accept a new connection: run the status handshake, register the peer
    /// and spawn its message loop. The caller drops the channel (and thereby
    /// disconnects) when an error is returned.
    pub fn handle_add_peer(
        self: &Arc<Self>,
        node_id: &str,
        channel: PeerChannel,
    ) -> Result<Arc<Peer>> {
        if self.peer_set.find(node_id).is_some() {
            return Err(Error::new_ext(
                ErrorKind::HandshakeFailed,
                "peer already connected",
            ));
        }

        let local = self.local_status()?;
        channel
            .tx
            .try_send(ProtocolMessage::new(STATUS_DATA_MSG_CODE, &local)?)
            .map_err(|err| Error::new_ext(ErrorKind::HandshakeFailed, err.to_string()))?;

        let frame = channel
            .rx
            .recv_timeout_sync(HANDSHAKE_TIMEOUT)
            .map_err(|err| Error::new_ext(ErrorKind::HandshakeFailed, err.to_string()))?;
        if frame.code != STATUS_DATA_MSG_CODE {
            return Err(Error::new_ext(
                ErrorKind::HandshakeFailed,
                "unexpected first frame",
            ));
        }
        let remote: StatusData = frame
            .decode()
            .map_err(|_| Error::new_ext(ErrorKind::HandshakeFailed, "undecodable status"))?;

        if remote.network_id != self.config.network_id {
            return Err(Error::new_ext(
                ErrorKind::HandshakeFailed,
                "network id mismatch",
            ));
        }
        if remote.td.len() != NUM_CHAINS || remote.current_block.len() != NUM_CHAINS {
            return Err(Error::new_ext(
                ErrorKind::HandshakeFailed,
                "chain count mismatch",
            ));
        }
        // Shards carry distinct genesis blocks; the hash binds same-shard
        // peers only.
        if remote.shard == self.config.shard && remote.genesis_hash != self.genesis_hash {
            return Err(Error::new_ext(
                ErrorKind::HandshakeFailed,
                "genesis mismatch",
            ));
        }

        let peer = Arc::new(Peer::new(
            node_id.to_owned(),
            remote.shard,
            channel.tx.clone(),
        ));
        peer.apply_status(&remote);
        if !self.peer_set.add(peer.clone()) {
            return Err(Error::new_ext(
                ErrorKind::HandshakeFailed,
                "peer already connected",
            ));
        }
        info!(
            "[protocol] peer {} added (shard {})",
            node_id, remote.shard
        );

        self.sync_transactions(&peer);

        let proto = self.clone();
        let task_peer = peer.clone();
        let rx = channel.rx;
        async_std::task::spawn(async move {
            proto.handle_msg(task_peer, rx).await;
        });

        let _ = self.sync_tx.try_send(());
        Ok(peer)
    }

    pub fn handle_del_peer(&self, node_id: &str) {
        if self.peer_set.remove(node_id).is_some() {
            debug!("[protocol] peer {} removed", node_id);
        }
    }

    fn local_status(&self) -> Result<StatusData> {
        let mut td = Vec::with_capacity(NUM_CHAINS);
        let mut current_block = Vec::with_capacity(NUM_CHAINS);
        for chain in &self.chains {
            current_block.push(chain.head_hash()?);
            td.push(TotalDifficulty(chain.head_td()?));
        }
        Ok(StatusData {
            network_id: self.config.network_id,
            shard: self.config.shard,
            protocol_version: PROTOCOL_VERSION,
            genesis_hash: self.genesis_hash,
            genesis_difficulty: self.genesis_difficulty,
            td,
            current_block,
        })
    }

    /// Dump the pending transactions of every chain to a fresh peer.
    fn sync_transactions(&self, peer: &Arc<Peer>) {
        let mut pending = Vec::new();
        for (chain_num, pool) in self.tx_pools.iter().enumerate() {
            for tx in pool.pending_transactions(PENDING_FETCH_LIMIT) {
                pending.push(TransactionMsg {
                    chain_num: chain_num as u64,
                    tx,
                });
            }
        }
        debug!(
            "[protocol] tx sync to {}: {} pending",
            peer.node_id,
            pending.len()
        );
        for pack in pending.chunks(TX_SYNC_PACK_SIZE) {
            if let Err(err) = peer.send_transactions(pack) {
                warn!(
                    "[protocol] tx sync to {} aborted: {}",
                    peer.node_id,
                    err.to_string_full()
                );
                return;
            }
        }
    }

    /// Per-peer message loop. Ends on transport error or protocol violation;
    /// either way the peer leaves the set.
    async fn handle_msg(
        self: Arc<Self>,
        peer: Arc<Peer>,
        rx: channel::Receiver<ProtocolMessage>,
    ) {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(_) => break,
            };

            // Skip unsupported message codes from different-shard peers.
            if peer.shard != self.config.shard
                && msg.code != TRANSACTIONS_MSG_CODE
                && msg.code != DEBT_MSG_CODE
            {
                continue;
            }

            if self.config.print_explosion_log {
                debug!(
                    "[protocol] got msg {} from {}",
                    code_to_str(msg.code),
                    peer.node_id
                );
            }

            if let Err(err) = self.dispatch(&peer, &msg) {
                warn!(
                    "[protocol] dropping peer {} on {}: {}",
                    peer.node_id,
                    code_to_str(msg.code),
                    err.to_string_full()
                );
                break;
            }
        }

        self.handle_del_peer(&peer.node_id);
        debug!("[protocol] message loop of {} terminated", peer.node_id);
    }

    /// Handle one inbound frame. An `Err` is a protocol violation or a dead
    /// transport and terminates the peer.
    fn dispatch(&self, peer: &Arc<Peer>, msg: &ProtocolMessage) -> Result<()> {
        match msg.code {
            TRANSACTION_HASH_MSG_CODE => {
                let m: TransactionHashMsg = msg.decode()?;
                if !peer.knows_tx(&m.tx_hash) {
                    peer.mark_tx(m.tx_hash);
                    peer.send_transaction_request(&m)?;
                }
            }
            TRANSACTION_REQUEST_MSG_CODE => {
                let m: TransactionHashMsg = msg.decode()?;
                let chain = self.checked_chain(m.chain_num)?;
                match self.tx_pools[chain].get_transaction(&m.tx_hash) {
                    Some(tx) => peer.send_transaction(tx, m.chain_num)?,
                    None => debug!(
                        "[protocol] requested tx {} not pooled",
                        m.tx_hash.to_hex()
                    ),
                }
            }
            TRANSACTIONS_MSG_CODE => {
                let msgs: Vec<TransactionMsg> = msg.decode()?;
                if self.config.print_explosion_log {
                    debug!("[protocol] received {} transactions", msgs.len());
                }
                for m in msgs {
                    let hash = m.tx.hash();
                    peer.mark_tx(hash);
                    let shard = m.tx.data.from.shard();
                    if shard != self.config.shard {
                        self.send_different_shard_tx(&m.tx, m.chain_num, shard);
                        continue;
                    }
                    let chain = self.checked_chain(m.chain_num)?;
                    if let Err(err) = self.tx_pools[chain].add_transaction(m.tx) {
                        debug!(
                            "[protocol] tx {} not admitted: {}",
                            hash.to_hex(),
                            err.to_string_full()
                        );
                    }
                }
            }
            BLOCK_HASH_MSG_CODE => {
                let m: BlockHashMsg = msg.decode()?;
                debug!("[protocol] got block hash msg {}", m.block_hash.to_hex());
                if !peer.knows_block(&m.block_hash) {
                    peer.mark_block(m.block_hash);
                    peer.send_block_request(&m)?;
                }
            }
            BLOCK_REQUEST_MSG_CODE => {
                let m: BlockHashMsg = msg.decode()?;
                let chain = self.checked_chain(m.chain_num)?;
                match self.chains[chain].get_store().get_block(&m.block_hash)? {
                    Some(block) => peer.send_block(&BlockMsg {
                        chain_num: m.chain_num,
                        block,
                    })?,
                    None => debug!(
                        "[protocol] requested block {} unknown",
                        m.block_hash.to_hex()
                    ),
                }
            }
            BLOCK_MSG_CODE => {
                let m: BlockMsg = msg.decode()?;
                let chain = self.checked_chain(m.chain_num)?;
                let hash = m.block.header_hash();
                peer.mark_block(hash);
                info!(
                    "[protocol] got block message, height {}, hash {}",
                    m.block.header.height,
                    hash.to_hex()
                );
                match self.chains[chain].write_block(&m.block) {
                    Ok(()) => {}
                    Err(err)
                        if matches!(
                            err.kind,
                            ErrorKind::UnknownParent | ErrorKind::DuplicatedBlock
                        ) =>
                    {
                        debug!("[protocol] block {} skipped: {}", hash.to_hex(), err);
                    }
                    Err(err)
                        if matches!(
                            err.kind,
                            ErrorKind::InvalidBlock
                                | ErrorKind::InvalidSeal
                                | ErrorKind::InvalidState
                                | ErrorKind::InvalidSignature
                                | ErrorKind::MalformedData
                        ) =>
                    {
                        return Err(err);
                    }
                    Err(err) => {
                        error!(
                            "[protocol] block {} store failure: {}",
                            hash.to_hex(),
                            err.to_string_full()
                        );
                    }
                }
            }
            STATUS_CHAIN_HEAD_MSG_CODE => {
                let m: ChainHeadStatus = msg.decode()?;
                self.checked_chain(m.chain_num)?;
                let TotalDifficulty(td) = m.td;
                peer.set_head(m.chain_num, m.current_block, td);
                let _ = self.sync_tx.try_send(());
            }
            DEBT_MSG_CODE => {
                let debts: Vec<Debt> = msg.decode()?;
                info!("[protocol] got {} debts from {}", debts.len(), peer.node_id);
                for debt in &debts {
                    peer.mark_debt(debt.hash());
                    if debt.data.shard != self.config.shard {
                        continue;
                    }
                    let chain = self.checked_chain(debt.data.chain_num)?;
                    if let Err(err) = self.debt_pools[chain].add(debt.clone()) {
                        debug!(
                            "[protocol] debt {} not admitted: {}",
                            debt.hash().to_hex(),
                            err.to_string_full()
                        );
                    }
                }
                self.propagate_debts(&debts);
            }
            GET_BLOCK_HEADERS_MSG_CODE => {
                let query: BlockHeadersQuery = msg.decode()?;
                self.answer_headers_query(peer, &query)?;
            }
            GET_BLOCKS_MSG_CODE => {
                let query: BlocksQuery = msg.decode()?;
                self.answer_blocks_query(peer, &query)?;
            }
            BLOCK_HEADERS_MSG_CODE | BLOCKS_PRE_MSG_CODE | BLOCKS_MSG_CODE => {
                self.downloader.deliver_msg(msg);
            }
            code => {
                warn!("[protocol] unknown code {} from {}", code, peer.node_id);
            }
        }
        Ok(())
    }

    fn checked_chain(&self, chain_num: u64) -> Result<usize> {
        if chain_num >= NUM_CHAINS as u64 {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("chain number {} out of range", chain_num),
            ));
        }
        Ok(chain_num as usize)
    }

    /// Answer a ranged header query from the canonical index.
    fn answer_headers_query(&self, peer: &Arc<Peer>, query: &BlockHeadersQuery) -> Result<()> {
        let chain = self.checked_chain(query.chain_num)?;
        let store = self.chains[chain].get_store();

        let mut org_num = query.number;
        if !query.hash.is_empty() {
            match store.get_block_header(&query.hash)? {
                Some(header) => org_num = header.height,
                None => {
                    return peer.send_block_headers(query.magic, query.chain_num, vec![]);
                }
            }
        }

        let max_height = self.chains[chain].current_block()?.header.height;
        let mut headers = Vec::new();
        for cnt in 0..query.amount {
            let cur = if query.reverse {
                match org_num.checked_sub(cnt) {
                    Some(cur) => cur,
                    None => break,
                }
            } else {
                org_num + cnt
            };
            if cur > max_height {
                break;
            }
            let hash = match store.get_block_hash(cur)? {
                Some(hash) => hash,
                None => break,
            };
            match store.get_block_header(&hash)? {
                Some(header) => headers.push(header),
                None => break,
            }
        }
        debug!(
            "[protocol] answering header query chain {} start {} len {}",
            query.chain_num,
            org_num,
            headers.len()
        );
        peer.send_block_headers(query.magic, query.chain_num, headers)
    }

    /// Answer a ranged body query, bounded by the wire message size.
    fn answer_blocks_query(&self, peer: &Arc<Peer>, query: &BlocksQuery) -> Result<()> {
        let chain = self.checked_chain(query.chain_num)?;
        let store = self.chains[chain].get_store();

        let mut org_num = query.number;
        if !query.hash.is_empty() {
            match store.get_block_header(&query.hash)? {
                Some(header) => org_num = header.height,
                None => return peer.send_blocks(query.magic, query.chain_num, vec![]),
            }
        }

        let mut blocks = Vec::new();
        let mut total_len = 0_usize;
        for cnt in 0..query.amount {
            let cur = org_num + cnt;
            let hash = match store.get_block_hash(cur)? {
                Some(hash) => hash,
                None => break,
            };
            let block = match store.get_block(&hash)? {
                Some(block) => block,
                None => break,
            };
            let cur_len = crate::base::serialize::rmp_serialize(&block)?.len();
            if total_len > 0 && total_len + cur_len > downloader::MAX_MESSAGE_LENGTH {
                break;
            }
            total_len += cur_len;
            blocks.push(block);
        }
        debug!(
            "[protocol] answering block query chain {} start {} len {}",
            query.chain_num,
            org_num,
            blocks.len()
        );
        peer.send_blocks(query.magic, query.chain_num, blocks)
    }

    /// Bus reaction: announce a freshly pooled transaction to the peers of
    /// its sender shard.
    fn handle_new_tx(&self, chain_num: u64, tx: &Transaction) {
        if self.config.print_explosion_log {
            debug!("[protocol] find new tx");
        }
        let msg = TransactionHashMsg {
            chain_num,
            tx_hash: tx.hash(),
        };
        for peer in self.peer_set.peers_by_shard(tx.data.from.shard()) {
            if peer.knows_tx(&msg.tx_hash) {
                continue;
            }
            peer.mark_tx(msg.tx_hash);
            if let Err(err) = peer.send_transaction_hash(&msg) {
                warn!(
                    "[protocol] failed to announce tx to {}: {}",
                    peer.node_id,
                    err.to_string_full()
                );
            }
        }
    }

    /// Bus reaction: announce a locally mined block, release the debts of
    /// the block it confirms and advertise the new head.
    fn handle_new_mined_block(&self, chain_num: u64, block: &Block) {
        let block_hash = block.header_hash();
        let msg = BlockHashMsg {
            chain_num,
            block_hash,
        };
        for peer in self.peer_set.peers_by_shard(self.config.shard) {
            if peer.knows_block(&block_hash) {
                continue;
            }
            peer.mark_block(block_hash);
            if let Err(err) = peer.send_block_hash(&msg) {
                warn!(
                    "[protocol] failed to announce block to {}: {}",
                    peer.node_id,
                    err.to_string_full()
                );
            }
        }

        if block.header.height > CONFIRMED_BLOCK_NUMBER {
            let confirmed_height = block.header.height - CONFIRMED_BLOCK_NUMBER;
            match self.chains[chain_num as usize]
                .get_store()
                .get_block_by_height(confirmed_height)
            {
                Ok(Some(confirmed)) => {
                    let map = debts_by_shard(&confirmed.transactions, chain_num);
                    for debt in &map[self.config.shard as usize] {
                        let chain = debt.data.chain_num as usize;
                        debug!("[protocol] confirmed debt for local pool {}", chain);
                        if let Err(err) = self.debt_pools[chain].add(debt.clone()) {
                            debug!("[protocol] debt skipped: {}", err.to_string_full());
                        }
                    }
                    self.propagate_debt_map(&map);
                }
                Ok(None) => warn!(
                    "[protocol] confirmed block at height {} missing",
                    confirmed_height
                ),
                Err(err) => warn!(
                    "[protocol] failed to load confirmed block: {}",
                    err.to_string_full()
                ),
            }
        }

        info!(
            "[protocol] broadcast mined block, chain {}, height {}, hash {}",
            chain_num,
            block.header.height,
            block_hash.to_hex()
        );
        self.broadcast_chain_head(chain_num);
    }

    /// Advertise the head of one chain to every same-shard peer.
    fn broadcast_chain_head(&self, chain_num: u64) {
        let chain = &self.chains[chain_num as usize];
        let (head, td) = match (chain.head_hash(), chain.head_td()) {
            (Ok(head), Ok(td)) => (head, td),
            _ => {
                error!("[protocol] head lookup failed for chain {}", chain_num);
                return;
            }
        };
        let status = ChainHeadStatus {
            chain_num,
            current_block: head,
            td: TotalDifficulty(td),
        };
        for peer in self.peer_set.peers_by_shard(self.config.shard) {
            if let Err(err) = peer.send_head_status(&status) {
                warn!(
                    "[protocol] failed to send chain head to {}: {}",
                    peer.node_id,
                    err.to_string_full()
                );
            }
        }
    }

    /// Forward a transaction that belongs to another shard towards peers of
    /// that shard, or to everyone as a fallback.
    fn send_different_shard_tx(&self, tx: &Transaction, chain_num: u64, shard: u64) {
        let hash = tx.hash();
        let targets = if self.peer_set.peer_count_by_shard(shard) > 0 {
            self.peer_set.peers_by_shard(shard)
        } else {
            self.peer_set.all_peers()
        };
        for peer in targets {
            if peer.knows_tx(&hash) {
                continue;
            }
            peer.mark_tx(hash);
            if let Err(err) = peer.send_transaction(tx.clone(), chain_num) {
                warn!(
                    "[protocol] failed to forward tx to {}: {}",
                    peer.node_id,
                    err.to_string_full()
                );
            }
        }
    }

    fn propagate_debts(&self, debts: &[Debt]) {
        let mut map = vec![Vec::new(); crate::SHARD_COUNT as usize + 1];
        for debt in debts {
            map[debt.data.shard as usize].push(debt.clone());
        }
        self.propagate_debt_map(&map);
    }

    /// Send each debt group to the peers of its destination shard.
    fn propagate_debt_map(&self, map: &[Vec<Debt>]) {
        for peer in self.peer_set.all_peers() {
            let group = &map[peer.shard as usize];
            if group.is_empty() {
                continue;
            }
            let fresh: Vec<Debt> = group
                .iter()
                .filter(|debt| !peer.knows_debt(&debt.hash()))
                .cloned()
                .collect();
            if fresh.is_empty() {
                continue;
            }
            for debt in &fresh {
                peer.mark_debt(debt.hash());
            }
            if let Err(err) = peer.send_debts(&fresh) {
                warn!(
                    "[protocol] failed to send debts to {}: {}",
                    peer.node_id,
                    err.to_string_full()
                );
            }
        }
    }
}
