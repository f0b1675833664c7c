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

//! Chain synchronization engine.
//!
//! One round walks every chain: pick the best same-shard peer by advertised
//! total difficulty, discover the common ancestor, pull verified header
//! ranges and then bodies, and feed the blocks through `write_block`. Only
//! one round runs at a time process-wide; request/response pairs are matched
//! by a per-request magic number so stale responses are dropped.

use crate::{
    base::Mutex,
    chain::{pow, Blockchain},
    channel,
    crypto::Hash,
    event::{Event, EventBus},
    protocol::{message::*, peer::Peer},
    store::Database,
    Error, ErrorKind, Result, NUM_CHAINS,
};
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Max headers per GetBlockHeaders request.
const MAX_HEADER_FETCH: u64 = 256;

/// Max bodies per GetBlocks request.
const MAX_BODY_FETCH: u64 = 128;

/// Upper bound of a serialized block range response.
pub const MAX_MESSAGE_LENGTH: usize = 2 * 1024 * 1024;

/// How far back the ancestor discovery walks before giving up.
const MAX_FORK_ANCESTRY: u64 = 90;

/// Per-request response timeout.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(4);

/// Attempts per request before the round fails.
const REQUEST_ATTEMPTS: usize = 2;

pub struct Downloader<D: Database> {
    chains: [Arc<Blockchain<D>>; NUM_CHAINS],
    bus: Arc<EventBus>,
    /// Global single-round guard.
    syncing: AtomicBool,
    /// In-flight requests keyed by magic number.
    sessions: Mutex<HashMap<u32, channel::Sender<ProtocolMessage>>>,
}

impl<D: Database> Downloader<D> {
    pub fn new(chains: [Arc<Blockchain<D>>; NUM_CHAINS], bus: Arc<EventBus>) -> Self {
        Downloader {
            chains,
            bus,
            syncing: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// True while a synchronization round is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Route a downloader response frame to the in-flight request it answers.
    /// Frames with a stale or unknown magic are dropped.
    pub fn deliver_msg(&self, msg: &ProtocolMessage) {
        let magic = match msg.code {
            BLOCK_HEADERS_MSG_CODE => msg.decode::<BlockHeadersMsg>().map(|m| m.magic),
            BLOCKS_PRE_MSG_CODE => msg.decode::<BlocksPreMsg>().map(|m| m.magic),
            BLOCKS_MSG_CODE => msg.decode::<BlocksMsg>().map(|m| m.magic),
            _ => return,
        };
        let magic = match magic {
            Ok(magic) => magic,
            Err(err) => {
                warn!("[downloader] undecodable response: {}", err.to_string_full());
                return;
            }
        };
        let sessions = self.sessions.lock();
        match sessions.get(&magic) {
            Some(tx) => {
                if tx.try_send(msg.clone()).is_err() {
                    debug!("[downloader] session {} gone", magic);
                }
            }
            None => debug!("[downloader] stale response, magic {}", magic),
        }
    }

    /// Run one synchronization round over the given per-chain best peers.
    ///
    /// Returns `AlreadySynchronizing` when a round is in flight. Emits
    /// `DownloaderStart` first and `DownloaderDone`/`DownloaderFailed` when
    /// the round settles; a failure abandons the remaining chains.
    pub fn synchronise(&self, best: Vec<Option<(Arc<Peer>, BigUint)>>) -> Result<()> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ErrorKind::AlreadySynchronizing.into());
        }
        self.bus.fire(Event::DownloaderStart);

        let mut result = Ok(());
        for (chain_num, entry) in best.into_iter().enumerate().take(NUM_CHAINS) {
            let (peer, peer_td) = match entry {
                Some(entry) => entry,
                None => continue,
            };
            let outcome = self.chains[chain_num]
                .head_td()
                .and_then(|local_td| {
                    if peer_td <= local_td {
                        return Ok(());
                    }
                    debug!(
                        "[downloader] chain {} behind peer {} ({} < {})",
                        chain_num, peer.node_id, local_td, peer_td
                    );
                    self.sync_chain(&peer, chain_num as u64)
                });
            if let Err(err) = outcome {
                error!(
                    "[downloader] chain {} sync from {} failed: {}",
                    chain_num,
                    peer.node_id,
                    err.to_string_full()
                );
                result = Err(err);
                break;
            }
        }

        self.syncing.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => self.bus.fire(Event::DownloaderDone),
            Err(_) => self.bus.fire(Event::DownloaderFailed),
        }
        result
    }

    /// Bring one chain up to the peer's advertised head.
    fn sync_chain(&self, peer: &Arc<Peer>, chain_num: u64) -> Result<()> {
        let chain = &self.chains[chain_num as usize];
        let store = chain.get_store();

        // Ancestor discovery: walk the height index backwards until the
        // remote header at that height matches the local canonical one.
        let local_height = chain.current_block()?.header.height;
        let floor = local_height.saturating_sub(MAX_FORK_ANCESTRY);
        let mut height = local_height;
        let ancestor = loop {
            let remote = self.request_headers(peer, chain_num, height, 1)?;
            let local_hash = store.get_block_hash(height)?.ok_or_else(|| {
                Error::new_ext(ErrorKind::DatabaseFault, "canonical index hole")
            })?;
            if remote.first().map(|h| h.hash()) == Some(local_hash) {
                break height;
            }
            if height == floor {
                return Err(Error::new_ext(
                    ErrorKind::InvalidBlock,
                    "no common ancestor within fork ancestry",
                ));
            }
            height -= 1;
        };

        let mut prev_header = store
            .get_block_header(&store.get_block_hash(ancestor)?.unwrap_or_default())?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "ancestor missing"))?;
        let mut prev_hash = prev_header.hash();
        let mut next = ancestor + 1;

        loop {
            let headers = self.request_headers(peer, chain_num, next, MAX_HEADER_FETCH)?;
            if headers.is_empty() {
                break;
            }
            if headers.len() as u64 > MAX_HEADER_FETCH {
                return Err(Error::new_ext(
                    ErrorKind::InvalidBlock,
                    "oversized header response",
                ));
            }

            for header in &headers {
                if header.previous_block_hash != prev_hash {
                    return Err(Error::new_ext(
                        ErrorKind::InvalidBlock,
                        "non-contiguous header range",
                    ));
                }
                if header.difficulty != pow::get_difficult(header.create_timestamp, &prev_header)
                {
                    return Err(Error::new_ext(
                        ErrorKind::InvalidSeal,
                        "unexpected difficulty in header range",
                    ));
                }
                pow::verify_seal(header)?;
                prev_hash = header.hash();
                prev_header = header.clone();
            }

            // Bodies, bounded by the wire message size on the remote side.
            let mut idx = 0;
            while idx < headers.len() {
                let amount = std::cmp::min(MAX_BODY_FETCH as usize, headers.len() - idx);
                let blocks =
                    self.request_blocks(peer, chain_num, next + idx as u64, amount as u64)?;
                if blocks.is_empty() {
                    return Err(Error::new_ext(
                        ErrorKind::InvalidBlock,
                        "empty block range response",
                    ));
                }
                for (off, block) in blocks.iter().enumerate() {
                    match headers.get(idx + off) {
                        Some(header) if header.hash() == block.header_hash() => {}
                        _ => {
                            return Err(Error::new_ext(
                                ErrorKind::InvalidBlock,
                                "mismatched block range order",
                            ))
                        }
                    }
                    match chain.write_block(block) {
                        Ok(()) => {}
                        Err(err) if err.kind == ErrorKind::DuplicatedBlock => {}
                        Err(err) => return Err(err),
                    }
                }
                idx += blocks.len();
            }

            next += headers.len() as u64;
            if (headers.len() as u64) < MAX_HEADER_FETCH {
                break;
            }
        }
        Ok(())
    }

    /// Open a magic-keyed session and fetch a header range.
    fn request_headers(
        &self,
        peer: &Arc<Peer>,
        chain_num: u64,
        start: u64,
        amount: u64,
    ) -> Result<Vec<crate::BlockHeader>> {
        let mut last_err = Error::new(ErrorKind::Other);
        for _ in 0..REQUEST_ATTEMPTS {
            let query = BlockHeadersQuery {
                magic: rand::random(),
                chain_num,
                hash: Hash::default(),
                number: start,
                amount,
                reverse: false,
            };
            match self.round_trip(peer, GET_BLOCK_HEADERS_MSG_CODE, query.magic, &query) {
                Ok(msg) => return Ok(msg.decode::<BlockHeadersMsg>()?.headers),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Open a magic-keyed session and fetch a block range.
    fn request_blocks(
        &self,
        peer: &Arc<Peer>,
        chain_num: u64,
        start: u64,
        amount: u64,
    ) -> Result<Vec<crate::Block>> {
        let mut last_err = Error::new(ErrorKind::Other);
        for _ in 0..REQUEST_ATTEMPTS {
            let query = BlocksQuery {
                magic: rand::random(),
                chain_num,
                hash: Hash::default(),
                number: start,
                amount,
            };
            match self.round_trip(peer, GET_BLOCKS_MSG_CODE, query.magic, &query) {
                Ok(msg) => return Ok(msg.decode::<BlocksMsg>()?.blocks),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Send one request and wait for the terminal response frame with the
    /// same magic. Advisory frames (BlocksPre) are skipped.
    fn round_trip<T: serde::Serialize>(
        &self,
        peer: &Arc<Peer>,
        code: u16,
        magic: u32,
        query: &T,
    ) -> Result<ProtocolMessage> {
        let (tx, rx) = channel::simple_channel();
        self.sessions.lock().insert(magic, tx);

        let res = (|| {
            peer.send(ProtocolMessage::new(code, query)?)?;
            loop {
                let msg = rx.recv_timeout_sync(DOWNLOAD_TIMEOUT).map_err(|err| {
                    Error::new_ext(ErrorKind::Other, format!("download request: {}", err))
                })?;
                if msg.code != BLOCKS_PRE_MSG_CODE {
                    return Ok(msg);
                }
            }
        })();

        self.sessions.lock().remove(&magic);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::create_test_chain;
    use crate::channel::simple_channel;
    use crate::event::Topic;
    use std::time::Duration;

    fn create_downloader() -> (Downloader<crate::store::MemoryDatabase>, Arc<EventBus>) {
        let f0 = create_test_chain(0);
        let bus = f0.bus.clone();
        let world = f0.world.clone();
        let c1 = Arc::new(
            Blockchain::new(
                crate::store::MemoryDatabase::new(),
                &f0.genesis,
                1,
                world.clone(),
                bus.clone(),
                None,
            )
            .unwrap(),
        );
        let c2 = Arc::new(
            Blockchain::new(
                crate::store::MemoryDatabase::new(),
                &f0.genesis,
                2,
                world,
                bus.clone(),
                None,
            )
            .unwrap(),
        );
        (Downloader::new([f0.chain.clone(), c1, c2], bus.clone()), bus)
    }

    fn collect_downloader_events(bus: &EventBus) -> Arc<Mutex<Vec<&'static str>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(Topic::Downloader, "test", move |event| {
            let name = match event {
                Event::DownloaderStart => "start",
                Event::DownloaderDone => "done",
                Event::DownloaderFailed => "failed",
                _ => "other",
            };
            seen_clone.lock().push(name);
        });
        seen
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not met in time");
    }

    #[test]
    fn empty_round_emits_done() {
        let (downloader, bus) = create_downloader();
        let seen = collect_downloader_events(&bus);

        downloader.synchronise(vec![None, None, None]).unwrap();

        wait_for(|| seen.lock().len() == 2);
        assert_eq!(*seen.lock(), vec!["start", "done"]);
        assert!(!downloader.is_syncing());
    }

    #[test]
    fn peer_not_ahead_is_skipped() {
        let (downloader, _bus) = create_downloader();
        let (tx, _rx) = simple_channel();
        let peer = Arc::new(Peer::new("lazy".to_owned(), 1, tx));
        // Advertised TD equal to the local genesis TD: nothing to do.
        peer.set_head(0, Hash::default(), 1_u32.into());

        downloader
            .synchronise(vec![Some((peer, 1_u32.into())), None, None])
            .unwrap();
    }

    #[test]
    fn broken_transport_fails_the_round() {
        let (downloader, bus) = create_downloader();
        let seen = collect_downloader_events(&bus);
        let (tx, rx) = simple_channel();
        drop(rx);
        let peer = Arc::new(Peer::new("dead".to_owned(), 1, tx));
        peer.set_head(0, Hash::default(), 100_u32.into());

        let err = downloader
            .synchronise(vec![Some((peer, 100_u32.into())), None, None])
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Other);
        wait_for(|| seen.lock().len() == 2);
        assert_eq!(*seen.lock(), vec!["start", "failed"]);
        assert!(!downloader.is_syncing());
    }

    #[test]
    fn concurrent_round_rejected() {
        let (downloader, _bus) = create_downloader();
        let downloader = Arc::new(downloader);
        // A peer that never answers keeps the first round in flight.
        let (tx, _keep_rx) = simple_channel();
        let peer = Arc::new(Peer::new("mute".to_owned(), 1, tx));
        peer.set_head(0, Hash::default(), 100_u32.into());

        let first = downloader.clone();
        let handle = std::thread::spawn(move || {
            first.synchronise(vec![Some((peer, 100_u32.into())), None, None])
        });
        wait_for(|| downloader.is_syncing());

        let err = downloader.synchronise(vec![None, None, None]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadySynchronizing);

        // The mute peer eventually times out and the round fails.
        assert!(handle.join().unwrap().is_err());
        assert!(!downloader.is_syncing());
    }

    #[test]
    fn stale_response_dropped() {
        let (downloader, _bus) = create_downloader();
        let msg = ProtocolMessage::new(
            BLOCK_HEADERS_MSG_CODE,
            &BlockHeadersMsg {
                magic: 12345,
                chain_num: 0,
                headers: vec![],
            },
        )
        .unwrap();

        // No session registered: must be a no-op.
        downloader.deliver_msg(&msg);
    }
}
