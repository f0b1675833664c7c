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

//! Registry of connected peers, indexed by node id and filterable by shard.

use crate::{base::RwLock, protocol::peer::Peer, NUM_CHAINS};
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::Arc;

/// Concurrent peer registry. Reads dominate writes.
#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        PeerSet::default()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a peer. Returns false when the node id is already connected.
    pub fn add(&self, peer: Arc<Peer>) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(&peer.node_id) {
            return false;
        }
        peers.insert(peer.node_id.clone(), peer);
        true
    }

    pub fn remove(&self, node_id: &str) -> Option<Arc<Peer>> {
        self.peers.write().remove(node_id)
    }

    pub fn find(&self, node_id: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(node_id).cloned()
    }

    /// Snapshot of the peers living on the given shard.
    pub fn peers_by_shard(&self, shard: u64) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.shard == shard)
            .cloned()
            .collect()
    }

    /// Snapshot of every connected peer.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_count_by_shard(&self, shard: u64) -> usize {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.shard == shard)
            .count()
    }

    /// Per chain, the same-shard peer advertising the highest total
    /// difficulty. Entries are `None` when no such peer exists.
    pub fn best_peers(&self, shard: u64) -> Vec<Option<(Arc<Peer>, BigUint)>> {
        let peers = self.peers_by_shard(shard);
        let mut best: Vec<Option<(Arc<Peer>, BigUint)>> = vec![None; NUM_CHAINS];
        for chain_num in 0..NUM_CHAINS {
            for peer in &peers {
                let (_, td) = peer.head_by_chain(chain_num as u64);
                let better = match &best[chain_num] {
                    None => true,
                    Some((_, best_td)) => td > *best_td,
                };
                if better {
                    best[chain_num] = Some((peer.clone(), td));
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::simple_channel;
    use crate::crypto::Hashable;

    fn create_peer(id: &str, shard: u64) -> Arc<Peer> {
        let (tx, rx) = simple_channel();
        // Keep the transport open for the lifetime of the test peer.
        std::mem::forget(rx);
        Arc::new(Peer::new(id.to_owned(), shard, tx))
    }

    #[test]
    fn add_find_remove() {
        let set = PeerSet::new();
        let peer = create_peer("a", 1);

        assert!(set.add(peer.clone()));
        assert!(!set.add(peer));
        assert!(set.find("a").is_some());

        set.remove("a");
        assert!(set.find("a").is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn shard_filtering() {
        let set = PeerSet::new();
        set.add(create_peer("a", 1));
        set.add(create_peer("b", 1));
        set.add(create_peer("c", 2));

        assert_eq!(set.peers_by_shard(1).len(), 2);
        assert_eq!(set.peer_count_by_shard(2), 1);
        assert_eq!(set.all_peers().len(), 3);
    }

    #[test]
    fn best_peer_per_chain_by_td() {
        let set = PeerSet::new();
        let low = create_peer("low", 1);
        let high = create_peer("high", 1);
        let foreign = create_peer("foreign", 2);
        low.set_head(0, "l".primary_hash(), 10_u32.into());
        high.set_head(0, "h".primary_hash(), 20_u32.into());
        foreign.set_head(0, "f".primary_hash(), 99_u32.into());
        high.set_head(2, "h2".primary_hash(), 5_u32.into());
        set.add(low);
        set.add(high);
        set.add(foreign);

        let best = set.best_peers(1);

        let (peer, td) = best[0].as_ref().unwrap();
        assert_eq!(peer.node_id, "high");
        assert_eq!(*td, BigUint::from(20_u32));
        let (peer2, _) = best[2].as_ref().unwrap();
        assert_eq!(peer2.node_id, "high");
    }
}
