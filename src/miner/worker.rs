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

//! Nonce-searching proof-of-work workers.
//!
//! Every seal attempt splits the nonce space into disjoint per-thread
//! ranges. Each worker starts at a random seed inside its range, wraps at
//! the range end and reports an outage after a full cycle, so every worker
//! terminates even without a hit. A shared found-flag plus the miner stop
//! signal cancel the losers.

use crate::{
    base::{schema::BlockHeader, serialize::rmp_serialize, Mutex},
    channel,
    chain::pow,
    crypto::{Hash, Hashable},
    miner::task::Task,
    Block,
};
use num_bigint::BigUint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fixed lenient difficulty of the key-mining stage.
pub const KEY_MINING_DIFFICULTY: u64 = 30_000_000;

/// Inputs of the key-mining stage, drawn from recent history of all chains.
///
/// The winning hash over this packed record becomes the mining key; its
/// predicate is a pure function of (heights, tx_hashes, nonce).
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct MiningDataPack {
    pub heights: Vec<u64>,
    pub tx_hashes: Vec<Hash>,
    pub nonce: u64,
}

impl MiningDataPack {
    /// Hash of the packed record for a candidate nonce.
    pub fn hash_with_nonce(&self, nonce: u64) -> Hash {
        let mut pack = self.clone();
        pack.nonce = nonce;
        // Serialization of the core record cannot fail.
        let buf = rmp_serialize(&pack).unwrap();
        Hash::from_data(crate::crypto::hash::PRIMARY_HASH_ALGORITHM, &buf)
    }
}

/// A sealed block delivered by a winning worker.
#[derive(Clone)]
pub struct SealResult {
    /// Sequence number of the task that produced the block.
    pub task_seq: u64,
    pub block: Block,
}

/// Disjoint (seed, min, max) nonce ranges for `threads` workers.
pub fn nonce_ranges(threads: usize) -> Vec<(u64, u64, u64)> {
    let threads = threads.max(1);
    let step = u64::MAX / threads as u64;
    (0..threads as u64)
        .map(|i| {
            let min = i * step;
            let max = if i == threads as u64 - 1 {
                u64::MAX
            } else {
                min + step - 1
            };
            let seed = min + rand::random::<u64>() % (max - min + 1);
            (seed, min, max)
        })
        .collect()
}

/// Key-mining worker: search the range for a packed-record hash below the
/// given target. The winner stores its hash in `out`.
pub fn mine_key(
    pack: &MiningDataPack,
    target: &BigUint,
    seed: u64,
    min: u64,
    max: u64,
    found: &AtomicBool,
    stop: &AtomicBool,
    out: &Mutex<Option<Hash>>,
) {
    let mut nonce = seed;
    loop {
        if stop.load(Ordering::SeqCst) {
            debug!("[miner] key worker aborted");
            return;
        }
        if found.load(Ordering::SeqCst) {
            debug!("[miner] exit key mining, nonce found by another worker");
            return;
        }

        let hash = pack.hash_with_nonce(nonce);
        if pow::satisfies_target(&hash, target) {
            found.store(true, Ordering::SeqCst);
            *out.lock() = Some(hash);
            info!("[miner] key mining succeeded: {}", hash.to_hex());
            return;
        }

        // Wrap through the range; a full cycle without a hit is an outage.
        nonce = if nonce == max { min } else { nonce + 1 };
        if nonce == seed {
            warn!("[miner] key mining nonce range outage");
            return;
        }
    }
}

/// Block-sealing worker: search the range for a header hash below the
/// difficulty target. The winner delivers the sealed block.
pub fn mine_block(
    task: &Arc<Task>,
    task_seq: u64,
    seed: u64,
    min: u64,
    max: u64,
    found: &AtomicBool,
    stop: &AtomicBool,
    result_tx: &channel::Sender<SealResult>,
) {
    let target = pow::mining_target(&task.header.difficulty);
    let mut header: BlockHeader = task.header.clone();
    let mut nonce = seed;
    loop {
        if stop.load(Ordering::SeqCst) {
            debug!("[miner] seal worker aborted");
            return;
        }
        if found.load(Ordering::SeqCst) {
            return;
        }

        header.nonce = nonce;
        let hash = header.primary_hash();
        if pow::satisfies_target(&hash, &target) {
            found.store(true, Ordering::SeqCst);
            info!(
                "[miner] block sealed, chain {}, height {}, hash {}",
                task.chain_num, header.height, hash.to_hex()
            );
            let result = SealResult {
                task_seq,
                block: task.assemble(nonce),
            };
            if result_tx.try_send(result).is_err() {
                warn!("[miner] result channel rejected sealed block");
            }
            return;
        }

        nonce = if nonce == max { min } else { nonce + 1 };
        if nonce == seed {
            warn!("[miner] seal nonce range outage");
            return;
        }
    }
}
