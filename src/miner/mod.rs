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

//! Two-stage proof-of-work miner.
//!
//! The outer loop first mines a *key*: a lenient PoW over a record sampled
//! from the recent history of all chains. The key selects the chain to mine
//! on (`key mod NUM_CHAINS`), binding the lottery to on-chain data any peer
//! can re-check. The second stage builds a block template from the selected
//! chain's pools and searches the header nonce against the real difficulty.
//!
//! Control flags (`mining`, `can_start`, `stopped`) are atomics driven by
//! compare-and-swap so that exactly one mining loop is active; downloader
//! lifecycle events pause and resume the whole machine.

pub mod task;
pub mod worker;

pub use self::worker::{MiningDataPack, KEY_MINING_DIFFICULTY};

use crate::{
    base::{schema::BlockHeader, Mutex, RwLock},
    chain::{pow, Blockchain},
    channel,
    crypto::Hash,
    event::{Event, EventBus, Topic},
    pool::{DebtPool, TxPool},
    state::WorldState,
    store::Database,
    Address, Error, ErrorKind, Result, NUM_CHAINS,
};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use self::task::Task;
use self::worker::SealResult;

/// Chains shorter than this feed no key-mining entropy; the miner degrades
/// to a purely random key until every chain passes the threshold.
pub const START_HEIGHT_OF_MINING_KEY: u64 = 4;

/// Upper bound of the key sampling window, in blocks below the head.
const LONG_DIST: u64 = 3;

/// Lower bound of the key sampling window, in blocks below the head.
const SHORT_DIST: u64 = 1;

/// Poll period of the sealed-block receiver.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Chain selected by a mining key: the key taken as an integer, modulo the
/// chain count.
pub fn chain_num_by_mining_key(key: &Hash) -> u64 {
    let key_int = BigUint::from_bytes_be(key.hash_value());
    (key_int % BigUint::from(NUM_CHAINS as u64))
        .to_u64()
        .unwrap_or(0)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Handles the miner borrows from the owning service.
pub struct SeeleBackend<D: Database> {
    pub chains: [Arc<Blockchain<D>>; NUM_CHAINS],
    pub tx_pools: [Arc<TxPool<D>>; NUM_CHAINS],
    pub debt_pools: [Arc<DebtPool<D>>; NUM_CHAINS],
    pub world: Arc<RwLock<WorldState<D>>>,
    pub shard: u64,
}

pub struct Miner<D: Database> {
    coinbase: Address,
    threads: usize,
    backend: SeeleBackend<D>,
    bus: Arc<EventBus>,

    mining: AtomicBool,
    can_start: AtomicBool,
    stopped: AtomicBool,
    /// Broadcast cancellation signal of the active run.
    stop_signal: Mutex<Arc<AtomicBool>>,
    /// Worker and waiter threads of the active run.
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Sequence number of the task being sealed; stale results are dropped.
    task_seq: AtomicU64,
    result_tx: channel::Sender<SealResult>,
    result_rx: channel::Receiver<SealResult>,
    /// Winning hash of the last key-mining stage.
    mining_key_hash: Mutex<Option<Hash>>,
    weak_self: Mutex<Weak<Miner<D>>>,
}

impl<D: Database> Miner<D> {
    pub fn new(
        coinbase: Address,
        threads: usize,
        backend: SeeleBackend<D>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (result_tx, result_rx) = channel::simple_channel();
        let miner = Arc::new(Miner {
            coinbase,
            threads: threads.max(1),
            backend,
            bus: bus.clone(),
            mining: AtomicBool::new(false),
            can_start: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            stop_signal: Mutex::new(Arc::new(AtomicBool::new(false))),
            workers: Mutex::new(Vec::new()),
            task_seq: AtomicU64::new(0),
            result_tx,
            result_rx,
            mining_key_hash: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *miner.weak_self.lock() = Arc::downgrade(&miner);

        let weak = Arc::downgrade(&miner);
        bus.subscribe(Topic::Downloader, "miner", move |event| {
            if let Some(miner) = weak.upgrade() {
                miner.downloader_event_callback(event);
            }
        });
        let weak = Arc::downgrade(&miner);
        bus.subscribe(Topic::TxInserted, "miner", move |event| {
            if let (Some(miner), Event::TxInserted { .. }) = (weak.upgrade(), event) {
                if !miner.is_mining()
                    && miner.can_start.load(Ordering::SeqCst)
                    && !miner.stopped.load(Ordering::SeqCst)
                {
                    // Restart off the dispatcher: key mining may take a while.
                    std::thread::spawn(move || miner.try_restart());
                }
            }
        });

        miner
    }

    pub fn coinbase(&self) -> Address {
        self.coinbase
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn can_start(&self) -> bool {
        self.can_start.load(Ordering::SeqCst)
    }

    /// Winning hash of the last key-mining stage, if any.
    pub fn mining_key_hash(&self) -> Option<Hash> {
        *self.mining_key_hash.lock()
    }

    /// Start the mining loop.
    ///
    /// Fails with `MinerIsRunning` when already active and `NodeIsSyncing`
    /// while the downloader holds the machine. A lost start race returns
    /// `Ok` without a second loop.
    pub fn start(&self) -> Result<()> {
        if self.mining.load(Ordering::SeqCst) {
            info!("[miner] miner is running");
            return Err(ErrorKind::MinerIsRunning.into());
        }
        if !self.can_start.load(Ordering::SeqCst) {
            info!("[miner] can not start miner when syncing");
            return Err(ErrorKind::NodeIsSyncing.into());
        }
        if self
            .mining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("[miner] another start already claimed the mining loop");
            return Ok(());
        }

        self.stopped.store(false, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        *self.stop_signal.lock() = stop.clone();

        if let Err(err) = self.new_mining_loop(&stop) {
            warn!("[miner] start failed: {}", err.to_string_full());
            self.mining.store(false, Ordering::SeqCst);
            return Err(err);
        }
        self.spawn_wait_block(stop);
        info!("[miner] started with {} threads", self.threads);
        Ok(())
    }

    /// Administratively stop the miner. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_mining();
    }

    fn stop_mining(&self) {
        if self
            .mining
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.stop_signal.lock().store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
        info!("[miner] stopped");
    }

    fn downloader_event_callback(&self, event: &Event) {
        match event {
            Event::DownloaderStart => {
                info!("[miner] got downloader start event, stop miner");
                self.can_start.store(false, Ordering::SeqCst);
                if self.is_mining() {
                    self.stop_mining();
                }
            }
            Event::DownloaderDone | Event::DownloaderFailed => {
                self.can_start.store(true, Ordering::SeqCst);
                if !self.stopped.load(Ordering::SeqCst) {
                    info!("[miner] got downloader end event, start miner");
                    if let Err(err) = self.start() {
                        debug!("[miner] restart skipped: {}", err);
                    }
                }
            }
            _ => {}
        }
    }

    /// Claim the mining flag and run one loop iteration if the machine is
    /// free. Shared by the sealed-block rearm and the new-transaction kick.
    fn try_restart(&self) {
        if self.stopped.load(Ordering::SeqCst) || !self.can_start.load(Ordering::SeqCst) {
            return;
        }
        if self
            .mining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // Re-check after claiming the flag: a racing stop may have run
        // between the first check and the swap.
        if self.stopped.load(Ordering::SeqCst) || !self.can_start.load(Ordering::SeqCst) {
            self.mining.store(false, Ordering::SeqCst);
            return;
        }
        let stop = self.stop_signal.lock().clone();
        if stop.load(Ordering::SeqCst) {
            self.mining.store(false, Ordering::SeqCst);
            return;
        }
        if let Err(err) = self.new_mining_loop(&stop) {
            warn!("[miner] loop rearm failed: {}", err.to_string_full());
            self.mining.store(false, Ordering::SeqCst);
        }
    }

    /// One outer loop iteration: mine the key, select the chain, build and
    /// commit the seal task.
    fn new_mining_loop(&self, stop: &Arc<AtomicBool>) -> Result<()> {
        let key = self.fetch_mining_key(stop)?;
        *self.mining_key_hash.lock() = Some(key);
        let chain_num = chain_num_by_mining_key(&key);

        let height = self.backend.chains[chain_num as usize]
            .current_block()?
            .header
            .height;
        info!(
            "[miner] got mining key {}, chain {}, height {}",
            key.to_hex(),
            chain_num,
            height
        );

        self.prepare_new_block(chain_num, stop)
    }

    /// Key-mining stage.
    ///
    /// Samples one historical (height, transaction) pair per chain and
    /// searches a nonce bringing the packed record below the fixed lenient
    /// target. When any chain is shorter than the sampling threshold this
    /// degrades to a purely random key: a bootstrap-only mode that peers
    /// cannot verify.
    fn fetch_mining_key(&self, stop: &Arc<AtomicBool>) -> Result<Hash> {
        let mut rng = rand::thread_rng();
        let mut heights = Vec::with_capacity(NUM_CHAINS);
        let mut tx_hashes = Vec::with_capacity(NUM_CHAINS);

        for chain in &self.backend.chains {
            let current = chain.current_block()?;
            let height = current.header.height;
            if height <= START_HEIGHT_OF_MINING_KEY {
                let noise: [u8; 4] = rng.gen();
                return Ok(Hash::from_data(
                    crate::crypto::hash::PRIMARY_HASH_ALGORITHM,
                    &noise,
                ));
            }

            let pick = height - LONG_DIST + rng.gen_range(0, LONG_DIST - SHORT_DIST);
            let block = chain
                .get_store()
                .get_block_by_height(pick)?
                .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "sampled block missing"))?;
            let tx_hash = if block.transactions.is_empty() {
                // No body entropy in an empty block: bind to the header.
                block.header_hash()
            } else {
                let index = rng.gen_range(0, block.transactions.len());
                block.transactions[index].hash()
            };
            heights.push(pick);
            tx_hashes.push(tx_hash);
        }

        let pack = MiningDataPack {
            heights,
            tx_hashes,
            nonce: 0,
        };
        let target = Arc::new(pow::mining_target(&BigUint::from(KEY_MINING_DIFFICULTY)));
        let found = Arc::new(AtomicBool::new(false));
        let out = Arc::new(Mutex::new(None));

        let mut handles = Vec::with_capacity(self.threads);
        for (seed, min, max) in worker::nonce_ranges(self.threads) {
            let pack = pack.clone();
            let target = target.clone();
            let found = found.clone();
            let stop = stop.clone();
            let out = out.clone();
            handles.push(std::thread::spawn(move || {
                worker::mine_key(&pack, &target, seed, min, max, &found, &stop, &out);
            }));
        }
        for handle in handles {
            let _ = handle.join();
        }

        let result = out
            .lock()
            .take()
            .ok_or_else(|| Error::new_ext(ErrorKind::Other, "key mining aborted"));
        result
    }

    /// Build the block template on the selected chain and hand it to the
    /// seal workers.
    fn prepare_new_block(&self, chain_num: u64, stop: &Arc<AtomicBool>) -> Result<()> {
        debug!("[miner] starting mining the new block");
        let chain = &self.backend.chains[chain_num as usize];
        let parent = chain.current_block()?;

        let mut timestamp = now_secs();
        if parent.header.create_timestamp >= timestamp {
            timestamp = parent.header.create_timestamp + 1;
        }
        // Do not run off into the future; sleep the surplus away.
        let now = now_secs();
        if timestamp > now + 1 {
            let wait = Duration::from_secs(timestamp - now);
            info!("[miner] mining too far in the future, waiting {:?}", wait);
            std::thread::sleep(wait);
        }

        let difficulty = pow::get_difficult(timestamp, &parent.header);
        let header = BlockHeader {
            previous_block_hash: parent.header_hash(),
            creator: self.coinbase,
            state_root: Hash::default(),
            txs_root: Hash::default(),
            height: parent.header.height + 1,
            create_timestamp: timestamp,
            difficulty,
            nonce: 0,
            extra_data: vec![],
        };

        let mut task = Task::new(header, chain_num, self.coinbase, timestamp);
        task.apply_transactions_and_debts(
            &self.backend.tx_pools[chain_num as usize],
            &self.backend.debt_pools[chain_num as usize],
            &self.backend.world,
            &parent.header.state_root,
            self.backend.shard,
        )?;

        info!(
            "[miner] committing new task, chain {}, height {}, difficulty {}",
            chain_num, task.header.height, task.header.difficulty
        );
        let seq = self.task_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.commit_task(Arc::new(task), seq, stop);
        Ok(())
    }

    /// Split the nonce space across the seal workers.
    fn commit_task(&self, task: Arc<Task>, task_seq: u64, stop: &Arc<AtomicBool>) {
        if !self.mining.load(Ordering::SeqCst) {
            return;
        }
        let found = Arc::new(AtomicBool::new(false));
        let mut workers = self.workers.lock();
        for (seed, min, max) in worker::nonce_ranges(self.threads) {
            let task = task.clone();
            let found = found.clone();
            let stop = stop.clone();
            let result_tx = self.result_tx.clone();
            workers.push(std::thread::spawn(move || {
                worker::mine_block(&task, task_seq, seed, min, max, &found, &stop, &result_tx);
            }));
        }
    }

    /// Waiter thread: persist sealed blocks, notify the bus and rearm the
    /// outer loop.
    fn spawn_wait_block(&self, stop: Arc<AtomicBool>) {
        let weak = self.weak_self.lock().clone();
        let result_rx = self.result_rx.clone();
        let handle = std::thread::spawn(move || loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let result = match result_rx.recv_timeout_sync(RESULT_POLL_INTERVAL) {
                Ok(result) => result,
                Err(channel::ChannelError::RecvTimeout) => continue,
                Err(_) => break,
            };
            let miner = match weak.upgrade() {
                Some(miner) => miner,
                None => break,
            };
            if result.task_seq != miner.task_seq.load(Ordering::SeqCst) {
                debug!("[miner] dropping stale seal result");
                continue;
            }

            let chain_num = result.block.chain_num;
            info!(
                "[miner] found a new mined block, chain {}, height {}, hash {}",
                chain_num,
                result.block.header.height,
                result.block.header_hash().to_hex()
            );
            match miner.backend.chains[chain_num as usize].write_block(&result.block) {
                Ok(()) => {
                    miner.bus.fire(Event::BlockMined {
                        chain_num,
                        block: result.block,
                    });
                }
                Err(err) => {
                    error!(
                        "[miner] failed to save the mined block: {}",
                        err.to_string_full()
                    );
                }
            }

            miner.mining.store(false, Ordering::SeqCst);
            // Loop mining after this attempt settled.
            miner.try_restart();
        });
        self.workers.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::keypair_for_shard;
    use crate::base::schema::Address;
    use crate::chain::{Genesis, GenesisInfo};
    use crate::pool::TxPoolConfig;
    use crate::store::MemoryDatabase;
    use std::collections::BTreeMap;

    fn create_test_miner() -> (Arc<Miner<MemoryDatabase>>, Arc<EventBus>) {
        let keypair = keypair_for_shard(1);
        let coinbase = Address::from_public_key(&keypair.public_key());
        let mut accounts = BTreeMap::new();
        accounts.insert(coinbase, 1_000_000);
        let genesis = Genesis::new(GenesisInfo {
            accounts,
            difficult: 1,
            shard: 1,
        });
        let world = Arc::new(RwLock::new(WorldState::new(MemoryDatabase::new())));
        let bus = Arc::new(EventBus::new());
        let chains = [0_u64, 1, 2].map(|i| {
            Arc::new(
                Blockchain::new(
                    MemoryDatabase::new(),
                    &genesis,
                    i,
                    world.clone(),
                    bus.clone(),
                    None,
                )
                .unwrap(),
            )
        });
        let tx_pools = [0_usize, 1, 2].map(|i| {
            Arc::new(TxPool::new(
                &TxPoolConfig::default(),
                chains[i].clone(),
                world.clone(),
                bus.clone(),
                1,
            ))
        });
        let debt_pools = [0_usize, 1, 2].map(|i| Arc::new(DebtPool::new(chains[i].clone(), 1)));
        let backend = SeeleBackend {
            chains,
            tx_pools,
            debt_pools,
            world,
            shard: 1,
        };
        (Miner::new(coinbase, 2, backend, bus.clone()), bus)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(40));
        }
        panic!("condition not met in time");
    }

    #[test]
    fn chain_selection_is_roughly_uniform() {
        let mut counts = [0_usize; NUM_CHAINS];
        let samples = 30_000;
        for i in 0..samples {
            let key = crate::crypto::Hashable::primary_hash(&(i as u64));
            counts[chain_num_by_mining_key(&key) as usize] += 1;
        }

        let expected = samples / NUM_CHAINS;
        for count in counts {
            let deviation = count.abs_diff(expected) as f64 / expected as f64;
            assert!(deviation < 0.05, "counts skewed: {:?}", counts);
        }
    }

    #[test]
    fn mines_blocks_until_stopped() {
        let (miner, _bus) = create_test_miner();

        miner.start().unwrap();
        assert!(miner.is_mining());
        let err = miner.start().unwrap_err();
        assert_eq!(err.kind, ErrorKind::MinerIsRunning);

        // Bootstrap key mode (all chains below the threshold) still seals
        // blocks; at least one chain must grow.
        wait_for(|| {
            miner
                .backend
                .chains
                .iter()
                .any(|chain| chain.current_block().unwrap().header.height >= 1)
        });

        miner.stop();
        assert!(!miner.is_mining());
        assert!(miner.is_stopped());
        assert!(miner.mining_key_hash().is_some());
    }

    #[test]
    fn syncing_blocks_start_and_resumes_after() {
        let (miner, bus) = create_test_miner();

        bus.fire(Event::DownloaderStart);
        wait_for(|| !miner.can_start());

        let err = miner.start().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeIsSyncing);

        // Downloader completion auto-restarts a miner that was not
        // administratively stopped.
        bus.fire(Event::DownloaderDone);
        wait_for(|| miner.can_start());
        wait_for(|| miner.is_mining());

        miner.stop();
    }

    #[test]
    fn stopped_miner_does_not_resume_after_sync() {
        let (miner, bus) = create_test_miner();
        miner.start().unwrap();
        miner.stop();

        bus.fire(Event::DownloaderStart);
        bus.fire(Event::DownloaderDone);
        std::thread::sleep(Duration::from_millis(400));

        assert!(!miner.is_mining());
        assert!(miner.is_stopped());
    }
}
