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

//! Full node service.
//!
//! Owns the `NUM_CHAINS` chains with their databases, the shared account
//! state, the pools, the event bus, the peer protocol and the miner. A
//! per-chain watcher task forwards head changes into the pools in insertion
//! order. Start and stop are idempotent and safe to race.

use crate::{
    base::{Mutex, RwLock},
    chain::{Blockchain, Genesis, GenesisInfo},
    channel,
    crypto::Hash,
    event::{Event, EventBus, Topic},
    miner::{Miner, SeeleBackend},
    pool::{DebtPool, TxPool, TxPoolConfig},
    protocol::{Downloader, Peer, PeerChannel, ProtocolConfig, SeeleProtocol},
    state::{Statedb, WorldState},
    store::Database,
    Address, Error, ErrorKind, Result, NUM_CHAINS,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Bound of the per-chain head-change channels. Overflow drops the oldest
/// entry, only the latest head matters.
const CHAIN_HEADER_CHANGE_BUFF_SIZE: usize = 100;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root of the persistent layout (`chaindata/{i}` and recovery points).
    pub data_dir: PathBuf,
    /// Network identifier checked during handshakes.
    pub network_id: u64,
    /// Identifier advertised to peers.
    pub node_id: String,
    /// Genesis parameters, shared by every chain.
    pub genesis: GenesisInfo,
    /// Address rewarded for mined blocks.
    pub coinbase: Address,
    /// Transaction pool tuning.
    pub tx_conf: TxPoolConfig,
    /// PoW worker threads per seal attempt.
    pub miner_threads: usize,
    /// Enables the chatty per-message traces.
    pub print_explosion_log: bool,
}

/// The multi-chain full node service.
pub struct SeeleService<D: Database> {
    network_id: u64,
    chains: [Arc<Blockchain<D>>; NUM_CHAINS],
    tx_pools: [Arc<TxPool<D>>; NUM_CHAINS],
    debt_pools: [Arc<DebtPool<D>>; NUM_CHAINS],
    world: Arc<RwLock<WorldState<D>>>,
    bus: Arc<EventBus>,
    protocol: Arc<SeeleProtocol<D>>,
    miner: Arc<Miner<D>>,
    head_channels: Vec<(channel::Sender<Hash>, channel::Receiver<Hash>)>,
    watcher_handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<D: Database> SeeleService<D> {
    /// Assemble a node over the given databases: one per chain plus the
    /// account-state one. Genesis is bootstrapped and validated on every
    /// chain; a stored genesis disagreeing with the configuration fails
    /// fatally with `GenesisMismatch`.
    pub fn new(
        config: NodeConfig,
        chain_dbs: [D; NUM_CHAINS],
        state_db: D,
    ) -> Result<Arc<Self>> {
        let genesis = Genesis::new(config.genesis.clone());
        let shard = genesis.info.shard;
        let world = Arc::new(RwLock::new(WorldState::new(state_db)));
        let bus = Arc::new(EventBus::new());

        let mut chains_vec = Vec::with_capacity(NUM_CHAINS);
        for (chain_num, db) in chain_dbs.into_iter().enumerate() {
            let chain_dir = config
                .data_dir
                .join("chaindata")
                .join(chain_num.to_string());
            std::fs::create_dir_all(&chain_dir)
                .map_err(|err| Error::new_ext(ErrorKind::DatabaseFault, err))?;
            info!(
                "[service] chain {} data dir is {}",
                chain_num,
                chain_dir.display()
            );
            chains_vec.push(Arc::new(Blockchain::new(
                db,
                &genesis,
                chain_num as u64,
                world.clone(),
                bus.clone(),
                Some(chain_dir.join("recovery.point")),
            )?));
        }
        let chains: [Arc<Blockchain<D>>; NUM_CHAINS] = chains_vec
            .try_into()
            .map_err(|_| Error::new(ErrorKind::Other))?;

        let tx_pools: [Arc<TxPool<D>>; NUM_CHAINS] = std::array::from_fn(|i| {
            Arc::new(TxPool::new(
                &config.tx_conf,
                chains[i].clone(),
                world.clone(),
                bus.clone(),
                shard,
            ))
        });
        let debt_pools: [Arc<DebtPool<D>>; NUM_CHAINS] =
            std::array::from_fn(|i| Arc::new(DebtPool::new(chains[i].clone(), shard)));

        let protocol = SeeleProtocol::new(
            ProtocolConfig {
                network_id: config.network_id,
                shard,
                node_id: config.node_id.clone(),
                print_explosion_log: config.print_explosion_log,
            },
            &genesis,
            chains.clone(),
            tx_pools.clone(),
            debt_pools.clone(),
            bus.clone(),
        );

        let miner = Miner::new(
            config.coinbase,
            config.miner_threads,
            SeeleBackend {
                chains: chains.clone(),
                tx_pools: tx_pools.clone(),
                debt_pools: debt_pools.clone(),
                world: world.clone(),
                shard,
            },
            bus.clone(),
        );

        let head_channels = (0..NUM_CHAINS)
            .map(|_| channel::bounded_channel(CHAIN_HEADER_CHANGE_BUFF_SIZE))
            .collect();

        Ok(Arc::new(SeeleService {
            network_id: config.network_id,
            chains,
            tx_pools,
            debt_pools,
            world,
            bus,
            protocol,
            miner,
            head_channels,
            watcher_handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Start the watcher tasks and the protocol. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("[service] already started");
            return;
        }
        info!("[service] starting");

        // Fan the head-change events out to the per-chain channels.
        let senders: Vec<(channel::Sender<Hash>, channel::Receiver<Hash>)> =
            self.head_channels.clone();
        self.bus
            .subscribe(Topic::ChainHeaderChanged, "service", move |event| {
                if let Event::ChainHeaderChanged {
                    chain_num,
                    head_hash,
                } = event
                {
                    let (tx, rx) = &senders[*chain_num as usize];
                    loop {
                        match tx.try_send(*head_hash) {
                            Ok(()) => break,
                            Err(channel::ChannelError::SendFull) => {
                                let _ = rx.try_recv();
                            }
                            Err(_) => break,
                        }
                    }
                }
            });

        let mut handles = self.watcher_handles.lock();
        for chain_num in 0..NUM_CHAINS {
            let chain = self.chains[chain_num].clone();
            let tx_pool = self.tx_pools[chain_num].clone();
            let debt_pool = self.debt_pools[chain_num].clone();
            let head_rx = self.head_channels[chain_num].1.clone();
            handles.push(std::thread::spawn(move || {
                monitor_chain_header_change(chain_num, chain, tx_pool, debt_pool, head_rx);
            }));
        }
        drop(handles);

        self.protocol.start();
    }

    /// Stop every subsystem. Idempotent and safe to call while a start is
    /// racing; the databases are released exactly once when the service is
    /// dropped.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("[service] already stopped");
            return;
        }
        info!("[service] stopping");

        self.miner.stop();
        self.protocol.stop();
        self.bus.unsubscribe(Topic::ChainHeaderChanged, "service");
        for (tx, _) in &self.head_channels {
            tx.close();
        }
        let handles = std::mem::take(&mut *self.watcher_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        info!("[service] stopped");
    }

    pub fn net_version(&self) -> u64 {
        self.network_id
    }

    pub fn chain(&self, chain_num: u64) -> Arc<Blockchain<D>> {
        self.chains[chain_num as usize].clone()
    }

    pub fn tx_pool(&self, chain_num: u64) -> Arc<TxPool<D>> {
        self.tx_pools[chain_num as usize].clone()
    }

    pub fn debt_pool(&self, chain_num: u64) -> Arc<DebtPool<D>> {
        self.debt_pools[chain_num as usize].clone()
    }

    pub fn miner(&self) -> Arc<Miner<D>> {
        self.miner.clone()
    }

    pub fn downloader(&self) -> Arc<Downloader<D>> {
        self.protocol.downloader()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Shared handle to the account state, analogous to the chain getters.
    pub fn state_arc(&self) -> Arc<RwLock<WorldState<D>>> {
        self.world.clone()
    }

    /// Snapshot of the account state at the current root.
    pub fn get_current_state(&self) -> Result<Statedb> {
        self.world.read().current_state()
    }

    /// Attach a fresh peer connection; the transport hands over a duplex
    /// framed-message channel.
    pub fn connect_peer(&self, node_id: &str, channel: PeerChannel) -> Result<Arc<Peer>> {
        self.protocol.handle_add_peer(node_id, channel)
    }
}

/// Per-chain head watcher: forwards every head move to the pools, in
/// insertion order. A store fault is retried once, then the watcher dies and
/// the remaining chains keep running.
fn monitor_chain_header_change<D: Database>(
    chain_num: usize,
    chain: Arc<Blockchain<D>>,
    tx_pool: Arc<TxPool<D>>,
    debt_pool: Arc<DebtPool<D>>,
    head_rx: channel::Receiver<Hash>,
) {
    let mut last_header = match chain.head_hash() {
        Ok(hash) => hash,
        Err(err) => {
            error!(
                "[service] watcher {} cannot read its baseline: {}",
                chain_num,
                err.to_string_full()
            );
            return;
        }
    };

    while let Ok(new_header) = head_rx.recv_sync() {
        if new_header == last_header {
            continue;
        }
        let reconcile = || -> Result<()> {
            tx_pool.handle_chain_header_changed(&new_header, &last_header)?;
            debt_pool.handle_chain_header_changed(&new_header, &last_header)
        };
        let mut outcome = reconcile();
        if matches!(&outcome, Err(err) if err.kind == ErrorKind::DatabaseFault) {
            warn!("[service] watcher {} retrying after store fault", chain_num);
            outcome = reconcile();
        }
        match outcome {
            Ok(()) => last_header = new_header,
            Err(err) => {
                error!(
                    "[service] watcher {} terminated: {}",
                    chain_num,
                    err.to_string_full()
                );
                return;
            }
        }
    }
    debug!("[service] watcher {} channel closed", chain_num);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::{address_with_shard, keypair_for_shard};
    use crate::base::schema::{merkle_root_hash, Block, BlockHeader};
    use crate::chain::{pow, MINER_REWARD};
    use crate::crypto::KeyPair;
    use crate::protocol::duplex_pair;
    use crate::store::MemoryDatabase;
    use crate::Transaction;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct TestService {
        service: Arc<SeeleService<MemoryDatabase>>,
        keypair: KeyPair,
        _dir: tempfile::TempDir,
    }

    fn create_test_service(node_id: &str, keypair: KeyPair) -> TestService {
        let coinbase = Address::from_public_key(&keypair.public_key());
        let mut accounts = BTreeMap::new();
        accounts.insert(coinbase, 1_000_000);
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            network_id: 1,
            node_id: node_id.to_owned(),
            genesis: GenesisInfo {
                accounts,
                difficult: 1,
                shard: 1,
            },
            coinbase,
            tx_conf: TxPoolConfig::default(),
            miner_threads: 2,
            print_explosion_log: false,
        };
        let chain_dbs = [
            MemoryDatabase::new(),
            MemoryDatabase::new(),
            MemoryDatabase::new(),
        ];
        let service = SeeleService::new(config, chain_dbs, MemoryDatabase::new()).unwrap();
        TestService {
            service,
            keypair,
            _dir: dir,
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..375 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(40));
        }
        panic!("condition not met in time");
    }

    /// Valid child block built the way the miner would.
    fn build_child(
        node: &TestService,
        chain_num: u64,
        parent: &Block,
        txs: Vec<Transaction>,
        salt: u64,
    ) -> Block {
        let creator = Address::from_public_key(&node.keypair.public_key());
        let timestamp = parent.header.create_timestamp + 1 + salt;
        let difficulty = pow::get_difficult(timestamp, &parent.header);
        let world = node.service.state_arc();

        let mut state = world.read().state_at(&parent.header.state_root).unwrap();
        state.apply_reward(&creator, MINER_REWARD);
        for tx in &txs {
            state.apply_transaction(tx, 1).unwrap();
        }
        world.write().commit(&state).unwrap();

        Block {
            header: BlockHeader {
                previous_block_hash: parent.header_hash(),
                creator,
                state_root: state.root_hash(),
                txs_root: merkle_root_hash(&txs),
                height: parent.header.height + 1,
                create_timestamp: timestamp,
                difficulty,
                nonce: 1,
                extra_data: vec![],
            },
            transactions: txs,
            debts: vec![],
            chain_num,
        }
    }

    #[test]
    fn start_stop_idempotent() {
        let node = create_test_service("node", keypair_for_shard(1));

        node.service.start();
        node.service.start();
        assert_eq!(node.service.net_version(), 1);

        node.service.stop();
        node.service.stop();
    }

    #[test]
    fn genesis_state_is_visible() {
        let node = create_test_service("node", keypair_for_shard(1));
        let coinbase = Address::from_public_key(&node.keypair.public_key());

        let state = node.service.get_current_state().unwrap();

        assert_eq!(state.balance(&coinbase), 1_000_000);
        for chain_num in 0..NUM_CHAINS as u64 {
            assert_eq!(
                node.service
                    .chain(chain_num)
                    .current_block()
                    .unwrap()
                    .header
                    .height,
                0
            );
        }
    }

    #[test]
    fn watcher_regains_txs_after_reorg() {
        let node = create_test_service("node", keypair_for_shard(1));
        node.service.start();
        let chain = node.service.chain(0);
        let genesis_block = chain.current_block().unwrap();

        // Branch A confirms a transaction that branch B does not.
        let tx0 = Transaction::new_transfer(
            &node.keypair,
            address_with_shard(1),
            5,
            0,
            vec![],
        )
        .unwrap();
        let x1 = build_child(&node, 0, &genesis_block, vec![tx0.clone()], 0);
        chain.write_block(&x1).unwrap();

        let y1 = build_child(&node, 0, &genesis_block, vec![], 3);
        let y2 = build_child(&node, 0, &y1, vec![], 0);
        chain.write_block(&y1).unwrap();
        chain.write_block(&y2).unwrap();
        assert_eq!(chain.head_hash().unwrap(), y2.header_hash());

        // The watcher walks the fork and puts tx0 back into the pool.
        wait_for(|| {
            node.service
                .tx_pool(0)
                .get_transaction(&tx0.hash())
                .is_some()
        });

        node.service.stop();
    }

    #[test]
    fn mined_heads_propagate_between_services() {
        let keypair = keypair_for_shard(1);
        let twin = KeyPair::from_bytes(&keypair.to_bytes()).unwrap();
        let a = create_test_service("node-a", keypair);
        let b = create_test_service("node-b", twin);
        a.service.start();
        b.service.start();

        let (end_a, end_b) = duplex_pair();
        let service_a = a.service.clone();
        let handle = std::thread::spawn(move || service_a.connect_peer("node-b", end_a));
        b.service.connect_peer("node-a", end_b).unwrap();
        handle.join().unwrap().unwrap();

        a.service.miner().start().unwrap();

        // Node B follows whatever chain A's lottery lands on.
        wait_for(|| {
            (0..NUM_CHAINS as u64).any(|c| {
                let a_head = a.service.chain(c).current_block().unwrap();
                a_head.header.height >= 1
                    && b.service.chain(c).head_hash().unwrap() == a_head.header_hash()
            })
        });

        a.service.miner().stop();
        a.service.stop();
        b.service.stop();
    }
}
