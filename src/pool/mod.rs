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

//! Per-chain pending transaction pool.
//!
//! A bounded hash-to-transaction mapping with two ordered views: by
//! (sender, nonce) for block inclusion and by arrival for eviction. The pool
//! validates against the committed world state and reconciles itself on
//! every chain head change; admission and reorg handling are serialized by
//! one internal lock.

pub mod debt;

pub use debt::DebtPool;

use crate::{
    base::{queue_set::QueueSet, Mutex, RwLock},
    chain::{fork_blocks, Blockchain},
    crypto::Hash,
    event::{Event, EventBus},
    state::WorldState,
    store::Database,
    Address, Error, ErrorKind, Result, Transaction,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Transaction pool tuning knobs.
#[derive(Debug, Clone)]
pub struct TxPoolConfig {
    /// Max number of pooled transactions per chain.
    pub capacity: usize,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        TxPoolConfig { capacity: 4096 }
    }
}

#[derive(Default)]
struct PoolInner {
    /// Pending transactions payload.
    txs: HashMap<Hash, Transaction>,
    /// Arrival order, for eviction.
    arrival: QueueSet<Hash>,
    /// (sender, nonce) order, for inclusion.
    by_nonce: BTreeMap<(Address, u64), Hash>,
}

impl PoolInner {
    fn insert(&mut self, tx: Transaction) {
        let hash = tx.hash();
        self.by_nonce
            .insert((tx.data.from, tx.data.account_nonce), hash);
        self.arrival.push(hash);
        self.txs.insert(hash, tx);
    }

    fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        let tx = self.txs.remove(hash)?;
        self.arrival.remove(hash);
        self.by_nonce.remove(&(tx.data.from, tx.data.account_nonce));
        Some(tx)
    }
}

/// Pending transactions of one chain.
pub struct TxPool<D: Database> {
    inner: Mutex<PoolInner>,
    chain: Arc<Blockchain<D>>,
    world: Arc<RwLock<WorldState<D>>>,
    bus: Arc<EventBus>,
    chain_num: u64,
    shard: u64,
    capacity: usize,
}

impl<D: Database> TxPool<D> {
    pub fn new(
        config: &TxPoolConfig,
        chain: Arc<Blockchain<D>>,
        world: Arc<RwLock<WorldState<D>>>,
        bus: Arc<EventBus>,
        shard: u64,
    ) -> Self {
        let chain_num = chain.chain_num();
        TxPool {
            inner: Mutex::new(PoolInner::default()),
            chain,
            world,
            bus,
            chain_num,
            shard,
            capacity: config.capacity,
        }
    }

    /// Number of pooled transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().arrival.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a transaction, validating signature, shard, nonce monotonicity
    /// and balance coverage against the committed state. Fires `TxInserted`
    /// on success.
    pub fn add_transaction(&self, tx: Transaction) -> Result<()> {
        self.insert_validated(tx.clone(), true)?;
        self.bus.fire(Event::TxInserted {
            chain_num: self.chain_num,
            tx,
        });
        Ok(())
    }

    fn insert_validated(&self, tx: Transaction, check_capacity: bool) -> Result<()> {
        tx.verify()?;
        if tx.data.from.shard() != self.shard {
            return Err(Error::new_ext(
                ErrorKind::InvalidState,
                "sender not on local shard",
            ));
        }

        let state = self.world.read().current_state()?;
        if tx.data.account_nonce < state.nonce(&tx.data.from) {
            return Err(Error::new_ext(ErrorKind::InvalidState, "stale nonce"));
        }
        if tx.data.amount > state.balance(&tx.data.from) {
            return Err(Error::new_ext(
                ErrorKind::InvalidState,
                "insufficient balance",
            ));
        }

        let mut inner = self.inner.lock();
        let hash = tx.hash();
        if inner.txs.contains_key(&hash) {
            return Err(ErrorKind::DuplicatedTx.into());
        }
        if inner
            .by_nonce
            .contains_key(&(tx.data.from, tx.data.account_nonce))
        {
            return Err(Error::new_ext(
                ErrorKind::DuplicatedTx,
                "nonce already taken by a pooled transaction",
            ));
        }
        if check_capacity && inner.arrival.len() >= self.capacity {
            return Err(ErrorKind::PoolFull.into());
        }
        inner.insert(tx);
        Ok(())
    }

    /// Fetch a pooled transaction by hash.
    pub fn get_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.inner.lock().txs.get(hash).cloned()
    }

    /// Pending transactions in (sender, nonce) order, up to `max`.
    pub fn pending_transactions(&self, max: usize) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .by_nonce
            .values()
            .take(max)
            .filter_map(|hash| inner.txs.get(hash).cloned())
            .collect()
    }

    /// Remove a transaction by hash.
    pub fn remove_transaction(&self, hash: &Hash) {
        self.inner.lock().remove(hash);
    }

    /// Reconcile the pool against a chain head move.
    ///
    /// Transactions included by the adopted branch leave the pool, the
    /// abandoned branch's ones are re-admitted, and every survivor is
    /// re-validated against the new committed state.
    pub fn handle_chain_header_changed(&self, new_head: &Hash, old_head: &Hash) -> Result<()> {
        if new_head == old_head {
            return Ok(());
        }
        let (abandoned, adopted) = fork_blocks(self.chain.get_store(), old_head, new_head)?;

        for block in &adopted {
            let mut inner = self.inner.lock();
            for tx in &block.transactions {
                inner.remove(&tx.hash());
            }
        }

        for block in &abandoned {
            for tx in &block.transactions {
                if let Err(err) = self.insert_validated(tx.clone(), false) {
                    debug!(
                        "[txpool {}] dropped forked tx {}: {}",
                        self.chain_num,
                        tx.hash().to_hex(),
                        err.to_string_full()
                    );
                }
            }
        }

        // Re-validation sweep against the new state.
        let state = self.world.read().current_state()?;
        let mut inner = self.inner.lock();
        let stale: Vec<Hash> = inner
            .txs
            .iter()
            .filter(|(_, tx)| {
                tx.data.account_nonce < state.nonce(&tx.data.from)
                    || tx.data.amount > state.balance(&tx.data.from)
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in stale {
            debug!(
                "[txpool {}] evicted invalidated tx {}",
                self.chain_num,
                hash.to_hex()
            );
            inner.remove(&hash);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::{address_with_shard, keypair_for_shard};
    use crate::chain::tests::{build_child, create_test_chain, Fixture};
    use crate::event::Topic;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn create_pool(fixture: &Fixture) -> TxPool<crate::store::MemoryDatabase> {
        TxPool::new(
            &TxPoolConfig::default(),
            fixture.chain.clone(),
            fixture.world.clone(),
            fixture.bus.clone(),
            1,
        )
    }

    fn transfer(fixture: &Fixture, nonce: u64, amount: u64) -> Transaction {
        Transaction::new_transfer(
            &fixture.keypair,
            address_with_shard(1),
            amount,
            nonce,
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn add_and_order_by_nonce() {
        let fixture = create_test_chain(0);
        let pool = create_pool(&fixture);

        pool.add_transaction(transfer(&fixture, 1, 5)).unwrap();
        pool.add_transaction(transfer(&fixture, 0, 5)).unwrap();

        let pending = pool.pending_transactions(10);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].data.account_nonce, 0);
        assert_eq!(pending[1].data.account_nonce, 1);
    }

    #[test]
    fn add_fires_event() {
        let fixture = create_test_chain(0);
        let pool = create_pool(&fixture);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        fixture.bus.subscribe(Topic::TxInserted, "test", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        pool.add_transaction(transfer(&fixture, 0, 5)).unwrap();

        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) == 1 {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("event not fired");
    }

    #[test]
    fn duplicate_rejected() {
        let fixture = create_test_chain(0);
        let pool = create_pool(&fixture);
        let tx = transfer(&fixture, 0, 5);

        pool.add_transaction(tx.clone()).unwrap();
        let err = pool.add_transaction(tx).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DuplicatedTx);
    }

    #[test]
    fn nonce_collision_rejected() {
        let fixture = create_test_chain(0);
        let pool = create_pool(&fixture);

        pool.add_transaction(transfer(&fixture, 0, 5)).unwrap();
        let err = pool.add_transaction(transfer(&fixture, 0, 7)).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DuplicatedTx);
    }

    #[test]
    fn foreign_shard_sender_rejected() {
        let fixture = create_test_chain(0);
        let pool = create_pool(&fixture);
        let foreign = keypair_for_shard(2);
        let tx =
            Transaction::new_transfer(&foreign, address_with_shard(1), 1, 0, vec![]).unwrap();

        let err = pool.add_transaction(tx).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn stale_nonce_rejected() {
        let fixture = create_test_chain(0);
        // Advance the committed state past nonce 0.
        let genesis_block = fixture.chain.current_block().unwrap();
        let spent = transfer(&fixture, 0, 1);
        let block = build_child(&fixture, &genesis_block, vec![spent], 0);
        fixture.chain.write_block(&block).unwrap();

        let pool = create_pool(&fixture);
        let err = pool.add_transaction(transfer(&fixture, 0, 1)).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn balance_coverage_required() {
        let fixture = create_test_chain(0);
        let pool = create_pool(&fixture);

        let err = pool
            .add_transaction(transfer(&fixture, 0, 2_000_000))
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn capacity_enforced() {
        let fixture = create_test_chain(0);
        let pool = TxPool::new(
            &TxPoolConfig { capacity: 2 },
            fixture.chain.clone(),
            fixture.world.clone(),
            fixture.bus.clone(),
            1,
        );

        pool.add_transaction(transfer(&fixture, 0, 1)).unwrap();
        pool.add_transaction(transfer(&fixture, 1, 1)).unwrap();
        let err = pool.add_transaction(transfer(&fixture, 2, 1)).unwrap_err();

        assert_eq!(err.kind, ErrorKind::PoolFull);
    }

    #[test]
    fn reorg_round_trip() {
        let fixture = create_test_chain(0);
        let pool = create_pool(&fixture);
        let genesis_block = fixture.chain.current_block().unwrap();

        // Branch A carries tx0 and tx1, branch B only tx0.
        let tx0 = transfer(&fixture, 0, 1);
        let tx1 = transfer(&fixture, 1, 1);
        let x1 = build_child(&fixture, &genesis_block, vec![tx0.clone()], 0);
        let x2 = build_child(&fixture, &x1, vec![tx1.clone()], 0);
        let y1 = build_child(&fixture, &genesis_block, vec![tx0.clone()], 3);
        let y2 = build_child(&fixture, &y1, vec![], 0);
        let y3 = build_child(&fixture, &y2, vec![], 0);

        fixture.chain.write_block(&x1).unwrap();
        fixture.chain.write_block(&x2).unwrap();
        pool.handle_chain_header_changed(&x2.header_hash(), &x1.header_hash())
            .unwrap();

        fixture.chain.write_block(&y1).unwrap();
        fixture.chain.write_block(&y2).unwrap();
        fixture.chain.write_block(&y3).unwrap();
        pool.handle_chain_header_changed(&y3.header_hash(), &x2.header_hash())
            .unwrap();

        // tx1 was only confirmed by the abandoned branch, so it is back.
        assert_eq!(pool.len(), 1);
        assert!(pool.get_transaction(&tx1.hash()).is_some());
        assert!(pool.get_transaction(&tx0.hash()).is_none());
    }

    #[test]
    fn adopted_branch_drains_pool() {
        let fixture = create_test_chain(0);
        let pool = create_pool(&fixture);
        let genesis_block = fixture.chain.current_block().unwrap();
        let tx0 = transfer(&fixture, 0, 1);
        pool.add_transaction(tx0.clone()).unwrap();

        let block = build_child(&fixture, &genesis_block, vec![tx0.clone()], 0);
        fixture.chain.write_block(&block).unwrap();
        pool.handle_chain_header_changed(&block.header_hash(), &genesis_block.header_hash())
            .unwrap();

        assert!(pool.is_empty());
    }
}
