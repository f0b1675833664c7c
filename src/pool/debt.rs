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

//! Per-chain pool of incoming cross-shard debts waiting for inclusion.

use crate::{
    base::{queue_set::QueueSet, Mutex},
    chain::{fork_blocks, Blockchain},
    crypto::Hash,
    store::Database,
    Debt, Error, ErrorKind, Result,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Max number of pooled debts per chain.
const DEBT_POOL_CAPACITY: usize = 4096;

#[derive(Default)]
struct DebtPoolInner {
    debts: HashMap<Hash, Debt>,
    arrival: QueueSet<Hash>,
}

/// Pending debts of one chain.
///
/// Only debts addressed to the local shard and tagged for this chain are
/// admitted.
pub struct DebtPool<D: Database> {
    inner: Mutex<DebtPoolInner>,
    chain: Arc<Blockchain<D>>,
    chain_num: u64,
    shard: u64,
}

impl<D: Database> DebtPool<D> {
    pub fn new(chain: Arc<Blockchain<D>>, shard: u64) -> Self {
        let chain_num = chain.chain_num();
        DebtPool {
            inner: Mutex::new(DebtPoolInner::default()),
            chain,
            chain_num,
            shard,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().arrival.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a debt.
    pub fn add(&self, debt: Debt) -> Result<()> {
        if debt.data.chain_num != self.chain_num {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "debt tagged for another chain",
            ));
        }
        if debt.data.shard != self.shard {
            return Err(Error::new_ext(
                ErrorKind::InvalidState,
                "debt not addressed to local shard",
            ));
        }
        let mut inner = self.inner.lock();
        let hash = debt.hash();
        if inner.debts.contains_key(&hash) {
            return Err(ErrorKind::DuplicatedTx.into());
        }
        if inner.arrival.len() >= DEBT_POOL_CAPACITY {
            return Err(ErrorKind::PoolFull.into());
        }
        inner.arrival.push(hash);
        inner.debts.insert(hash, debt);
        Ok(())
    }

    /// Fetch a pooled debt by hash.
    pub fn get_debt(&self, hash: &Hash) -> Option<Debt> {
        self.inner.lock().debts.get(hash).cloned()
    }

    /// Pending debts in arrival order, up to `max`.
    pub fn pending_debts(&self, max: usize) -> Vec<Debt> {
        let inner = self.inner.lock();
        inner
            .arrival
            .iter()
            .take(max)
            .filter_map(|hash| inner.debts.get(hash).cloned())
            .collect()
    }

    /// Reconcile the pool against a chain head move: debts applied by the
    /// adopted branch leave the pool, the abandoned branch's ones are
    /// re-admitted since they are still owed.
    pub fn handle_chain_header_changed(&self, new_head: &Hash, old_head: &Hash) -> Result<()> {
        if new_head == old_head {
            return Ok(());
        }
        let (abandoned, adopted) = fork_blocks(self.chain.get_store(), old_head, new_head)?;

        let mut inner = self.inner.lock();
        for block in &adopted {
            for debt in &block.debts {
                let hash = debt.hash();
                inner.debts.remove(&hash);
                inner.arrival.remove(&hash);
            }
        }
        for block in &abandoned {
            for debt in &block.debts {
                let hash = debt.hash();
                if inner.debts.contains_key(&hash) {
                    continue;
                }
                inner.arrival.push(hash);
                inner.debts.insert(hash, debt.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::DebtData;
    use crate::chain::tests::create_test_chain;

    fn create_debt(shard: u64, chain_num: u64, salt: u64) -> Debt {
        Debt {
            data: DebtData {
                tx_hash: crate::crypto::Hashable::primary_hash(&salt),
                account: crate::base::schema::tests::address_with_shard(shard),
                amount: 9,
                from_shard: shard % crate::SHARD_COUNT + 1,
                shard,
                chain_num,
            },
        }
    }

    #[test]
    fn add_and_fetch() {
        let fixture = create_test_chain(0);
        let pool = DebtPool::new(fixture.chain.clone(), 1);
        let debt = create_debt(1, 0, 1);

        pool.add(debt.clone()).unwrap();

        assert_eq!(pool.get_debt(&debt.hash()).unwrap(), debt);
        assert_eq!(pool.pending_debts(10).len(), 1);
    }

    #[test]
    fn foreign_shard_rejected() {
        let fixture = create_test_chain(0);
        let pool = DebtPool::new(fixture.chain.clone(), 1);

        let err = pool.add(create_debt(2, 0, 1)).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn foreign_chain_rejected() {
        let fixture = create_test_chain(0);
        let pool = DebtPool::new(fixture.chain.clone(), 1);

        let err = pool.add(create_debt(1, 2, 1)).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn duplicate_rejected() {
        let fixture = create_test_chain(0);
        let pool = DebtPool::new(fixture.chain.clone(), 1);
        let debt = create_debt(1, 0, 1);

        pool.add(debt.clone()).unwrap();
        let err = pool.add(debt).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DuplicatedTx);
    }
}
