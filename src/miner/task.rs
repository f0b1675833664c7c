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

//! One block-sealing attempt: template header, selected body and the state
//! root it commits to.

use crate::{
    base::{
        schema::{merkle_root_hash, Block, BlockHeader},
        RwLock,
    },
    chain::MINER_REWARD,
    pool::{DebtPool, TxPool},
    state::WorldState,
    store::Database,
    Address, Debt, Result, Transaction,
};
use std::sync::Arc;

/// Max transactions selected into one block template.
const BLOCK_TX_LIMIT: usize = 1024;

/// Max debts selected into one block template.
const BLOCK_DEBT_LIMIT: usize = 256;

/// A mining task, alive for a single seal attempt.
pub struct Task {
    /// Header template; the winning worker fills the nonce.
    pub header: BlockHeader,
    /// Chain the block is mined on.
    pub chain_num: u64,
    /// Rewarded address.
    pub coinbase: Address,
    /// Selected pending transactions.
    pub txs: Vec<Transaction>,
    /// Selected pending debts.
    pub debts: Vec<Debt>,
    /// Wall-clock seconds when the task was created.
    pub created_at: u64,
}

impl Task {
    pub fn new(header: BlockHeader, chain_num: u64, coinbase: Address, created_at: u64) -> Self {
        Task {
            header,
            chain_num,
            coinbase,
            txs: vec![],
            debts: vec![],
            created_at,
        }
    }

    /// Select pending transactions and debts, execute them on the parent
    /// post-state and seal body roots into the header template.
    ///
    /// Pending entries that fail execution are skipped; the application
    /// order (reward, transactions, debts) mirrors block validation so the
    /// sealed block re-executes to the same root on every node.
    pub fn apply_transactions_and_debts<D: Database>(
        &mut self,
        tx_pool: &TxPool<D>,
        debt_pool: &DebtPool<D>,
        world: &Arc<RwLock<WorldState<D>>>,
        parent_state_root: &crate::crypto::Hash,
        shard: u64,
    ) -> Result<()> {
        let mut state = world.read().state_at(parent_state_root)?;
        state.apply_reward(&self.coinbase, MINER_REWARD);

        for tx in tx_pool.pending_transactions(BLOCK_TX_LIMIT) {
            if let Err(err) = state.apply_transaction(&tx, shard) {
                debug!(
                    "[miner] skipping pending tx {}: {}",
                    tx.hash().to_hex(),
                    err.to_string_full()
                );
                continue;
            }
            self.txs.push(tx);
        }

        for debt in debt_pool.pending_debts(BLOCK_DEBT_LIMIT) {
            if let Err(err) = state.apply_debt(&debt, shard) {
                debug!(
                    "[miner] skipping pending debt {}: {}",
                    debt.hash().to_hex(),
                    err.to_string_full()
                );
                continue;
            }
            self.debts.push(debt);
        }

        self.header.txs_root = merkle_root_hash(&self.txs);
        self.header.state_root = state.root_hash();
        // Children built before insertion must find the snapshot.
        world.write().commit(&state)?;
        Ok(())
    }

    /// The sealed block for a winning nonce.
    pub fn assemble(&self, nonce: u64) -> Block {
        Block {
            header: self.header.with_nonce(nonce),
            transactions: self.txs.clone(),
            debts: self.debts.clone(),
            chain_num: self.chain_num,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::address_with_shard;
    use crate::chain::tests::create_test_chain;
    use crate::pool::TxPoolConfig;

    #[test]
    fn template_includes_valid_pending_txs() {
        let fixture = create_test_chain(0);
        let pool = TxPool::new(
            &TxPoolConfig::default(),
            fixture.chain.clone(),
            fixture.world.clone(),
            fixture.bus.clone(),
            1,
        );
        let debt_pool = DebtPool::new(fixture.chain.clone(), 1);
        let tx = Transaction::new_transfer(
            &fixture.keypair,
            address_with_shard(1),
            10,
            0,
            vec![],
        )
        .unwrap();
        pool.add_transaction(tx.clone()).unwrap();

        let genesis_block = fixture.chain.current_block().unwrap();
        let coinbase = address_with_shard(1);
        let mut header = genesis_block.header.clone();
        header.previous_block_hash = genesis_block.header_hash();
        header.height = 1;
        header.create_timestamp = 1;
        let mut task = Task::new(header, 0, coinbase, 1);

        task.apply_transactions_and_debts(
            &pool,
            &debt_pool,
            &fixture.world,
            &genesis_block.header.state_root,
            1,
        )
        .unwrap();

        assert_eq!(task.txs, vec![tx.clone()]);
        assert_eq!(task.header.txs_root, merkle_root_hash(&[tx]));
        let block = task.assemble(99);
        assert_eq!(block.header.nonce, 99);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.chain_num, 0);
    }

    #[test]
    fn unexecutable_pending_tx_is_skipped() {
        let fixture = create_test_chain(0);
        let pool = TxPool::new(
            &TxPoolConfig::default(),
            fixture.chain.clone(),
            fixture.world.clone(),
            fixture.bus.clone(),
            1,
        );
        let debt_pool = DebtPool::new(fixture.chain.clone(), 1);
        // Nonce 1 cannot execute while the committed nonce is 0.
        let gap_tx = Transaction::new_transfer(
            &fixture.keypair,
            address_with_shard(1),
            10,
            1,
            vec![],
        )
        .unwrap();
        pool.add_transaction(gap_tx).unwrap();

        let genesis_block = fixture.chain.current_block().unwrap();
        let mut header = genesis_block.header.clone();
        header.previous_block_hash = genesis_block.header_hash();
        header.height = 1;
        let mut task = Task::new(header, 0, address_with_shard(1), 1);

        task.apply_transactions_and_debts(
            &pool,
            &debt_pool,
            &fixture.world,
            &genesis_block.header.state_root,
            1,
        )
        .unwrap();

        assert!(task.txs.is_empty());
        assert!(task.header.txs_root.is_empty());
    }
}
