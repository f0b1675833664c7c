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

//! Account world state.
//!
//! The state is a plain address to (nonce, balance) mapping snapshotted in the
//! account database under its own root hash; block headers reference these
//! roots. The merkle trie backing a production deployment is an external
//! collaborator, the snapshot granularity here is the whole mapping.
//!
//! [`WorldState`] owns the account database plus the current root and is
//! shared process-wide behind a single-writer lock: block execution (miner or
//! sync) commits under the exclusive lock, read APIs load a snapshot under
//! the shared one.

use crate::{
    base::serialize::{rmp_deserialize, rmp_serialize},
    crypto::{Hash, Hashable},
    store::Database,
    Address, Debt, Error, ErrorKind, Result, Transaction,
};
use std::collections::BTreeMap;

/// State snapshot key prefix.
const KEY_PREFIX_STATE: u8 = b'S';

/// Per-account state record.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct AccountInfo {
    /// Next expected transaction nonce.
    pub nonce: u64,
    /// Spendable balance.
    pub amount: u64,
}

/// A state snapshot rooted at a hash.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct Statedb {
    accounts: BTreeMap<Address, AccountInfo>,
}

impl Statedb {
    pub fn new() -> Self {
        Statedb::default()
    }

    /// Root hash of this snapshot content.
    pub fn root_hash(&self) -> Hash {
        self.accounts.primary_hash()
    }

    pub fn balance(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).copied().unwrap_or_default().amount
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).copied().unwrap_or_default().nonce
    }

    /// Create or overwrite an account balance. Used by genesis bootstrap.
    pub fn set_balance(&mut self, addr: Address, amount: u64) {
        self.accounts.entry(addr).or_default().amount = amount;
    }

    /// Credit the block creator.
    pub fn apply_reward(&mut self, creator: &Address, amount: u64) {
        self.accounts.entry(*creator).or_default().amount += amount;
    }

    /// Execute one transaction.
    ///
    /// The sender must live on the local shard, spend its exact next nonce
    /// and cover the amount. The recipient is credited only when it lives on
    /// the local shard; cross-shard recipients are paid through a debt on
    /// their own shard.
    pub fn apply_transaction(&mut self, tx: &Transaction, local_shard: u64) -> Result<()> {
        let from = &tx.data.from;
        if from.shard() != local_shard {
            return Err(Error::new_ext(
                ErrorKind::InvalidState,
                "sender not on local shard",
            ));
        }
        let sender = self.accounts.entry(*from).or_default();
        if tx.data.account_nonce != sender.nonce {
            return Err(Error::new_ext(ErrorKind::InvalidState, "nonce out of order"));
        }
        if sender.amount < tx.data.amount {
            return Err(Error::new_ext(
                ErrorKind::InvalidState,
                "insufficient balance",
            ));
        }
        sender.nonce += 1;
        sender.amount -= tx.data.amount;
        if tx.data.to.shard() == local_shard {
            self.accounts.entry(tx.data.to).or_default().amount += tx.data.amount;
        }
        Ok(())
    }

    /// Credit a confirmed cross-shard debt.
    pub fn apply_debt(&mut self, debt: &Debt, local_shard: u64) -> Result<()> {
        if debt.data.shard != local_shard {
            return Err(Error::new_ext(
                ErrorKind::InvalidState,
                "debt not addressed to local shard",
            ));
        }
        self.accounts.entry(debt.data.account).or_default().amount += debt.data.amount;
        Ok(())
    }
}

/// Process-wide account state: database plus current root.
pub struct WorldState<D: Database> {
    db: D,
    root: Hash,
}

impl<D: Database> WorldState<D> {
    /// Wrap an account database with an empty current state.
    pub fn new(db: D) -> Self {
        WorldState {
            db,
            root: Hash::default(),
        }
    }

    /// Current state root.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Load the snapshot stored under the given root.
    pub fn state_at(&self, root: &Hash) -> Result<Statedb> {
        if root.is_empty() {
            return Ok(Statedb::new());
        }
        let mut key = vec![KEY_PREFIX_STATE];
        key.extend_from_slice(root.as_bytes());
        match self.db.get(&key)? {
            Some(buf) => rmp_deserialize(&buf),
            None => Err(Error::new_ext(
                ErrorKind::ResourceNotFound,
                format!("state snapshot {}", root.to_hex()),
            )),
        }
    }

    /// Load the snapshot at the current root.
    pub fn current_state(&self) -> Result<Statedb> {
        self.state_at(&self.root)
    }

    /// Persist a snapshot under its root hash without moving the current
    /// root. Returns the snapshot root.
    pub fn commit(&mut self, state: &Statedb) -> Result<Hash> {
        let root = state.root_hash();
        let mut key = vec![KEY_PREFIX_STATE];
        key.extend_from_slice(root.as_bytes());
        self.db.put(&key, rmp_serialize(state)?)?;
        Ok(root)
    }

    /// Persist a snapshot and make it the current one.
    pub fn commit_and_update(&mut self, state: &Statedb) -> Result<Hash> {
        let root = self.commit(state)?;
        self.root = root;
        Ok(root)
    }

    /// Move the current root to an already committed snapshot.
    pub fn set_root(&mut self, root: Hash) {
        self.root = root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::{address_with_shard, keypair_for_shard};
    use crate::base::schema::DebtData;
    use crate::store::MemoryDatabase;
    use crate::Transaction;

    fn funded_state(keypair: &crate::crypto::KeyPair, amount: u64) -> Statedb {
        let mut state = Statedb::new();
        let addr = Address::from_public_key(&keypair.public_key());
        state.set_balance(addr, amount);
        state
    }

    #[test]
    fn transfer_same_shard() {
        let keypair = keypair_for_shard(1);
        let mut state = funded_state(&keypair, 100);
        let to = address_with_shard(1);
        let tx = Transaction::new_transfer(&keypair, to, 30, 0, vec![]).unwrap();

        state.apply_transaction(&tx, 1).unwrap();

        assert_eq!(state.balance(&tx.data.from), 70);
        assert_eq!(state.balance(&to), 30);
        assert_eq!(state.nonce(&tx.data.from), 1);
    }

    #[test]
    fn transfer_cross_shard_keeps_amount_pending() {
        let keypair = keypair_for_shard(1);
        let mut state = funded_state(&keypair, 100);
        let to = address_with_shard(2);
        let tx = Transaction::new_transfer(&keypair, to, 30, 0, vec![]).unwrap();

        state.apply_transaction(&tx, 1).unwrap();

        assert_eq!(state.balance(&tx.data.from), 70);
        // Recipient is credited on its own shard via a debt.
        assert_eq!(state.balance(&to), 0);
    }

    #[test]
    fn nonce_must_match() {
        let keypair = keypair_for_shard(1);
        let mut state = funded_state(&keypair, 100);
        let tx =
            Transaction::new_transfer(&keypair, address_with_shard(1), 1, 5, vec![]).unwrap();

        let err = state.apply_transaction(&tx, 1).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn balance_cannot_go_negative() {
        let keypair = keypair_for_shard(1);
        let mut state = funded_state(&keypair, 10);
        let tx =
            Transaction::new_transfer(&keypair, address_with_shard(1), 11, 0, vec![]).unwrap();

        let err = state.apply_transaction(&tx, 1).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(state.balance(&tx.data.from), 10);
    }

    #[test]
    fn foreign_shard_sender_rejected() {
        let keypair = keypair_for_shard(2);
        let mut state = funded_state(&keypair, 10);
        let tx =
            Transaction::new_transfer(&keypair, address_with_shard(1), 1, 0, vec![]).unwrap();

        let err = state.apply_transaction(&tx, 1).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn debt_credit() {
        let mut state = Statedb::new();
        let account = address_with_shard(2);
        let debt = Debt {
            data: DebtData {
                tx_hash: Hash::default(),
                account,
                amount: 12,
                from_shard: 1,
                shard: 2,
                chain_num: 0,
            },
        };

        state.apply_debt(&debt, 2).unwrap();
        let err = state.apply_debt(&debt, 1).unwrap_err();

        assert_eq!(state.balance(&account), 12);
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut world = WorldState::new(MemoryDatabase::new());
        let mut state = Statedb::new();
        state.set_balance(address_with_shard(1), 42);

        let root = world.commit_and_update(&state).unwrap();
        let loaded = world.state_at(&root).unwrap();

        assert_eq!(loaded, state);
        assert_eq!(world.root(), root);
        assert_eq!(loaded.root_hash(), root);
    }

    #[test]
    fn missing_snapshot_is_an_error() {
        let world = WorldState::new(MemoryDatabase::new());
        let root = "missing".primary_hash();

        let err = world.state_at(&root).unwrap_err();

        assert_eq!(err.kind, ErrorKind::ResourceNotFound);
    }

    #[test]
    fn root_depends_on_content_only() {
        let mut one = Statedb::new();
        let mut two = Statedb::new();
        one.set_balance(address_with_shard(1), 1);
        one.set_balance(address_with_shard(2), 2);
        two.set_balance(address_with_shard(2), 2);
        two.set_balance(address_with_shard(1), 1);

        assert_eq!(one.root_hash(), two.root_hash());
    }
}
