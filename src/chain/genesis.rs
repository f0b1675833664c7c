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

//! Genesis block construction and on-disk validation.

use crate::{
    base::{
        schema::{Address, Block, BlockHeader},
        serialize::{rmp_deserialize, rmp_serialize},
    },
    crypto::Hash,
    state::Statedb,
    store::{BlockchainStore, Database},
    Error, ErrorKind, Result,
};
use num_bigint::BigUint;
use std::collections::BTreeMap;

const GENESIS_BLOCK_HEIGHT: u64 = 0;

/// Genesis info for generating the genesis block, also used to initialize
/// the account balances.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GenesisInfo {
    /// Initial account balances.
    pub accounts: BTreeMap<Address, u64>,
    /// Initial mining difficulty. Values below one are clamped to one.
    pub difficult: i64,
    /// Shard number this node lives on.
    pub shard: u64,
}

/// Extra data saved inside the genesis block header.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
struct GenesisExtraData {
    shard_number: u64,
}

/// The genesis block of a chain.
pub struct Genesis {
    header: BlockHeader,
    pub info: GenesisInfo,
}

impl Genesis {
    /// Build the genesis block for the given configuration.
    ///
    /// The genesis state holds the configured balances of the accounts living
    /// on the configured shard; its root is sealed into the header.
    pub fn new(mut info: GenesisInfo) -> Genesis {
        if info.difficult <= 0 {
            info.difficult = 1;
        }
        let extra_data = GenesisExtraData {
            shard_number: info.shard,
        };
        let state_root = Self::state_db(&info).root_hash();

        Genesis {
            header: BlockHeader {
                previous_block_hash: Hash::default(),
                creator: Address::default(),
                state_root,
                txs_root: Hash::default(),
                height: GENESIS_BLOCK_HEIGHT,
                create_timestamp: 0,
                difficulty: BigUint::from(info.difficult as u64),
                nonce: 1,
                extra_data: rmp_serialize(&extra_data).unwrap(),
            },
            info,
        }
    }

    /// Genesis account state: the configured balances restricted to the
    /// configured shard.
    pub fn state_db(info: &GenesisInfo) -> Statedb {
        let mut state = Statedb::new();
        for (addr, amount) in &info.accounts {
            if addr.shard() == info.shard {
                state.set_balance(*addr, *amount);
            }
        }
        state
    }

    pub fn header_hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn difficulty(&self) -> BigUint {
        self.header.difficulty.clone()
    }

    /// The full genesis block for a chain.
    pub fn block(&self, chain_num: u64) -> Block {
        Block {
            header: self.header.clone(),
            transactions: vec![],
            debts: vec![],
            chain_num,
        }
    }

    /// Write the genesis block in the blockchain store if unavailable.
    /// Otherwise, check that the existing genesis block agrees with the
    /// configured one.
    pub fn initialize_and_validate<D: Database>(
        &self,
        store: &BlockchainStore<D>,
        chain_num: u64,
    ) -> Result<()> {
        let stored_hash = match store.get_block_hash(GENESIS_BLOCK_HEIGHT)? {
            None => {
                let block = self.block(chain_num);
                return store.put_block(&block, &self.header.difficulty, true);
            }
            Some(hash) => hash,
        };

        let stored = store
            .get_block(&stored_hash)?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "genesis body missing"))?;

        let data: GenesisExtraData = rmp_deserialize(&stored.header.extra_data)
            .map_err(|_| Error::new_ext(ErrorKind::GenesisMismatch, "unreadable extra data"))?;
        if data.shard_number != self.info.shard {
            return Err(Error::new_ext(
                ErrorKind::GenesisMismatch,
                "stored shard number disagrees with the configured one",
            ));
        }

        if self.header_hash() != stored_hash {
            return Err(Error::new_ext(
                ErrorKind::GenesisMismatch,
                "genesis block hash mismatch",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::schema::tests::address_with_shard;
    use crate::store::MemoryDatabase;

    pub fn create_test_genesis(shard: u64) -> Genesis {
        let mut accounts = BTreeMap::new();
        accounts.insert(address_with_shard(shard), 1_000_000);
        Genesis::new(GenesisInfo {
            accounts,
            difficult: 1,
            shard,
        })
    }

    fn create_store() -> BlockchainStore<MemoryDatabase> {
        BlockchainStore::new(MemoryDatabase::new())
    }

    #[test]
    fn initialize_empty_store() {
        let genesis = create_test_genesis(1);
        let store = create_store();

        genesis.initialize_and_validate(&store, 0).unwrap();

        let head = store.get_head_hash().unwrap().unwrap();
        assert_eq!(head, genesis.header_hash());
        assert_eq!(
            store.get_td(&head).unwrap().unwrap(),
            genesis.difficulty()
        );
    }

    #[test]
    fn reinitialize_same_config_writes_nothing() {
        let genesis = create_test_genesis(1);
        let store = create_store();
        genesis.initialize_and_validate(&store, 0).unwrap();
        let head_before = store.get_head_hash().unwrap().unwrap();

        genesis.initialize_and_validate(&store, 0).unwrap();

        assert_eq!(store.get_head_hash().unwrap().unwrap(), head_before);
    }

    #[test]
    fn shard_mismatch_is_fatal() {
        let store = create_store();
        create_test_genesis(1)
            .initialize_and_validate(&store, 0)
            .unwrap();

        let err = create_test_genesis(2)
            .initialize_and_validate(&store, 0)
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::GenesisMismatch);
    }

    #[test]
    fn different_balances_same_shard_mismatch() {
        let store = create_store();
        create_test_genesis(1)
            .initialize_and_validate(&store, 0)
            .unwrap();

        let mut accounts = BTreeMap::new();
        accounts.insert(address_with_shard(1), 5);
        let other = Genesis::new(GenesisInfo {
            accounts,
            difficult: 1,
            shard: 1,
        });
        let err = other.initialize_and_validate(&store, 0).unwrap_err();

        assert_eq!(err.kind, ErrorKind::GenesisMismatch);
    }

    #[test]
    fn non_positive_difficulty_clamped() {
        let genesis = Genesis::new(GenesisInfo {
            accounts: BTreeMap::new(),
            difficult: -5,
            shard: 1,
        });

        assert_eq!(genesis.difficulty(), BigUint::from(1_u32));
    }

    #[test]
    fn state_restricted_to_configured_shard() {
        let mut accounts = BTreeMap::new();
        accounts.insert(address_with_shard(1), 10);
        accounts.insert(address_with_shard(2), 20);
        let info = GenesisInfo {
            accounts,
            difficult: 1,
            shard: 1,
        };

        let state = Genesis::state_db(&info);

        assert_eq!(state.balance(&address_with_shard(1)), 10);
        assert_eq!(state.balance(&address_with_shard(2)), 0);
    }
}
