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

//! Single chain maintenance: head tracking, authoritative block insertion
//! and fork resolution.
//!
//! A node runs `NUM_CHAINS` instances of [`Blockchain`], all sharing one
//! account [`WorldState`] and one [`EventBus`]. `write_block` is the only
//! insertion path, used by the miner and the synchronizer alike; invocations
//! are serialized per chain.

pub mod genesis;
pub mod pow;

pub use genesis::{Genesis, GenesisInfo};

use crate::{
    base::{
        schema::{merkle_root_hash, Block},
        Mutex, RwLock,
    },
    crypto::Hash,
    event::{Event, EventBus},
    state::WorldState,
    store::{BlockchainStore, Database},
    Error, ErrorKind, Result,
};
use num_bigint::BigUint;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Units credited to the creator of every block.
pub const MINER_REWARD: u64 = 20;

/// One proof-of-work chain backed by its own store.
pub struct Blockchain<D: Database> {
    /// Typed chain records.
    store: BlockchainStore<D>,
    /// Shared account state.
    world: Arc<RwLock<WorldState<D>>>,
    /// Shared event bus.
    bus: Arc<EventBus>,
    /// Chain identifier in `0..NUM_CHAINS`.
    chain_num: u64,
    /// Shard this node lives on.
    shard: u64,
    /// Last known safe head, rewritten on every head move.
    recovery_point: Option<PathBuf>,
    /// Serializes `write_block` invocations.
    write_lock: Mutex<()>,
}

impl<D: Database> Blockchain<D> {
    /// Open a chain on the given database, bootstrapping and validating the
    /// genesis block.
    ///
    /// Fails with `GenesisMismatch` when the stored genesis disagrees with
    /// the configured one.
    pub fn new(
        db: D,
        genesis: &Genesis,
        chain_num: u64,
        world: Arc<RwLock<WorldState<D>>>,
        bus: Arc<EventBus>,
        recovery_point: Option<PathBuf>,
    ) -> Result<Self> {
        let store = BlockchainStore::new(db);
        genesis.initialize_and_validate(&store, chain_num)?;

        {
            // The genesis state snapshot must be reachable from the header
            // root before any child block executes.
            let mut world = world.write();
            let state = Genesis::state_db(&genesis.info);
            let root = world.commit(&state)?;
            if world.root().is_empty() {
                world.set_root(root);
            }
        }

        let chain = Blockchain {
            store,
            world,
            bus,
            chain_num,
            shard: genesis.info.shard,
            recovery_point,
            write_lock: Mutex::new(()),
        };

        if let Some(path) = chain.recovery_point.clone() {
            if let Some(hash) = read_recovery_point(&path) {
                if chain.store.get_head_hash()?.is_none() && chain.store.has_block(&hash)? {
                    info!(
                        "[chain {}] head restored from recovery point {}",
                        chain_num,
                        hash.to_hex()
                    );
                    chain.store.set_head_hash(&hash)?;
                }
            }
        }

        Ok(chain)
    }

    pub fn chain_num(&self) -> u64 {
        self.chain_num
    }

    /// Typed store accessor, also used by the protocol to answer queries.
    pub fn get_store(&self) -> &BlockchainStore<D> {
        &self.store
    }

    /// Canonical head hash.
    pub fn head_hash(&self) -> Result<Hash> {
        self.store
            .get_head_hash()?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "head hash missing"))
    }

    /// Canonical head block.
    pub fn current_block(&self) -> Result<Block> {
        let hash = self.head_hash()?;
        self.store
            .get_block(&hash)?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "head body missing"))
    }

    /// Total difficulty of the canonical head.
    pub fn head_td(&self) -> Result<BigUint> {
        let hash = self.head_hash()?;
        self.store
            .get_td(&hash)?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "head td missing"))
    }

    /// Authoritative block insertion path.
    ///
    /// Validates the header against its parent, executes the body on the
    /// parent post-state, persists block and total difficulty and moves the
    /// head when the new block carries more work (ties break toward the
    /// lower header hash). A head move rewires the canonical height index
    /// and emits `ChainHeaderChanged`; unknown-parent blocks are dropped.
    pub fn write_block(&self, block: &Block) -> Result<()> {
        let _guard = self.write_lock.lock();

        if block.chain_num != self.chain_num {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                "block tagged for another chain",
            ));
        }

        let hash = block.header_hash();
        if self.store.has_block(&hash)? {
            return Err(ErrorKind::DuplicatedBlock.into());
        }

        let header = &block.header;
        let parent = self
            .store
            .get_block_header(&header.previous_block_hash)?
            .ok_or_else(|| Error::new(ErrorKind::UnknownParent))?;

        if header.height != parent.height + 1 {
            return Err(Error::new_ext(ErrorKind::InvalidBlock, "height gap"));
        }
        if header.create_timestamp < parent.create_timestamp {
            return Err(Error::new_ext(
                ErrorKind::InvalidBlock,
                "timestamp before parent",
            ));
        }
        let expected = pow::get_difficult(header.create_timestamp, &parent);
        if header.difficulty != expected {
            return Err(Error::new_ext(
                ErrorKind::InvalidSeal,
                "unexpected difficulty",
            ));
        }
        pow::verify_seal(header)?;
        if merkle_root_hash(&block.transactions) != header.txs_root {
            return Err(Error::new_ext(
                ErrorKind::InvalidBlock,
                "transactions root mismatch",
            ));
        }

        // Execute the body on the parent post-state. The snapshot is
        // committed even for fork blocks: a later reorg executes children
        // from this root.
        let new_root = {
            let mut world = self.world.write();
            let mut state = world.state_at(&parent.state_root)?;
            state.apply_reward(&header.creator, MINER_REWARD);
            for tx in &block.transactions {
                tx.verify()?;
                state.apply_transaction(tx, self.shard)?;
            }
            for debt in &block.debts {
                state.apply_debt(debt, self.shard)?;
            }
            let root = state.root_hash();
            if root != header.state_root {
                return Err(Error::new_ext(ErrorKind::InvalidState, "state root mismatch"));
            }
            world.commit(&state)?;
            root
        };

        let parent_td = self
            .store
            .get_td(&header.previous_block_hash)?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "parent td missing"))?;
        let td = parent_td + &header.difficulty;
        self.store.put_block(block, &td, false)?;

        let old_head = self.head_hash()?;
        let head_td = self
            .store
            .get_td(&old_head)?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "head td missing"))?;
        let wins = td > head_td || (td == head_td && hash < old_head);
        if !wins {
            debug!(
                "[chain {}] stored side block {} at height {}",
                self.chain_num,
                hash.to_hex(),
                header.height
            );
            return Ok(());
        }

        self.update_canonical_index(block, &old_head)?;
        self.store.set_head_hash(&hash)?;
        self.world.write().set_root(new_root);
        self.write_recovery_point(&hash);

        info!(
            "[chain {}] new head {} at height {}",
            self.chain_num,
            hash.to_hex(),
            header.height
        );
        self.bus.fire(Event::ChainHeaderChanged {
            chain_num: self.chain_num,
            head_hash: hash,
        });
        Ok(())
    }

    /// Rewire the canonical height-to-hash index from the new head back to the
    /// fork point and drop stale entries above it.
    fn update_canonical_index(&self, new_head: &Block, old_head: &Hash) -> Result<()> {
        let mut cursor_hash = new_head.header_hash();
        let mut cursor = new_head.header.clone();
        loop {
            if self.store.get_block_hash(cursor.height)? == Some(cursor_hash) {
                break;
            }
            self.store.put_canonical_index(cursor.height, &cursor_hash)?;
            if cursor.height == 0 {
                break;
            }
            cursor_hash = cursor.previous_block_hash;
            cursor = self
                .store
                .get_block_header(&cursor_hash)?
                .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "branch hole"))?;
        }

        let old_height = self
            .store
            .get_block_height(old_head)?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "old head height missing"))?;
        let mut height = new_head.header.height + 1;
        while height <= old_height {
            self.store.delete_canonical_index(height)?;
            height += 1;
        }
        Ok(())
    }

    fn write_recovery_point(&self, hash: &Hash) {
        if let Some(path) = &self.recovery_point {
            if let Err(err) = std::fs::write(path, hash.to_hex()) {
                warn!(
                    "[chain {}] failed to write recovery point: {}",
                    self.chain_num, err
                );
            }
        }
    }
}

fn read_recovery_point(path: &Path) -> Option<Hash> {
    let content = std::fs::read_to_string(path).ok()?;
    Hash::from_hex(content.trim()).ok()
}

/// Blocks sitting on the two branches between `old_head`, `new_head` and
/// their common ancestor.
///
/// Returns `(abandoned, adopted)`, both ordered from branch tip towards the
/// ancestor. Used by the pools to reconcile after a reorg.
pub fn fork_blocks<D: Database>(
    store: &BlockchainStore<D>,
    old_head: &Hash,
    new_head: &Hash,
) -> Result<(Vec<Block>, Vec<Block>)> {
    let load = |hash: &Hash| -> Result<Block> {
        store
            .get_block(hash)?
            .ok_or_else(|| Error::new_ext(ErrorKind::DatabaseFault, "branch block missing"))
    };

    let mut abandoned = Vec::new();
    let mut adopted = Vec::new();
    let mut old_cursor = load(old_head)?;
    let mut new_cursor = load(new_head)?;

    while old_cursor.header.height > new_cursor.header.height {
        let parent = old_cursor.header.previous_block_hash;
        abandoned.push(old_cursor);
        old_cursor = load(&parent)?;
    }
    while new_cursor.header.height > old_cursor.header.height {
        let parent = new_cursor.header.previous_block_hash;
        adopted.push(new_cursor);
        new_cursor = load(&parent)?;
    }
    while old_cursor.header_hash() != new_cursor.header_hash() {
        let old_parent = old_cursor.header.previous_block_hash;
        let new_parent = new_cursor.header.previous_block_hash;
        abandoned.push(old_cursor);
        adopted.push(new_cursor);
        old_cursor = load(&old_parent)?;
        new_cursor = load(&new_parent)?;
    }

    Ok((abandoned, adopted))
}
