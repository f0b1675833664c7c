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

//! Persistence layer.
//!
//! The actual key-value engine is an external collaborator hidden behind the
//! [`Database`] trait; [`BlockchainStore`] layers the chain record types on
//! top of it with prefixed keys. Each chain owns one store instance, the
//! account state uses a bare database.

use crate::{
    base::{
        serialize::{rmp_deserialize, rmp_serialize},
        schema::{Block, BlockHeader},
        RwLock,
    },
    crypto::Hash,
    error::Result,
};
#[cfg(test)]
use mockall::automock;
use num_bigint::BigUint;

pub mod memory;
pub use memory::MemoryDatabase;

/// Trait providing access to a persistent key-value database.
#[cfg_attr(test, automock)]
pub trait Database: Send + Sync + 'static {
    /// Load the value associated with the key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Store a key-value pair.
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Remove the value associated with the key.
    fn delete(&mut self, key: &[u8]) -> Result<()>;
}

// Record key prefixes.
const KEY_PREFIX_HEADER: u8 = b'h';
const KEY_PREFIX_BODY: u8 = b'b';
const KEY_PREFIX_HEIGHT_TO_HASH: u8 = b'c';
const KEY_PREFIX_HASH_TO_HEIGHT: u8 = b'n';
const KEY_PREFIX_TD: u8 = b't';
const KEY_HEAD: &[u8] = b"HEAD";

fn hash_key(prefix: u8, hash: &Hash) -> Vec<u8> {
    let mut key = vec![prefix];
    key.extend_from_slice(hash.as_bytes());
    key
}

fn height_key(height: u64) -> Vec<u8> {
    let mut key = vec![KEY_PREFIX_HEIGHT_TO_HASH];
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Typed blockchain records on top of a plain [`Database`].
///
/// Keeps headers, bodies, the hash/height indexes, per-block total difficulty
/// and the canonical head hash. Reads take the shared lock, writes the
/// exclusive one; the caller serializes whole-block insertions.
pub struct BlockchainStore<D: Database> {
    db: RwLock<D>,
}

impl<D: Database> BlockchainStore<D> {
    pub fn new(db: D) -> Self {
        BlockchainStore {
            db: RwLock::new(db),
        }
    }

    /// Load a block header by header hash.
    pub fn get_block_header(&self, hash: &Hash) -> Result<Option<BlockHeader>> {
        match self.db.read().get(&hash_key(KEY_PREFIX_HEADER, hash))? {
            Some(buf) => Ok(Some(rmp_deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    /// Load a full block by header hash.
    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>> {
        match self.db.read().get(&hash_key(KEY_PREFIX_BODY, hash))? {
            Some(buf) => Ok(Some(rmp_deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    /// Canonical block hash at the given height.
    pub fn get_block_hash(&self, height: u64) -> Result<Option<Hash>> {
        match self.db.read().get(&height_key(height))? {
            Some(buf) => Ok(Some(rmp_deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    /// Height of a stored block, canonical or not.
    pub fn get_block_height(&self, hash: &Hash) -> Result<Option<u64>> {
        match self
            .db
            .read()
            .get(&hash_key(KEY_PREFIX_HASH_TO_HEIGHT, hash))?
        {
            Some(buf) => Ok(Some(rmp_deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    /// Canonical block at the given height.
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.get_block_hash(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    /// Total difficulty accumulated up to the given block.
    pub fn get_td(&self, hash: &Hash) -> Result<Option<BigUint>> {
        match self.db.read().get(&hash_key(KEY_PREFIX_TD, hash))? {
            Some(buf) => Ok(Some(BigUint::from_bytes_be(&buf))),
            None => Ok(None),
        }
    }

    /// Canonical head hash.
    pub fn get_head_hash(&self) -> Result<Option<Hash>> {
        match self.db.read().get(KEY_HEAD)? {
            Some(buf) => Ok(Some(rmp_deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    /// True when the block is already stored.
    pub fn has_block(&self, hash: &Hash) -> Result<bool> {
        Ok(self
            .db
            .read()
            .get(&hash_key(KEY_PREFIX_HEADER, hash))?
            .is_some())
    }

    /// Persist header, body, hash-to-height index and total difficulty.
    ///
    /// The canonical height-to-hash index and the head pointer are written only
    /// when `canonical` is set; fork blocks stay reachable by hash.
    pub fn put_block(&self, block: &Block, td: &BigUint, canonical: bool) -> Result<()> {
        let hash = block.header_hash();
        let mut db = self.db.write();
        db.put(
            &hash_key(KEY_PREFIX_HEADER, &hash),
            rmp_serialize(&block.header)?,
        )?;
        db.put(&hash_key(KEY_PREFIX_BODY, &hash), rmp_serialize(block)?)?;
        db.put(
            &hash_key(KEY_PREFIX_HASH_TO_HEIGHT, &hash),
            rmp_serialize(&block.header.height)?,
        )?;
        db.put(&hash_key(KEY_PREFIX_TD, &hash), td.to_bytes_be())?;
        if canonical {
            db.put(&height_key(block.header.height), rmp_serialize(&hash)?)?;
            db.put(KEY_HEAD, rmp_serialize(&hash)?)?;
        }
        Ok(())
    }

    /// Point the canonical height index at the given stored block.
    pub fn put_canonical_index(&self, height: u64, hash: &Hash) -> Result<()> {
        self.db
            .write()
            .put(&height_key(height), rmp_serialize(hash)?)
    }

    /// Drop the canonical index entry at the given height.
    pub fn delete_canonical_index(&self, height: u64) -> Result<()> {
        self.db.write().delete(&height_key(height))
    }

    /// Move the canonical head pointer.
    pub fn set_head_hash(&self, hash: &Hash) -> Result<()> {
        self.db.write().put(KEY_HEAD, rmp_serialize(hash)?)
    }
}
