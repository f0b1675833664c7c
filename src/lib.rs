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

// External crates macros.
#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// Public modules.
pub mod base;
pub mod chain;
pub mod channel;
pub mod crypto;
pub mod error;
pub mod event;
pub mod miner;
pub mod pool;
pub mod protocol;
pub mod service;
pub mod state;
pub mod store;

pub use base::schema::{Address, Block, BlockHeader, Debt, Transaction};
pub use chain::Blockchain;
pub use error::{Error, ErrorKind, Result};
pub use service::{NodeConfig, SeeleService};

/// Number of independent chains maintained by a node.
pub const NUM_CHAINS: usize = 3;

/// Number of logical shards partitioning the address space.
/// Shards are numbered starting from 1.
pub const SHARD_COUNT: u64 = 4;

/// Number of blocks after which a block is considered confirmed and its
/// cross-shard debts are released.
pub const CONFIRMED_BLOCK_NUMBER: u64 = 6;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const VERSION_MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
pub const VERSION_PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");
