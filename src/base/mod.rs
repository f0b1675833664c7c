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

//! Foundation types shared by every subsystem.

pub mod queue_set;
pub mod schema;
pub mod serialize;

pub use schema::{Address, Block, BlockHeader, Debt, Transaction};

/// Project-wide mutex type.
pub type Mutex<T> = parking_lot::Mutex<T>;

/// Project-wide read-write lock type.
pub type RwLock<T> = parking_lot::RwLock<T>;
