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

use crate::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Serialize using MessagePack format (without field names).
///
/// # Error
///
/// If the data cannot be serialized a `MalformedData` error kind is returned.
pub fn rmp_serialize<T>(val: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    rmp_serde::to_vec(val).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Deserialize using MessagePack format.
///
/// # Error
///
/// If the data cannot be deserialized a `MalformedData` error kind is returned.
pub fn rmp_deserialize<'a, T>(buf: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    rmp_serde::from_slice(buf).map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
}

/// Trait implemented by all types that can be serialized with MessagePack format.
pub trait MessagePack<'a>: Sized + Serialize + Deserialize<'a> {
    /// Serialize using MessagePack format.
    ///
    /// # Panics
    ///
    /// Panics if the concrete type cannot be serialized using message pack.
    fn serialize(&self) -> Vec<u8> {
        rmp_serialize(self).unwrap() // Safe for core structs.
    }

    /// Deserialize using MessagePack format.
    ///
    /// # Errors
    ///
    /// Propagates the message pack decoder error.
    fn deserialize(buf: &'a [u8]) -> Result<Self> {
        rmp_deserialize(buf)
    }
}

/// Blanket implementation for types implementing `Serialize` and `Deserialize`.
impl<'a, T: Serialize + Deserialize<'a>> MessagePack<'a> for T {}

/// Serde adapter for `num_bigint::BigUint` fields.
///
/// Difficulty and total difficulty travel on the wire as variable-length
/// big-endian byte strings. Annotate fields with
/// `#[serde(with = "crate::base::serialize::biguint")]`.
pub mod biguint {
    use num_bigint::BigUint;
    use serde::{de::Visitor, Deserializer, Serializer};

    pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&value.to_bytes_be())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BigUintVisitor;

        impl<'v> Visitor<'v> for BigUintVisitor {
            type Value = BigUint;

            fn expecting(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(fmt, "expecting byte array")
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(BigUint::from_bytes_be(bytes))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_byte_buf(BigUintVisitor)
    }
}
