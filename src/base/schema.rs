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

//! Core data model: addresses, block headers, blocks, transactions and
//! cross-shard debts.
//!
//! Everything here is a plain serde structure serialized with MessagePack
//! (unnamed fields); hashes are computed over that encoding.

use crate::{
    crypto::{Hash, HashAlgorithm, Hashable, KeyPair, PublicKey},
    Error, ErrorKind, Result, SHARD_COUNT,
};
use num_bigint::BigUint;
use serde::{de::Visitor, Deserializer, Serializer};

/// Address length in bytes.
pub const ADDRESS_LEN: usize = 20;

/// Account address with an embedded shard number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Default)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Address(bytes)
    }

    /// Derive the address of an ed25519 public key: first 20 bytes of the
    /// SHA-256 of the raw key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Hash::from_data(HashAlgorithm::Sha256, &key.to_bytes());
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest.hash_value()[..ADDRESS_LEN]);
        Address(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDRESS_LEN {
            return Err(Error::new(ErrorKind::MalformedData));
        }
        let mut buf = [0u8; ADDRESS_LEN];
        buf.copy_from_slice(bytes);
        Ok(Address(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Shard number this address belongs to, in `1..=SHARD_COUNT`.
    pub fn shard(&self) -> u64 {
        let sum: u64 = self.0.iter().map(|b| *b as u64).sum();
        sum % SHARD_COUNT + 1
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AddressVisitor;

        impl<'v> Visitor<'v> for AddressVisitor {
            type Value = Address;

            fn expecting(
                &self,
                fmt: &mut std::fmt::Formatter<'_>,
            ) -> std::result::Result<(), std::fmt::Error> {
                write!(fmt, "expecting byte array.")
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Address::from_bytes(bytes)
                    .map_err(|_err| serde::de::Error::custom("Invalid address"))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }
        deserializer.deserialize_byte_buf(AddressVisitor)
    }
}

/// Block header.
///
/// The header hash is the primary hash of this structure and doubles as the
/// proof-of-work puzzle output: a seal is valid when the hash, read as a
/// big-endian integer, is below the target derived from `difficulty`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BlockHeader {
    /// Parent header hash. Empty for the genesis block.
    pub previous_block_hash: Hash,
    /// Address rewarded for mining this block.
    pub creator: Address,
    /// Root of the account state after executing this block.
    pub state_root: Hash,
    /// Merkle root of the body transactions.
    pub txs_root: Hash,
    /// Number of ancestors.
    pub height: u64,
    /// Creation time in seconds since the Unix epoch.
    pub create_timestamp: u64,
    /// Expected work, recomputed from the parent at validation time.
    #[serde(with = "crate::base::serialize::biguint")]
    pub difficulty: BigUint,
    /// Proof-of-work solution.
    pub nonce: u64,
    /// Auxiliary payload. The genesis block stores its shard number here.
    #[serde(with = "serde_bytes")]
    pub extra_data: Vec<u8>,
}

impl BlockHeader {
    /// Header hash, deterministic over all fields.
    pub fn hash(&self) -> Hash {
        self.primary_hash()
    }

    /// Clone of this header with a different nonce. Used by the PoW workers.
    pub fn with_nonce(&self, nonce: u64) -> BlockHeader {
        let mut header = self.clone();
        header.nonce = nonce;
        header
    }
}

/// Merkle root of an ordered transaction list.
///
/// Pairwise reduction over the transaction hashes; an empty list yields the
/// empty hash.
pub fn merkle_root_hash(txs: &[Transaction]) -> Hash {
    let mut layer: Vec<Hash> = txs.iter().map(|tx| tx.hash()).collect();
    if layer.is_empty() {
        return Hash::default();
    }
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2 + 1);
        for pair in layer.chunks(2) {
            let mut buf = pair[0].to_bytes();
            buf.extend_from_slice(pair.last().unwrap().as_bytes());
            next.push(Hash::from_data(HashAlgorithm::Sha256, &buf));
        }
        layer = next;
    }
    layer[0]
}

/// Block structure.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Ordered transactions executed by this block.
    pub transactions: Vec<Transaction>,
    /// Ordered cross-shard debts applied by this block.
    pub debts: Vec<Debt>,
    /// Chain this block belongs to.
    pub chain_num: u64,
}

impl Block {
    pub fn header_hash(&self) -> Hash {
        self.header.hash()
    }
}

/// Transaction payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct TransactionData {
    /// Sender address. Must match the address derived from `caller`.
    pub from: Address,
    /// Recipient address, possibly on a different shard.
    pub to: Address,
    /// Transferred amount.
    pub amount: u64,
    /// Sender account nonce.
    pub account_nonce: u64,
    /// Arbitrary payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Submitter public key.
    pub caller: PublicKey,
}

/// Signed transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Transaction {
    /// Transaction payload.
    pub data: TransactionData,
    /// Data field signature verifiable using the `caller` within the `data`.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Build and sign a transfer transaction.
    pub fn new_transfer(
        keypair: &KeyPair,
        to: Address,
        amount: u64,
        account_nonce: u64,
        payload: Vec<u8>,
    ) -> Result<Transaction> {
        let caller = keypair.public_key();
        let data = TransactionData {
            from: Address::from_public_key(&caller),
            to,
            amount,
            account_nonce,
            payload,
            caller,
        };
        let signature = keypair.sign(&crate::base::serialize::rmp_serialize(&data)?)?;
        Ok(Transaction { data, signature })
    }

    /// Transaction hash, computed over the payload only.
    pub fn hash(&self) -> Hash {
        self.data.primary_hash()
    }

    /// Signature and sender ownership verification.
    pub fn verify(&self) -> Result<()> {
        if Address::from_public_key(&self.data.caller) != self.data.from {
            return Err(Error::new_ext(
                ErrorKind::InvalidSignature,
                "sender address does not belong to the caller key",
            ));
        }
        let buf = crate::base::serialize::rmp_serialize(&self.data)?;
        match self.data.caller.verify(&buf, &self.signature) {
            true => Ok(()),
            false => Err(ErrorKind::InvalidSignature.into()),
        }
    }

    /// True when sender and recipient live on different shards.
    pub fn is_cross_shard(&self) -> bool {
        self.data.from.shard() != self.data.to.shard()
    }
}

/// Cross-shard debt payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct DebtData {
    /// Hash of the transaction this debt was derived from.
    pub tx_hash: Hash,
    /// Credited account.
    pub account: Address,
    /// Credited amount.
    pub amount: u64,
    /// Shard of the originating transaction sender.
    pub from_shard: u64,
    /// Destination shard, i.e. `account.shard()`.
    pub shard: u64,
    /// Chain the originating transaction was confirmed on.
    pub chain_num: u64,
}

/// Cross-shard credit advisory derived from a confirmed transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Debt {
    pub data: DebtData,
}

impl Debt {
    /// Derive the debt of a cross-shard transaction.
    /// Returns `None` when sender and recipient share the shard.
    pub fn from_transaction(tx: &Transaction, chain_num: u64) -> Option<Debt> {
        if !tx.is_cross_shard() {
            return None;
        }
        Some(Debt {
            data: DebtData {
                tx_hash: tx.hash(),
                account: tx.data.to,
                amount: tx.data.amount,
                from_shard: tx.data.from.shard(),
                shard: tx.data.to.shard(),
                chain_num,
            },
        })
    }

    pub fn hash(&self) -> Hash {
        self.data.primary_hash()
    }
}

/// Group the debts generated by a confirmed block by destination shard.
///
/// The returned vector is indexed by shard number; index 0 is unused since
/// shards are numbered from 1.
pub fn debts_by_shard(txs: &[Transaction], chain_num: u64) -> Vec<Vec<Debt>> {
    let mut map = vec![Vec::new(); SHARD_COUNT as usize + 1];
    for tx in txs {
        if let Some(debt) = Debt::from_transaction(tx, chain_num) {
            map[debt.data.shard as usize].push(debt);
        }
    }
    map
}

/// Total difficulty newtype used on the wire and in the store.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TotalDifficulty(#[serde(with = "crate::base::serialize::biguint")] pub BigUint);

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};
    use crate::crypto::sign::tests::ed25519_test_keypair;

    /// Address made only of zeros except the last byte, chosen so that the
    /// byte sum lands on the requested shard.
    pub fn address_with_shard(shard: u64) -> Address {
        assert!((1..=SHARD_COUNT).contains(&shard));
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[ADDRESS_LEN - 1] = (shard - 1) as u8;
        Address::new(bytes)
    }

    /// Random keypair whose derived address lives on the requested shard.
    pub fn keypair_for_shard(shard: u64) -> KeyPair {
        loop {
            let keypair = KeyPair::from_random();
            if Address::from_public_key(&keypair.public_key()).shard() == shard {
                return keypair;
            }
        }
    }

    pub fn create_test_tx(nonce: u64) -> Transaction {
        let keypair = ed25519_test_keypair();
        Transaction::new_transfer(&keypair, address_with_shard(1), 3, nonce, vec![]).unwrap()
    }

    pub fn create_test_header(parent: Hash, height: u64, difficulty: u64) -> BlockHeader {
        BlockHeader {
            previous_block_hash: parent,
            creator: address_with_shard(1),
            state_root: Hash::default(),
            txs_root: Hash::default(),
            height,
            create_timestamp: height,
            difficulty: BigUint::from(difficulty),
            nonce: 1,
            extra_data: vec![],
        }
    }

    pub fn create_test_block(chain_num: u64, height: u64, parent: Hash) -> Block {
        Block {
            header: create_test_header(parent, height, 1),
            transactions: vec![],
            debts: vec![],
            chain_num,
        }
    }

    #[test]
    fn address_shard_in_range() {
        for b in 0u8..32 {
            let mut bytes = [0u8; ADDRESS_LEN];
            bytes[0] = b;
            let shard = Address::new(bytes).shard();
            assert!((1..=SHARD_COUNT).contains(&shard));
        }
    }

    #[test]
    fn address_serialize_round() {
        let addr = address_with_shard(3);

        let buf = rmp_serialize(&addr).unwrap();
        let back: Address = rmp_deserialize(&buf).unwrap();

        assert_eq!(back, addr);
    }

    #[test]
    fn transaction_sign_and_verify() {
        let tx = create_test_tx(0);

        tx.verify().unwrap();
    }

    #[test]
    fn transaction_tamper_detection() {
        let mut tx = create_test_tx(0);
        tx.data.amount += 1;

        let err = tx.verify().unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidSignature);
    }

    #[test]
    fn transaction_stolen_sender_detection() {
        let mut tx = create_test_tx(0);
        tx.data.from = address_with_shard(2);

        let err = tx.verify().unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidSignature);
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        let header = create_test_header(Hash::default(), 1, 1);

        let one = header.hash();
        let two = header.with_nonce(42).hash();

        assert_ne!(one, two);
        assert_eq!(one, header.hash());
    }

    #[test]
    fn merkle_root_of_empty_list_is_empty() {
        assert!(merkle_root_hash(&[]).is_empty());
    }

    #[test]
    fn merkle_root_depends_on_order() {
        let txs = vec![create_test_tx(0), create_test_tx(1), create_test_tx(2)];
        let mut reversed = txs.clone();
        reversed.reverse();

        assert_ne!(merkle_root_hash(&txs), merkle_root_hash(&reversed));
    }

    #[test]
    fn debt_only_from_cross_shard_tx() {
        let keypair = ed25519_test_keypair();
        let from_shard = Address::from_public_key(&keypair.public_key()).shard();
        let same = from_shard;
        let other = from_shard % SHARD_COUNT + 1;

        let local =
            Transaction::new_transfer(&keypair, address_with_shard(same), 5, 0, vec![]).unwrap();
        let cross =
            Transaction::new_transfer(&keypair, address_with_shard(other), 5, 0, vec![]).unwrap();

        assert!(Debt::from_transaction(&local, 0).is_none());
        let debt = Debt::from_transaction(&cross, 2).unwrap();
        assert_eq!(debt.data.shard, other);
        assert_eq!(debt.data.from_shard, from_shard);
        assert_eq!(debt.data.chain_num, 2);
        assert_eq!(debt.data.amount, 5);
    }

    #[test]
    fn debts_grouped_by_destination_shard() {
        let keypair = ed25519_test_keypair();
        let from_shard = Address::from_public_key(&keypair.public_key()).shard();
        let other = from_shard % SHARD_COUNT + 1;
        let txs = vec![
            Transaction::new_transfer(&keypair, address_with_shard(other), 1, 0, vec![]).unwrap(),
            Transaction::new_transfer(&keypair, address_with_shard(from_shard), 1, 1, vec![])
                .unwrap(),
            Transaction::new_transfer(&keypair, address_with_shard(other), 2, 2, vec![]).unwrap(),
        ];

        let map = debts_by_shard(&txs, 0);

        assert_eq!(map[other as usize].len(), 2);
        assert_eq!(map[from_shard as usize].len(), 0);
    }

    #[test]
    fn block_serialize_round() {
        let block = create_test_block(1, 3, Hash::default());

        let buf = rmp_serialize(&block).unwrap();
        let back: Block = rmp_deserialize(&buf).unwrap();

        assert_eq!(back, block);
    }
}
