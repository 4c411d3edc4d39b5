// Core chain types and canonical hash material.
// Hashes are lowercase hex SHA-256; the genesis predecessor is the literal "0".

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::state::StateStore;

pub type Address = String;
pub type BlockHash = String;

/// `previous_hash` of the only block ever built without a predecessor.
pub const GENESIS_PREV_HASH: &str = "0";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub from: Address,
    /// `None` marks a contract creation.
    pub to: Option<Address>,
    pub value: u64,
    #[serde(default)]
    pub data: String,
    pub nonce: u64,
    pub signature: String,
}

impl Transaction {
    pub fn new(
        from: Address,
        to: Option<Address>,
        value: u64,
        data: String,
        nonce: u64,
        signature: String,
    ) -> Self {
        let mut tx = Transaction {
            id: String::new(),
            from,
            to,
            value,
            data,
            nonce,
            signature,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Signature is excluded: the id commits to what the sender authorized,
    /// and the signature field is filled in over these same bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.data.len());
        out.extend_from_slice(self.from.as_bytes());
        match &self.to {
            Some(to) => {
                out.push(0x01);
                out.extend_from_slice(to.as_bytes());
            }
            None => out.push(0x00),
        }
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(self.data.as_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn compute_id(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.canonical_bytes());
        hex::encode(h.finalize())
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Minimal shape check for the placeholder signature scheme: non-empty hex.
pub fn valid_signature_shape(sig: &str) -> bool {
    !sig.is_empty() && hex::decode(sig).is_ok()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp_ms: u64,
    pub transactions: Vec<Transaction>,
    pub state_root: String,
    pub previous_hash: BlockHash,
    pub validator: Address,
    /// Producer signature over `hash`; empty on genesis. Not part of the hash.
    pub signature: String,
    /// Unused proof-of-work field, kept for hash-shape compatibility.
    pub nonce: u64,
    pub hash: BlockHash,
}

impl Block {
    /// The single ungoverned block at height 0. Timestamp is pinned to zero so
    /// every node funded with the same genesis accounts derives the same hash.
    pub fn genesis(state: &StateStore) -> Self {
        let mut block = Block {
            index: 0,
            timestamp_ms: 0,
            transactions: Vec::new(),
            state_root: state.digest(),
            previous_hash: GENESIS_PREV_HASH.to_string(),
            validator: String::new(),
            signature: String::new(),
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Hash material covers (index, timestamp, transactions, state_root,
    /// previous_hash, validator, nonce). Transactions are committed by id;
    /// each id already commits to the transaction body.
    pub fn hash_material(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.transactions.len() * 64);
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        for tx in &self.transactions {
            out.extend_from_slice(tx.id.as_bytes());
        }
        out.extend_from_slice(self.state_root.as_bytes());
        out.extend_from_slice(self.previous_hash.as_bytes());
        out.extend_from_slice(self.validator.as_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn compute_hash(&self) -> BlockHash {
        let mut h = Sha256::new();
        h.update(self.hash_material());
        hex::encode(h.finalize())
    }
}

/// Deterministic contract address: a function of the creator and the
/// creator's nonce at deployment time.
pub fn contract_address(creator: &str, nonce: u64) -> Address {
    let mut h = Sha256::new();
    h.update(creator.as_bytes());
    h.update(nonce.to_le_bytes());
    let digest = hex::encode(h.finalize());
    format!("rc1{}", &digest[..40])
}
