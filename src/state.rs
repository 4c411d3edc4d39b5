// Authoritative account/contract state. `apply_transfer` is the only mutator
// of account balances and nonces during block application; the digest must be
// identical on every node that applied the same transactions in order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::Address;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub address: Address,
    pub bytecode: String,
    pub abi: String,
    pub creator: Address,
    pub created_at: u64,
    /// Owned exclusively by the execution backend; the ledger records
    /// existence and routes calls, nothing else. Excluded from the digest.
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },
}

/// Accounts and contracts keyed by address. BTreeMap keeps iteration sorted,
/// which makes the digest independent of insertion order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateStore {
    accounts: BTreeMap<Address, Account>,
    contracts: BTreeMap<Address, Contract>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts are created lazily on first reference; an unseen address is a
    /// zero-balance, zero-nonce account, never an error.
    pub fn account(&self, address: &str) -> Account {
        self.accounts.get(address).cloned().unwrap_or_default()
    }

    /// Genesis funding only; block application goes through `apply_transfer`.
    pub fn fund(&mut self, address: &str, balance: u64) {
        self.accounts.entry(address.to_string()).or_default().balance += balance;
    }

    pub fn apply_transfer(&mut self, from: &str, to: &str, value: u64) -> Result<(), StateError> {
        let have = self.account(from).balance;
        if have < value {
            return Err(StateError::InsufficientBalance { have, need: value });
        }
        {
            let sender = self.accounts.entry(from.to_string()).or_default();
            sender.balance -= value;
            sender.nonce += 1;
        }
        self.accounts.entry(to.to_string()).or_default().balance += value;
        Ok(())
    }

    pub fn put_contract(&mut self, contract: Contract) {
        self.contracts.insert(contract.address.clone(), contract);
    }

    pub fn contract(&self, address: &str) -> Option<&Contract> {
        self.contracts.get(address)
    }

    /// Deterministic fingerprint over the sorted snapshot of all accounts and
    /// contracts. Contract storage is backend-owned and stays out of it.
    pub fn digest(&self) -> String {
        let mut h = Sha256::new();
        for (address, account) in &self.accounts {
            h.update(address.as_bytes());
            h.update([0u8]);
            h.update(account.balance.to_le_bytes());
            h.update(account.nonce.to_le_bytes());
        }
        for (address, contract) in &self.contracts {
            h.update(address.as_bytes());
            h.update([1u8]);
            h.update(contract.bytecode.as_bytes());
            h.update(contract.abi.as_bytes());
            h.update(contract.creator.as_bytes());
            h.update(contract.created_at.to_le_bytes());
        }
        hex::encode(h.finalize())
    }
}
