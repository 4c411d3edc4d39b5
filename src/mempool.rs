// Admission-controlled holding area for transactions not yet in a block.
// FIFO: first-seen, first-included. No fee prioritization.

use std::collections::{HashSet, VecDeque};

use thiserror::Error;

use crate::types::Transaction;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MempoolError {
    #[error("invalid nonce for {address}: got {got}, confirmed nonce is {confirmed}")]
    InvalidNonce {
        address: String,
        got: u64,
        confirmed: u64,
    },
    #[error("transaction {0} is already pending")]
    DuplicateTransaction(String),
}

#[derive(Debug, Default)]
pub struct Mempool {
    pending: VecDeque<Transaction>,
    ids: HashSet<String>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// `confirmed_nonce` is the sender's nonce as locally confirmed (the count
    /// of its applied transactions). A transaction with a lower nonce is a
    /// replay and is rejected; gaps are allowed in and sorted out at
    /// inclusion time.
    pub fn submit(&mut self, tx: Transaction, confirmed_nonce: u64) -> Result<(), MempoolError> {
        if tx.nonce < confirmed_nonce {
            return Err(MempoolError::InvalidNonce {
                address: tx.from.clone(),
                got: tx.nonce,
                confirmed: confirmed_nonce,
            });
        }
        if self.ids.contains(&tx.id) {
            return Err(MempoolError::DuplicateTransaction(tx.id));
        }
        self.ids.insert(tx.id.clone());
        self.pending.push_back(tx);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Removes and returns up to `max` transactions in submission order.
    pub fn drain(&mut self, max: usize) -> Vec<Transaction> {
        let take = max.min(self.pending.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(tx) = self.pending.pop_front() {
                self.ids.remove(&tx.id);
                out.push(tx);
            }
        }
        out
    }

    /// Puts un-sealed transactions back at the head, preserving order.
    pub fn requeue(&mut self, txs: Vec<Transaction>) {
        for tx in txs.into_iter().rev() {
            if self.ids.insert(tx.id.clone()) {
                self.pending.push_front(tx);
            }
        }
    }

    /// Drops pending entries confirmed by a peer-produced block.
    pub fn remove_confirmed(&mut self, confirmed_ids: &HashSet<String>) {
        if confirmed_ids.is_empty() {
            return;
        }
        self.pending.retain(|tx| !confirmed_ids.contains(&tx.id));
        self.ids.retain(|id| !confirmed_ids.contains(id));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
