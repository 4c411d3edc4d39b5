// Append-only hash-linked chain plus the state-transition function.
// `append` is the single commit point: locally proposed and peer-received
// blocks take the same path, so a block is never partially applied.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{Contract, StateError, StateStore};
use crate::types::{contract_address, Address, Block, Transaction};

/// What to do with a transaction that fails validation during block assembly.
/// The reference behavior silently skips it to keep production live; `Reject`
/// aborts the whole proposal instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidTxPolicy {
    #[default]
    Skip,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("stale nonce for {address}: expected {expected}, got {got}")]
    StaleNonce {
        address: Address,
        expected: u64,
        got: u64,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error("transaction id does not match its contents")]
    IdMismatch,
    #[error("block index {got} does not match next height {expected}")]
    ChainMismatch { expected: u64, got: u64 },
    #[error("previous hash does not match the chain tip")]
    BrokenLink,
    #[error("block hash does not match its contents")]
    HashMismatch,
    #[error("state root is not reproducible from the block's transactions")]
    StateRootMismatch,
    #[error("proposal rejected at transaction {id}: {reason}")]
    RejectedTransaction { id: String, reason: String },
    #[error("candidate chain is not longer than the local chain")]
    CandidateNotLonger,
    #[error("candidate chain failed validation: {0}")]
    InvalidCandidate(String),
}

#[derive(Debug)]
pub struct Ledger {
    blocks: Vec<Block>,
    store: StateStore,
    genesis_state: StateStore,
    policy: InvalidTxPolicy,
}

impl Ledger {
    /// Builds the genesis state from the configured funding and seals the
    /// single ungoverned block at height 0.
    pub fn new(genesis_accounts: &[(Address, u64)], policy: InvalidTxPolicy) -> Self {
        let mut genesis_state = StateStore::new();
        for (address, balance) in genesis_accounts {
            genesis_state.fund(address, *balance);
        }
        let genesis = Block::genesis(&genesis_state);
        Self {
            blocks: vec![genesis],
            store: genesis_state.clone(),
            genesis_state,
            policy,
        }
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn tip(&self) -> &Block {
        self.blocks.last().expect("chain always holds genesis")
    }

    pub fn genesis_block(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Applies the transactions against a scratch copy of the current state
    /// and seals an unsigned block linked to the tip. Nothing is committed;
    /// the caller follows up with `append`, which replays and commits.
    pub fn propose_block(
        &self,
        validator: &str,
        txs: Vec<Transaction>,
        timestamp_ms: u64,
    ) -> Result<Block, LedgerError> {
        let mut scratch = self.store.clone();
        let included = apply_transactions(&mut scratch, txs, self.policy, timestamp_ms)?;
        let mut block = Block {
            index: self.height(),
            timestamp_ms,
            transactions: included,
            state_root: scratch.digest(),
            previous_hash: self.tip().hash.clone(),
            validator: validator.to_string(),
            signature: String::new(),
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        Ok(block)
    }

    /// Validates linkage and integrity, replays the block's transactions, and
    /// commits only when the claimed state root is reproduced.
    pub fn append(&mut self, block: Block) -> Result<(), LedgerError> {
        if block.index != self.height() {
            return Err(LedgerError::ChainMismatch {
                expected: self.height(),
                got: block.index,
            });
        }
        if block.previous_hash != self.tip().hash {
            return Err(LedgerError::BrokenLink);
        }
        if block.compute_hash() != block.hash {
            return Err(LedgerError::HashMismatch);
        }

        let mut scratch = self.store.clone();
        // Replay strictly: every transaction the producer sealed must apply.
        apply_transactions(
            &mut scratch,
            block.transactions.clone(),
            InvalidTxPolicy::Reject,
            block.timestamp_ms,
        )
        .map_err(|_| LedgerError::StateRootMismatch)?;
        if scratch.digest() != block.state_root {
            return Err(LedgerError::StateRootMismatch);
        }

        self.store = scratch;
        self.blocks.push(block);
        Ok(())
    }

    /// Longest-valid-chain reconciliation: adopt the candidate iff it is
    /// strictly longer, shares our genesis, and fully revalidates by replay.
    /// No stake weighting, no partial adoption.
    pub fn reconcile(&mut self, candidate: Vec<Block>) -> Result<(), LedgerError> {
        if candidate.len() <= self.blocks.len() {
            return Err(LedgerError::CandidateNotLonger);
        }
        match candidate.first() {
            Some(genesis) if genesis.hash == self.blocks[0].hash => {}
            _ => {
                return Err(LedgerError::InvalidCandidate(
                    "genesis does not match".to_string(),
                ))
            }
        }

        let mut replay = Ledger {
            blocks: vec![self.blocks[0].clone()],
            store: self.genesis_state.clone(),
            genesis_state: self.genesis_state.clone(),
            policy: self.policy,
        };
        for block in candidate.into_iter().skip(1) {
            let index = block.index;
            replay.append(block).map_err(|e| {
                LedgerError::InvalidCandidate(format!("block {}: {}", index, e))
            })?;
        }

        self.blocks = replay.blocks;
        self.store = replay.store;
        Ok(())
    }
}

/// The state-transition function for one block's transactions, in order.
/// Returns the transactions that actually applied. Under `Skip` an invalid
/// entry is dropped; under `Reject` it aborts with the offending id.
pub fn apply_transactions(
    store: &mut StateStore,
    txs: Vec<Transaction>,
    policy: InvalidTxPolicy,
    timestamp_ms: u64,
) -> Result<Vec<Transaction>, LedgerError> {
    let mut included = Vec::with_capacity(txs.len());
    for tx in txs {
        match apply_one(store, &tx, timestamp_ms) {
            Ok(()) => included.push(tx),
            Err(e) => match policy {
                InvalidTxPolicy::Skip => {
                    tracing::debug!(id = %tx.id, error = %e, "dropping invalid transaction");
                }
                InvalidTxPolicy::Reject => {
                    return Err(LedgerError::RejectedTransaction {
                        id: tx.id,
                        reason: e.to_string(),
                    })
                }
            },
        }
    }
    Ok(included)
}

fn apply_one(store: &mut StateStore, tx: &Transaction, timestamp_ms: u64) -> Result<(), LedgerError> {
    if tx.id != tx.compute_id() {
        return Err(LedgerError::IdMismatch);
    }
    let expected = store.account(&tx.from).nonce;
    if tx.nonce != expected {
        return Err(LedgerError::StaleNonce {
            address: tx.from.clone(),
            expected,
            got: tx.nonce,
        });
    }
    match &tx.to {
        Some(to) => store.apply_transfer(&tx.from, to, tx.value)?,
        None => {
            // Contract creation: the address derives from the creator and the
            // creator's nonce at deployment time, before the nonce bump.
            let address = contract_address(&tx.from, tx.nonce);
            store.apply_transfer(&tx.from, &address, tx.value)?;
            let (bytecode, abi) = parse_contract_payload(&tx.data);
            store.put_contract(Contract {
                address,
                bytecode,
                abi,
                creator: tx.from.clone(),
                created_at: timestamp_ms,
                storage: Default::default(),
            });
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct ContractPayload {
    bytecode: String,
    #[serde(default)]
    abi: String,
}

/// Deploy payloads are JSON `{bytecode, abi}`; anything else is treated as
/// raw bytecode with an empty ABI. The ledger never interprets either.
fn parse_contract_payload(data: &str) -> (String, String) {
    match serde_json::from_str::<ContractPayload>(data) {
        Ok(p) => (p.bytecode, p.abi),
        Err(_) => (data.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(from: &str, to: &str, value: u64, nonce: u64) -> Transaction {
        Transaction::new(
            from.to_string(),
            Some(to.to_string()),
            value,
            String::new(),
            nonce,
            "00".to_string(),
        )
    }

    fn funded_ledger() -> Ledger {
        Ledger::new(&[("a".to_string(), 100)], InvalidTxPolicy::Skip)
    }

    fn seal(ledger: &mut Ledger, txs: Vec<Transaction>, ts: u64) -> Block {
        let block = ledger.propose_block("v1", txs, ts).expect("propose");
        ledger.append(block.clone()).expect("append");
        block
    }

    #[test]
    fn genesis_chain_has_height_one() {
        let ledger = funded_ledger();
        assert_eq!(ledger.height(), 1);
        assert_eq!(ledger.genesis_block().previous_hash, "0");
        assert_eq!(ledger.genesis_block().state_root, ledger.store().digest());
    }

    #[test]
    fn transfer_scenario() {
        // A has 100; tx(A->B, 40, nonce 0) confirms at height 2.
        let mut ledger = funded_ledger();
        seal(&mut ledger, vec![tx("a", "b", 40, 0)], 1_000);
        assert_eq!(ledger.height(), 2);
        assert_eq!(ledger.store().account("a").balance, 60);
        assert_eq!(ledger.store().account("a").nonce, 1);
        assert_eq!(ledger.store().account("b").balance, 40);
    }

    #[test]
    fn overspend_is_skipped_but_block_still_seals() {
        let mut ledger = funded_ledger();
        seal(&mut ledger, vec![tx("a", "b", 40, 0)], 1_000);
        let block = seal(&mut ledger, vec![tx("a", "b", 1_000, 1)], 2_000);
        assert_eq!(ledger.height(), 3);
        assert!(block.transactions.is_empty());
        assert_eq!(ledger.store().account("a").balance, 60);
        assert_eq!(ledger.store().account("b").balance, 40);
        assert_eq!(ledger.store().account("a").nonce, 1);
    }

    #[test]
    fn reject_policy_aborts_the_proposal() {
        let ledger = Ledger::new(&[("a".to_string(), 100)], InvalidTxPolicy::Reject);
        let bad = tx("a", "b", 1_000, 0);
        let err = ledger
            .propose_block("v1", vec![tx("a", "b", 40, 0), bad.clone()], 1_000)
            .unwrap_err();
        assert!(matches!(err, LedgerError::RejectedTransaction { id, .. } if id == bad.id));
        // Nothing committed.
        assert_eq!(ledger.height(), 1);
        assert_eq!(ledger.store().account("a").balance, 100);
    }

    #[test]
    fn stale_nonce_is_dropped_at_inclusion() {
        let mut ledger = funded_ledger();
        seal(&mut ledger, vec![tx("a", "b", 10, 0)], 1_000);
        let block = seal(&mut ledger, vec![tx("a", "b", 10, 0)], 2_000);
        assert!(block.transactions.is_empty());
        assert_eq!(ledger.store().account("a").balance, 90);
    }

    #[test]
    fn append_rejects_wrong_index() {
        let mut ledger = funded_ledger();
        let mut block = ledger.propose_block("v1", Vec::new(), 1_000).expect("propose");
        block.index = 5;
        block.hash = block.compute_hash();
        let err = ledger.append(block).unwrap_err();
        assert_eq!(err, LedgerError::ChainMismatch { expected: 1, got: 5 });
    }

    #[test]
    fn append_rejects_broken_link() {
        let mut ledger = funded_ledger();
        let mut block = ledger.propose_block("v1", Vec::new(), 1_000).expect("propose");
        block.previous_hash = "deadbeef".to_string();
        block.hash = block.compute_hash();
        assert_eq!(ledger.append(block).unwrap_err(), LedgerError::BrokenLink);
    }

    #[test]
    fn append_rejects_tampered_hash() {
        let mut ledger = funded_ledger();
        let mut block = ledger.propose_block("v1", Vec::new(), 1_000).expect("propose");
        block.timestamp_ms += 1;
        assert_eq!(ledger.append(block).unwrap_err(), LedgerError::HashMismatch);
    }

    #[test]
    fn append_rejects_unreproducible_state_root() {
        let mut ledger = funded_ledger();
        let mut block = ledger
            .propose_block("v1", vec![tx("a", "b", 40, 0)], 1_000)
            .expect("propose");
        block.state_root = "f".repeat(64);
        block.hash = block.compute_hash();
        assert_eq!(ledger.append(block).unwrap_err(), LedgerError::StateRootMismatch);
        // The rejected block left no partial state behind.
        assert_eq!(ledger.store().account("a").balance, 100);
        assert_eq!(ledger.height(), 1);
    }

    #[test]
    fn chain_links_and_hashes_hold() {
        let mut ledger = funded_ledger();
        for i in 0..4u64 {
            seal(&mut ledger, vec![tx("a", "b", 1, i)], 1_000 * (i + 1));
        }
        let blocks = ledger.blocks();
        for i in 1..blocks.len() {
            assert_eq!(blocks[i].previous_hash, blocks[i - 1].hash);
            assert_eq!(blocks[i].compute_hash(), blocks[i].hash);
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let build = || {
            let mut ledger = funded_ledger();
            seal(&mut ledger, vec![tx("a", "b", 10, 0), tx("a", "c", 5, 1)], 1_000);
            seal(&mut ledger, vec![tx("b", "c", 3, 0)], 2_000);
            ledger.tip().state_root.clone()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn longer_valid_chain_replaces_local() {
        let mut local = funded_ledger();
        let mut remote = funded_ledger();
        // Local advances to height 3, remote to height 5.
        for i in 0..2u64 {
            seal(&mut local, vec![tx("a", "b", 1, i)], 500 * (i + 1));
        }
        for i in 0..4u64 {
            seal(&mut remote, vec![tx("a", "c", 2, i)], 700 * (i + 1));
        }
        assert_eq!(local.height(), 3);
        assert_eq!(remote.height(), 5);

        local.reconcile(remote.blocks().to_vec()).expect("reconcile");
        assert_eq!(local.height(), 5);
        assert_eq!(local.tip().hash, remote.tip().hash);
        assert_eq!(local.store().account("c").balance, 8);
        assert_eq!(local.store().account("b").balance, 0);
    }

    #[test]
    fn shorter_or_equal_candidate_is_refused() {
        let mut local = funded_ledger();
        seal(&mut local, vec![tx("a", "b", 1, 0)], 500);
        let same = local.blocks().to_vec();
        assert_eq!(local.reconcile(same).unwrap_err(), LedgerError::CandidateNotLonger);
    }

    #[test]
    fn corrupt_candidate_is_refused_and_local_chain_survives() {
        let mut local = funded_ledger();
        let mut remote = funded_ledger();
        seal(&mut local, vec![tx("a", "b", 1, 0)], 500);
        for i in 0..3u64 {
            seal(&mut remote, vec![tx("a", "c", 2, i)], 700 * (i + 1));
        }
        let mut candidate = remote.blocks().to_vec();
        candidate[2].transactions.clear();
        let err = local.reconcile(candidate).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCandidate(_)));
        assert_eq!(local.height(), 2);
        assert_eq!(local.store().account("b").balance, 1);
    }

    #[test]
    fn contract_creation_records_contract_and_moves_value() {
        let mut ledger = funded_ledger();
        let deploy = Transaction::new(
            "a".to_string(),
            None,
            10,
            r#"{"bytecode":"0xfeed","abi":"[]"}"#.to_string(),
            0,
            "00".to_string(),
        );
        seal(&mut ledger, vec![deploy], 1_000);
        let address = contract_address("a", 0);
        let contract = ledger.store().contract(&address).expect("contract exists");
        assert_eq!(contract.bytecode, "0xfeed");
        assert_eq!(contract.abi, "[]");
        assert_eq!(contract.creator, "a");
        assert_eq!(contract.created_at, 1_000);
        assert_eq!(ledger.store().account(&address).balance, 10);
        assert_eq!(ledger.store().account("a").balance, 90);
        assert_eq!(ledger.store().account("a").nonce, 1);
    }
}
