// The single logical owner of the chain-mutating path. Block production and
// inbound peer handling both run on this loop, so a transfer's balance and
// nonce writes never interleave. Readers (HTTP) see a published snapshot
// behind an RwLock and never contend with an in-progress append.

use std::collections::HashSet;
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};

use crate::exec::{ExecError, ExecutionBackend, ExecutionResult};
use crate::ledger::{Ledger, LedgerError};
use crate::mempool::Mempool;
use crate::node::config::NodeSettings;
use crate::node::gossip::{Message, Network, PeerEvent};
use crate::node::storage::{ChainStore, PersistedChain};
use crate::registry::{Validator, ValidatorRegistry};
use crate::state::StateStore;
use crate::types::{valid_signature_shape, Address, Block, Transaction};

/// Read-only view published after every commit for the HTTP façade.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub chain_id: String,
    pub height: u64,
    pub tip_hash: String,
    pub blocks: Vec<Block>,
    pub state: StateStore,
    pub validators: Vec<Validator>,
    pub mempool_size: usize,
}

impl NodeSnapshot {
    pub fn new() -> Self {
        Self {
            chain_id: String::new(),
            height: 0,
            tip_hash: String::new(),
            blocks: Vec::new(),
            state: StateStore::new(),
            validators: Vec::new(),
            mempool_size: 0,
        }
    }
}

impl Default for NodeSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

pub enum NodeCommand {
    SubmitTransaction(Transaction, mpsc::Sender<Result<String, String>>),
    RegisterValidator {
        address: Address,
        stake: u64,
        reply: mpsc::Sender<Result<(), String>>,
    },
    CallContract {
        address: Address,
        method: String,
        args: Vec<String>,
        caller: Address,
        reply: mpsc::Sender<Result<ExecutionResult, String>>,
    },
    /// Explicit reconciliation pull: ask every peer for its full chain.
    SyncWithPeers,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EngineState {
    Idle,
    Producing,
}

pub struct Node {
    settings: NodeSettings,
    keypair: Arc<Keypair>,
    address: Address,
    ledger: Ledger,
    mempool: Mempool,
    registry: ValidatorRegistry,
    backend: Box<dyn ExecutionBackend>,
    state: EngineState,
    last_tick: Instant,
    snapshot: Arc<RwLock<NodeSnapshot>>,
    net: Network,
    store: Option<ChainStore>,
}

impl Node {
    pub fn new(
        settings: NodeSettings,
        keypair: Arc<Keypair>,
        backend: Box<dyn ExecutionBackend>,
        snapshot: Arc<RwLock<NodeSnapshot>>,
        net: Network,
    ) -> Result<Self, String> {
        let address = hex::encode(keypair.public.to_bytes());
        let ledger = Ledger::new(
            &settings.genesis_account_pairs(),
            settings.invalid_tx_policy,
        );

        let mut registry = ValidatorRegistry::new(settings.minimum_stake);
        for seed in &settings.validators {
            registry
                .register(&seed.address, seed.stake)
                .map_err(|e| format!("seed validator {}: {}", seed.address, e))?;
        }

        let store = match &settings.data_dir {
            Some(dir) => Some(ChainStore::new(dir)?),
            None => None,
        };

        let mut node = Self {
            settings,
            keypair,
            address,
            ledger,
            mempool: Mempool::new(),
            registry,
            backend,
            state: EngineState::Idle,
            last_tick: Instant::now(),
            snapshot,
            net,
            store,
        };

        node.restore_from_store()?;
        node.publish_snapshot();
        Ok(node)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn run(mut self, rx_net: mpsc::Receiver<PeerEvent>, rx_cmd: mpsc::Receiver<NodeCommand>) {
        let mut shutdown = false;
        loop {
            while let Ok(event) = rx_net.try_recv() {
                self.handle_peer_message(event);
            }
            while let Ok(cmd) = rx_cmd.try_recv() {
                if self.handle_command(cmd) {
                    shutdown = true;
                }
            }

            if shutdown {
                self.net.shutdown();
                break;
            }

            self.tick_producer();
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn handle_command(&mut self, cmd: NodeCommand) -> bool {
        match cmd {
            NodeCommand::SubmitTransaction(tx, reply) => {
                let _ = reply.send(self.submit_transaction(tx));
            }
            NodeCommand::RegisterValidator {
                address,
                stake,
                reply,
            } => {
                let result = self
                    .registry
                    .register(&address, stake)
                    .map_err(|e| e.to_string());
                if result.is_ok() {
                    tracing::info!(%address, stake, "validator registered");
                    self.publish_snapshot();
                }
                let _ = reply.send(result);
            }
            NodeCommand::CallContract {
                address,
                method,
                args,
                caller,
                reply,
            } => {
                let result = match self.ledger.store().contract(&address) {
                    Some(contract) => self
                        .backend
                        .execute(contract, &method, &args, &caller)
                        .map_err(|e| e.to_string()),
                    None => Err(ExecError::UnknownContract(address).to_string()),
                };
                let _ = reply.send(result);
            }
            NodeCommand::SyncWithPeers => {
                self.net.broadcast(Message::RequestChain);
            }
            NodeCommand::Shutdown => return true,
        }
        false
    }

    /// Client submission path: admit to the mempool and echo to peers.
    fn submit_transaction(&mut self, tx: Transaction) -> Result<String, String> {
        if !valid_signature_shape(&tx.signature) {
            return Err("bad signature shape".to_string());
        }
        let confirmed = self.ledger.store().account(&tx.from).nonce;
        let id = tx.id.clone();
        self.mempool
            .submit(tx.clone(), confirmed)
            .map_err(|e| e.to_string())?;
        self.net
            .broadcast(Message::NewTransaction { transaction: tx });
        self.publish_snapshot();
        Ok(id)
    }

    fn handle_peer_message(&mut self, event: PeerEvent) {
        match event.message {
            Message::NewTransaction { transaction } => {
                self.handle_peer_transaction(transaction);
            }
            Message::NewBlock { block } => {
                self.handle_peer_block(event.peer, block);
            }
            Message::RequestChain => {
                let blocks = self.ledger.blocks().to_vec();
                self.net.send_to(event.peer, Message::Chain { blocks });
            }
            Message::Chain { blocks } => {
                self.handle_candidate_chain(blocks);
            }
            Message::ChainInfo { height, .. } => {
                if self.settings.auto_reconcile && height > self.ledger.height() {
                    tracing::debug!(peer = event.peer, height, "behind peer, pulling chain");
                    self.net.send_to(event.peer, Message::RequestChain);
                }
            }
        }
    }

    /// Idempotent by transaction id; peer-received transactions are not
    /// re-broadcast (the submitting node already fanned them out).
    fn handle_peer_transaction(&mut self, tx: Transaction) {
        if self.mempool.contains(&tx.id) {
            return;
        }
        if !valid_signature_shape(&tx.signature) {
            tracing::debug!(id = %tx.id, "peer transaction with bad signature shape");
            return;
        }
        let confirmed = self.ledger.store().account(&tx.from).nonce;
        match self.mempool.submit(tx, confirmed) {
            Ok(()) => self.publish_snapshot(),
            Err(e) => tracing::debug!(error = %e, "peer transaction refused"),
        }
    }

    fn handle_peer_block(&mut self, peer: u64, block: Block) {
        let expected = self.ledger.height();
        if block.index != expected {
            if self.settings.auto_reconcile && block.index > expected {
                tracing::debug!(
                    peer,
                    got = block.index,
                    expected,
                    "block ahead of local chain, pulling chain"
                );
                self.net.send_to(peer, Message::RequestChain);
            } else {
                tracing::debug!(peer, got = block.index, expected, "dropping off-height block");
            }
            return;
        }

        // Entitlement: the producer must be the rotation leader for this
        // height, and the block must carry its valid signature.
        if let Some(leader) = self.registry.select_leader(block.index) {
            if leader != block.validator {
                tracing::warn!(peer, validator = %block.validator, %leader, "block from wrong leader");
                return;
            }
        }
        if !verify_block_signature(&block) {
            tracing::warn!(peer, index = block.index, "block with invalid producer signature");
            return;
        }

        let validator = block.validator.clone();
        let confirmed: HashSet<String> =
            block.transactions.iter().map(|tx| tx.id.clone()).collect();
        match self.ledger.append(block) {
            Ok(()) => {
                self.registry.record_block(&validator);
                self.mempool.remove_confirmed(&confirmed);
                self.persist();
                self.publish_snapshot();
                tracing::info!(height = self.ledger.height(), %validator, "appended peer block");
            }
            Err(e) => {
                tracing::debug!(peer, error = %e, "rejected peer block");
            }
        }
    }

    fn handle_candidate_chain(&mut self, blocks: Vec<Block>) {
        // Candidate blocks face the same producer checks as gossiped ones:
        // rotation entitlement per height, then the producer signature.
        for block in blocks.iter().skip(1) {
            if let Some(leader) = self.registry.select_leader(block.index) {
                if leader != block.validator {
                    tracing::warn!(
                        index = block.index,
                        validator = %block.validator,
                        "candidate block from outside the rotation"
                    );
                    return;
                }
            }
            if !verify_block_signature(block) {
                tracing::warn!(index = block.index, "candidate block with bad signature");
                return;
            }
        }
        let confirmed: HashSet<String> = blocks
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.id.clone()))
            .collect();
        match self.ledger.reconcile(blocks) {
            Ok(()) => {
                self.mempool.remove_confirmed(&confirmed);
                self.persist();
                self.publish_snapshot();
                tracing::info!(height = self.ledger.height(), "adopted longer peer chain");
            }
            Err(LedgerError::CandidateNotLonger) => {
                tracing::debug!("candidate chain not longer, keeping local");
            }
            Err(e) => {
                tracing::warn!(error = %e, "candidate chain refused");
            }
        }
    }

    /// One consensus timer tick. The tick is consumed whether or not a block
    /// comes out of it: a failed production waits for the next interval
    /// instead of retrying into a fork race.
    fn tick_producer(&mut self) {
        if self.last_tick.elapsed() < Duration::from_millis(self.settings.block_interval_ms) {
            return;
        }
        self.last_tick = Instant::now();

        let height = self.ledger.height();
        let Some(leader) = self.registry.select_leader(height) else {
            // Empty validator set: quiescent, not an error.
            return;
        };
        if leader != self.address {
            return;
        }

        self.state = EngineState::Producing;
        tracing::debug!(state = ?self.state, height, "consensus timer fired");
        self.produce_block(&leader, height);
        self.state = EngineState::Idle;
    }

    fn produce_block(&mut self, leader: &str, height: u64) {
        let drained = self.mempool.drain(self.settings.max_block_txs);
        match self
            .ledger
            .propose_block(leader, drained.clone(), now_ms())
        {
            Ok(mut block) => {
                block.signature = sign_hash(&self.keypair, &block.hash);
                let tx_count = block.transactions.len();
                match self.ledger.append(block.clone()) {
                    Ok(()) => {
                        self.registry.record_block(leader);
                        self.persist();
                        self.publish_snapshot();
                        self.net.broadcast(Message::NewBlock { block });
                        self.net.broadcast(Message::ChainInfo {
                            height: self.ledger.height(),
                            tip_hash: self.ledger.tip().hash.clone(),
                        });
                        tracing::info!(height, tx_count, "sealed block");
                    }
                    Err(e) => {
                        tracing::warn!(height, error = %e, "sealed block failed to append");
                        self.mempool.requeue(drained);
                    }
                }
            }
            Err(LedgerError::RejectedTransaction { id, reason }) => {
                // Reject policy: drop the offender, give the rest back, wait
                // for the next tick.
                tracing::warn!(%id, %reason, "proposal aborted by invalid transaction");
                let rest: Vec<Transaction> =
                    drained.into_iter().filter(|tx| tx.id != id).collect();
                self.mempool.requeue(rest);
            }
            Err(e) => {
                tracing::warn!(height, error = %e, "block production failed");
                self.mempool.requeue(drained);
            }
        }
    }

    fn restore_from_store(&mut self) -> Result<(), String> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(persisted) = store.load()? else {
            return Ok(());
        };
        if persisted.chain_id != self.settings.chain_id {
            return Err(format!(
                "snapshot belongs to chain {}, expected {}",
                persisted.chain_id, self.settings.chain_id
            ));
        }
        if !persisted.validators.is_empty() {
            self.registry.restore(persisted.validators);
        }
        if persisted.blocks.len() > 1 {
            self.ledger
                .reconcile(persisted.blocks)
                .map_err(|e| format!("snapshot revalidation: {}", e))?;
        }
        tracing::info!(height = self.ledger.height(), "restored chain from snapshot");
        Ok(())
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = PersistedChain {
            chain_id: self.settings.chain_id.clone(),
            blocks: self.ledger.blocks().to_vec(),
            validators: self.registry.validators().to_vec(),
        };
        if let Err(e) = store.save(&snapshot) {
            tracing::warn!(error = %e, "snapshot save failed");
        }
    }

    fn publish_snapshot(&self) {
        if let Ok(mut snap) = self.snapshot.write() {
            snap.chain_id = self.settings.chain_id.clone();
            snap.height = self.ledger.height();
            snap.tip_hash = self.ledger.tip().hash.clone();
            snap.blocks = self.ledger.blocks().to_vec();
            snap.state = self.ledger.store().clone();
            snap.validators = self.registry.validators().to_vec();
            snap.mempool_size = self.mempool.len();
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

fn sign_hash(keypair: &Keypair, hash: &str) -> String {
    hex::encode(keypair.sign(hash.as_bytes()).to_bytes())
}

/// The validator address is the producer's hex public key, so the signature
/// checks out from the block alone. Genesis (empty validator) is exempt.
pub fn verify_block_signature(block: &Block) -> bool {
    if block.index == 0 {
        return true;
    }
    let Ok(pk_bytes) = hex::decode(&block.validator) else {
        return false;
    };
    let Ok(pk) = PublicKey::from_bytes(&pk_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(&block.signature) else {
        return false;
    };
    if sig_bytes.len() != 64 {
        return false;
    }
    let mut arr = [0u8; 64];
    arr.copy_from_slice(&sig_bytes);
    let Ok(sig) = Signature::from_bytes(&arr) else {
        return false;
    };
    pk.verify(block.hash.as_bytes(), &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SecretKey;

    fn keypair_from_seed(seed: u8) -> Keypair {
        let secret = SecretKey::from_bytes(&[seed; 32]).expect("secret");
        let public: PublicKey = (&secret).into();
        Keypair { secret, public }
    }

    fn signed_block(keypair: &Keypair) -> Block {
        let mut block = Block {
            index: 1,
            timestamp_ms: 1_000,
            transactions: Vec::new(),
            state_root: "root".to_string(),
            previous_hash: "prev".to_string(),
            validator: hex::encode(keypair.public.to_bytes()),
            signature: String::new(),
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block.signature = sign_hash(keypair, &block.hash);
        block
    }

    #[test]
    fn producer_signature_verifies() {
        let keypair = keypair_from_seed(7);
        let block = signed_block(&keypair);
        assert!(verify_block_signature(&block));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let keypair = keypair_from_seed(7);
        let other = keypair_from_seed(8);
        let mut block = signed_block(&keypair);
        block.signature = sign_hash(&other, &block.hash);
        assert!(!verify_block_signature(&block));

        let mut garbage = signed_block(&keypair);
        garbage.signature = "zz".to_string();
        assert!(!verify_block_signature(&garbage));
    }

    #[test]
    fn genesis_is_exempt_from_signature_checks() {
        let state = StateStore::new();
        let genesis = Block::genesis(&state);
        assert!(verify_block_signature(&genesis));
    }
}
