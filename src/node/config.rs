// JSON node settings. Every node in a network must agree on the genesis
// accounts and the seeded validator list, or leader verification and
// reconciliation will never line up.

use serde::{Deserialize, Serialize};

use crate::ledger::InvalidTxPolicy;
use crate::types::Address;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    pub chain_id: String,
    /// Peer gossip listener.
    pub listen_addr: String,
    /// Client HTTP façade.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Peer gossip addresses to dial at startup.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,
    #[serde(default = "default_max_block_txs")]
    pub max_block_txs: usize,
    #[serde(default = "default_minimum_stake")]
    pub minimum_stake: u64,
    #[serde(default)]
    pub invalid_tx_policy: InvalidTxPolicy,
    /// When set, a wrong-height inbound block answers the peer with a
    /// `request-chain` instead of being silently dropped.
    #[serde(default)]
    pub auto_reconcile: bool,
    /// Snapshot directory; `None` runs memory-only.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Validators seeded at boot, in rotation order.
    #[serde(default)]
    pub validators: Vec<ValidatorSeed>,
    /// Balances funded at genesis.
    #[serde(default)]
    pub genesis_accounts: Vec<GenesisAccount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorSeed {
    /// Hex ed25519 public key; doubles as the on-chain address so peers can
    /// check block signatures from the validator field alone.
    pub address: Address,
    #[serde(default = "default_minimum_stake")]
    pub stake: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,
    pub balance: u64,
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_block_interval_ms() -> u64 {
    5_000
}

fn default_max_block_txs() -> usize {
    100
}

fn default_minimum_stake() -> u64 {
    1_000
}

impl NodeSettings {
    pub fn genesis_account_pairs(&self) -> Vec<(Address, u64)> {
        self.genesis_accounts
            .iter()
            .map(|a| (a.address.clone(), a.balance))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let json = r#"{"chain_id":"road-test","listen_addr":"127.0.0.1:9000"}"#;
        let settings: NodeSettings = serde_json::from_str(json).expect("parse");
        assert_eq!(settings.block_interval_ms, 5_000);
        assert_eq!(settings.max_block_txs, 100);
        assert_eq!(settings.minimum_stake, 1_000);
        assert_eq!(settings.invalid_tx_policy, InvalidTxPolicy::Skip);
        assert!(!settings.auto_reconcile);
        assert!(settings.peers.is_empty());
        assert!(settings.data_dir.is_none());
    }

    #[test]
    fn policy_parses_from_lowercase() {
        let json = r#"{
            "chain_id": "road-test",
            "listen_addr": "127.0.0.1:9000",
            "invalid_tx_policy": "reject",
            "auto_reconcile": true,
            "validators": [{"address": "aa", "stake": 5000}],
            "genesis_accounts": [{"address": "alice", "balance": 100}]
        }"#;
        let settings: NodeSettings = serde_json::from_str(json).expect("parse");
        assert_eq!(settings.invalid_tx_policy, InvalidTxPolicy::Reject);
        assert!(settings.auto_reconcile);
        assert_eq!(settings.validators[0].stake, 5_000);
        assert_eq!(settings.genesis_account_pairs(), vec![("alice".to_string(), 100)]);
    }
}
