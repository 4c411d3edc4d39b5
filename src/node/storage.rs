// Chain persistence: one JSON snapshot of the chain and validator set,
// written atomically (tmp + rename) after every commit. The node revalidates
// the stored chain from genesis before trusting it on restart.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::Validator;
use crate::types::Block;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedChain {
    pub chain_id: String,
    pub blocks: Vec<Block>,
    pub validators: Vec<Validator>,
}

pub struct ChainStore {
    path: PathBuf,
}

impl ChainStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, String> {
        fs::create_dir_all(&data_dir).map_err(|e| format!("{}", e))?;
        Ok(Self {
            path: data_dir.as_ref().join("chain_snapshot.json"),
        })
    }

    pub fn load(&self) -> Result<Option<PersistedChain>, String> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path).map_err(|e| format!("{}", e))?;
        let snap =
            serde_json::from_slice::<PersistedChain>(&data).map_err(|e| format!("{}", e))?;
        Ok(Some(snap))
    }

    pub fn save(&self, snapshot: &PersistedChain) -> Result<(), String> {
        let data = serde_json::to_vec_pretty(snapshot).map_err(|e| format!("{}", e))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).map_err(|e| format!("{}", e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| format!("{}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InvalidTxPolicy, Ledger};
    use crate::types::Transaction;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "roadchain-store-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let dir = temp_dir("missing");
        let store = ChainStore::new(&dir).expect("store");
        assert!(store.load().expect("load").is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn snapshot_round_trip_revalidates() {
        let dir = temp_dir("roundtrip");
        let store = ChainStore::new(&dir).expect("store");

        let mut ledger = Ledger::new(&[("a".to_string(), 50)], InvalidTxPolicy::Skip);
        let tx = Transaction::new(
            "a".to_string(),
            Some("b".to_string()),
            5,
            String::new(),
            0,
            "00".to_string(),
        );
        let block = ledger.propose_block("v1", vec![tx], 1_000).expect("propose");
        ledger.append(block).expect("append");

        store
            .save(&PersistedChain {
                chain_id: "road-test".to_string(),
                blocks: ledger.blocks().to_vec(),
                validators: Vec::new(),
            })
            .expect("save");

        let loaded = store.load().expect("load").expect("some");
        assert_eq!(loaded.chain_id, "road-test");
        assert_eq!(loaded.blocks.len(), 2);

        // A fresh ledger with the same genesis accepts the stored chain.
        let mut fresh = Ledger::new(&[("a".to_string(), 50)], InvalidTxPolicy::Skip);
        fresh.reconcile(loaded.blocks).expect("revalidate");
        assert_eq!(fresh.height(), 2);
        assert_eq!(fresh.store().account("b").balance, 5);

        let _ = fs::remove_dir_all(&dir);
    }
}
