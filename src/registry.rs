// Staked addresses eligible to produce blocks, in registration order.
// Leader selection is plain round-robin so any node holding the same set can
// independently verify who was entitled to produce a given height.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Address;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub stake: u64,
    pub active: bool,
    pub blocks_produced: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("stake {got} is below the minimum {minimum}")]
    StakeTooLow { got: u64, minimum: u64 },
}

#[derive(Debug)]
pub struct ValidatorRegistry {
    validators: Vec<Validator>,
    minimum_stake: u64,
}

impl ValidatorRegistry {
    pub fn new(minimum_stake: u64) -> Self {
        Self {
            validators: Vec::new(),
            minimum_stake,
        }
    }

    /// Registering an already-known address refreshes its stake in place and
    /// keeps its rotation slot.
    pub fn register(&mut self, address: &str, stake: u64) -> Result<(), RegistryError> {
        if stake < self.minimum_stake {
            return Err(RegistryError::StakeTooLow {
                got: stake,
                minimum: self.minimum_stake,
            });
        }
        if let Some(existing) = self.validators.iter_mut().find(|v| v.address == address) {
            existing.stake = stake;
            existing.active = true;
            return Ok(());
        }
        self.validators.push(Validator {
            address: address.to_string(),
            stake,
            active: true,
            blocks_produced: 0,
        });
        Ok(())
    }

    /// Deterministic round-robin over active validators: `height mod len`.
    /// `None` when the set is empty; an empty set is quiescent, not an error.
    pub fn select_leader(&self, height: u64) -> Option<Address> {
        let active: Vec<&Validator> = self.validators.iter().filter(|v| v.active).collect();
        if active.is_empty() {
            return None;
        }
        let idx = (height % active.len() as u64) as usize;
        Some(active[idx].address.clone())
    }

    pub fn record_block(&mut self, address: &str) {
        if let Some(v) = self.validators.iter_mut().find(|v| v.address == address) {
            v.blocks_produced += 1;
        }
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Wholesale replacement when restoring a persisted snapshot.
    pub fn restore(&mut self, validators: Vec<Validator>) {
        self.validators = validators;
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_stake_is_rejected() {
        let mut reg = ValidatorRegistry::new(1000);
        let err = reg.register("v1", 999).unwrap_err();
        assert_eq!(err, RegistryError::StakeTooLow { got: 999, minimum: 1000 });
        assert!(reg.is_empty());
    }

    #[test]
    fn rotation_is_deterministic() {
        let mut reg = ValidatorRegistry::new(100);
        reg.register("v1", 100).expect("register");
        reg.register("v2", 100).expect("register");
        reg.register("v3", 100).expect("register");

        assert_eq!(reg.select_leader(0).as_deref(), Some("v1"));
        assert_eq!(reg.select_leader(1).as_deref(), Some("v2"));
        assert_eq!(reg.select_leader(2).as_deref(), Some("v3"));
        assert_eq!(reg.select_leader(3).as_deref(), Some("v1"));

        // Independent replica with the same set picks the same leader.
        let mut other = ValidatorRegistry::new(100);
        other.register("v1", 100).expect("register");
        other.register("v2", 100).expect("register");
        other.register("v3", 100).expect("register");
        for height in 0..12 {
            assert_eq!(reg.select_leader(height), other.select_leader(height));
        }
    }

    #[test]
    fn empty_set_selects_nobody() {
        let reg = ValidatorRegistry::new(100);
        assert_eq!(reg.select_leader(7), None);
    }

    #[test]
    fn reregistration_refreshes_stake_in_place() {
        let mut reg = ValidatorRegistry::new(100);
        reg.register("v1", 100).expect("register");
        reg.register("v2", 100).expect("register");
        reg.register("v1", 500).expect("refresh");
        assert_eq!(reg.validators().len(), 2);
        assert_eq!(reg.validators()[0].stake, 500);
        assert_eq!(reg.select_leader(0).as_deref(), Some("v1"));
    }

    #[test]
    fn blocks_produced_counter() {
        let mut reg = ValidatorRegistry::new(100);
        reg.register("v1", 100).expect("register");
        reg.record_block("v1");
        reg.record_block("v1");
        reg.record_block("ghost");
        assert_eq!(reg.validators()[0].blocks_produced, 2);
    }
}
