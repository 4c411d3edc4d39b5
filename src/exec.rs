// Capability boundary for contract execution. The ledger stores opaque
// bytecode and routes calls; all storage semantics live behind this trait so
// a real VM can be swapped in without touching chain correctness.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::Contract;
use crate::types::Address;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("unknown contract {0}")]
    UnknownContract(Address),
    #[error("execution failed: {0}")]
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
}

pub trait ExecutionBackend: Send {
    fn execute(
        &self,
        contract: &Contract,
        method: &str,
        args: &[String],
        caller: &Address,
    ) -> Result<ExecutionResult, ExecError>;
}

/// Default backend: no VM. Echoes the call descriptor so the routing path is
/// exercised end to end.
pub struct NullBackend;

impl ExecutionBackend for NullBackend {
    fn execute(
        &self,
        contract: &Contract,
        method: &str,
        args: &[String],
        caller: &Address,
    ) -> Result<ExecutionResult, ExecError> {
        Ok(ExecutionResult {
            success: true,
            output: format!(
                "{}::{}({}) from {}",
                contract.address,
                method,
                args.join(","),
                caller
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_backend_echoes_the_call() {
        let contract = Contract {
            address: "rc1abc".into(),
            bytecode: "code".into(),
            abi: "[]".into(),
            creator: "a".into(),
            created_at: 0,
            storage: Default::default(),
        };
        let result = NullBackend
            .execute(&contract, "ping", &["1".into(), "2".into()], &"caller".into())
            .expect("execute");
        assert!(result.success);
        assert_eq!(result.output, "rc1abc::ping(1,2) from caller");
    }
}
