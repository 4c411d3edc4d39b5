//! RoadChain core: a proof-of-stake replicated ledger. Hash-chained blocks,
//! an account/nonce state machine, a FIFO mempool, round-robin leader
//! rotation, and longest-valid-chain reconciliation over peer gossip.

pub mod exec;
pub mod ledger;
pub mod mempool;
pub mod node;
pub mod registry;
pub mod state;
pub mod types;
