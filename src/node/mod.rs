//! Node plumbing: configuration, the single-owner event loop, peer gossip,
//! the HTTP façade, and chain persistence.

pub mod config;
pub mod engine;
pub mod gossip;
pub mod http;
pub mod storage;
