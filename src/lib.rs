//! Handshake Mining Client
//!
//! An async mining client for Handshake nodes supporting:
//! - Work polling and submission over the node's JSON-RPC interface
//! - Multi-threaded CPU mining
//! - External cycle-finding solvers
//! - Compact target arithmetic and header codecs

pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod header;
pub mod miner;
pub mod target;
pub mod types;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use header::Header;
pub use miner::Orchestrator;
pub use target::Target;
pub use types::*;

/// Application information
pub const APP_NAME: &str = "hs-mining-client";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
