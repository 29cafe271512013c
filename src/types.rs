//! Core types shared by the work source, dispatcher and orchestrator

use crate::header::Header;
use crate::target::Target;
use crate::{Error, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// 32-byte hash as carried in headers
pub type Hash = [u8; 32];

/// Chain the miner connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Testnet,
    Regtest,
    Simnet,
}

impl Network {
    /// Whether `advance` may roll the header time forward on this network.
    ///
    /// Other networks only ever grind the extra nonce.
    pub fn rolls_time(&self) -> bool {
        matches!(self, Network::Main | Network::Regtest)
    }

    /// Default node RPC port
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Main => 12037,
            Network::Testnet => 13037,
            Network::Regtest => 14037,
            Network::Simnet => 15037,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
            Network::Simnet => "simnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "main" => Ok(Network::Main),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            "simnet" => Ok(Network::Simnet),
            other => Err(Error::config(format!("Unknown network: {}", other))),
        }
    }
}

/// Validated `getwork` result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    pub header: Header,
    pub target: Target,
    pub height: u32,
    pub time: u32,
}

impl Work {
    /// Identity commitment of this work
    pub fn identity(&self) -> Hash {
        self.header.mask_hash()
    }
}

/// Installed mining job.
///
/// Jobs are never mutated after installation; the orchestrator replaces the
/// whole value when new work arrives and cancels the old job's token.
#[derive(Debug)]
pub struct Job {
    pub header: Header,
    pub target: Target,
    pub height: u32,
    pub time: u32,
    identity: Hash,
    cancellation: CancellationToken,
}

impl Job {
    pub fn new(work: Work, cancellation: CancellationToken) -> Self {
        let identity = work.identity();
        Self {
            header: work.header,
            target: work.target,
            height: work.height,
            time: work.time,
            identity,
            cancellation,
        }
    }

    pub fn identity(&self) -> &Hash {
        &self.identity
    }

    /// Token cancelled once this job is superseded or the miner stops
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_superseded(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
