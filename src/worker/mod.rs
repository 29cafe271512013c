//! Compute backends
//!
//! A backend takes a header, a target and backend-specific search parameters
//! and reports a candidate for one device. Nonce-grinding backends search a
//! nonce range; cycle-finding backends return a proof whose hash may or may
//! not meet the target.

use crate::config::{BackendType, Config};
use crate::crypto::proof_hash;
use crate::header::{finalize_cycle, ExtraNonce, Header, EXTRA_NONCE_SIZE};
use crate::target::{to_share, Target};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Span;

pub mod cpu;
pub mod external;

pub use cpu::CpuBackend;
pub use external::ExternalBackend;

/// Search strategy of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Grinds the 32-bit nonce over a header
    BruteForce,
    /// Finds a cycle proof for a header
    Cycle,
}

/// Parameters for nonce-grinding backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NonceParams {
    /// First nonce to try
    pub nonce: u32,
    /// Number of nonces per round; 0 searches the whole space
    pub range: u32,
    /// GPU launch geometry, ignored by the CPU backend
    pub grids: u32,
    pub blocks: u32,
    pub threads: u32,
}

/// Parameters for cycle-finding backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleParams {
    pub threads: u32,
    pub trims: u32,
}

/// Backend-specific search parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Params {
    Nonce(NonceParams),
    Cycle(CycleParams),
}

impl Params {
    /// Parameters for dispatcher worker `index`.
    ///
    /// Nonce workers start `index * range` past the base nonce. Nothing else
    /// keeps workers apart; with `range == 0` every worker starts at the base.
    pub fn for_worker(&self, index: u32) -> Params {
        match *self {
            Params::Nonce(p) => Params::Nonce(NonceParams {
                nonce: p.nonce.wrapping_add(index.wrapping_mul(p.range)),
                ..p
            }),
            Params::Cycle(p) => Params::Cycle(p),
        }
    }
}

/// One backend invocation
#[derive(Debug, Clone)]
pub struct MineRequest {
    pub header: Header,
    pub target: Target,
    pub params: Params,
    pub device: u32,
}

/// Result of one backend invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub nonce: u32,
    /// Extra nonce of the header the backend searched
    pub extra_nonce: ExtraNonce,
    /// Cycle proof, if the backend found one
    pub solution: Option<Vec<u8>>,
    /// Whether the candidate meets the target
    pub matched: bool,
}

impl Candidate {
    /// Nothing found in this pass
    pub fn none() -> Self {
        Self {
            nonce: 0,
            extra_nonce: [0u8; EXTRA_NONCE_SIZE],
            solution: None,
            matched: false,
        }
    }

    /// Difficulty of the proof, for cycle candidates
    pub fn share(&self) -> Option<f64> {
        self.solution.as_deref().map(|s| to_share(&proof_hash(s)))
    }

    /// Build the block to submit from the header this candidate was found on
    pub fn finalize(&self, header: &Header) -> Block {
        let header = header.finalize(self.nonce, &self.extra_nonce);
        let raw = match &self.solution {
            Some(solution) => finalize_cycle(header.as_bytes(), self.nonce, solution),
            None => header.as_bytes().to_vec(),
        };
        Block { header, raw }
    }
}

/// Finalized block ready for `submitwork`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub raw: Vec<u8>,
}

/// Mining statistics for a backend
#[derive(Debug, Clone, Default)]
pub struct MiningStats {
    /// Total hashes computed
    pub total_hashes: u64,
    /// Number of matching candidates found
    pub solutions_found: u64,
    /// Hashes per second since the backend was created
    pub hash_rate: f64,
}

/// Compute backend trait
///
/// `mine` must return promptly once its cancellation token fires, reporting
/// no match. `stop` and `stop_all` are advisory and never fail.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    fn kind(&self) -> BackendKind;

    /// Number of devices the dispatcher fans out to
    fn device_count(&self) -> u32;

    /// Search one device for a candidate
    async fn mine(&self, request: MineRequest, cancellation: CancellationToken)
        -> Result<Candidate>;

    /// Stop the job on one device; returns whether a job was running
    fn stop(&self, device: u32) -> bool;

    /// Stop every running job
    fn stop_all(&self);

    fn stats(&self) -> MiningStats {
        MiningStats::default()
    }
}

/// Per-device job registry shared by the backends.
///
/// A device runs at most one job at a time; each job gets its own child
/// token so it can be stopped without touching the caller's token.
#[derive(Debug, Default, Clone)]
pub struct DeviceJobs {
    jobs: Arc<DashMap<u32, CancellationToken>>,
}

impl DeviceJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job on `device`
    pub fn begin(&self, device: u32, parent: &CancellationToken) -> Result<DeviceJob> {
        match self.jobs.entry(device) {
            Entry::Occupied(_) => Err(Error::JobInProgress { device }),
            Entry::Vacant(slot) => {
                let token = parent.child_token();
                slot.insert(token.clone());
                Ok(DeviceJob {
                    jobs: Arc::clone(&self.jobs),
                    device,
                    token,
                })
            }
        }
    }

    pub fn stop(&self, device: u32) -> bool {
        match self.jobs.get(&device) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for entry in self.jobs.iter() {
            entry.value().cancel();
        }
    }

    pub fn running(&self) -> usize {
        self.jobs.len()
    }
}

/// Registration of a running job; unregisters on drop
#[derive(Debug)]
pub struct DeviceJob {
    jobs: Arc<DashMap<u32, CancellationToken>>,
    device: u32,
    token: CancellationToken,
}

impl DeviceJob {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for DeviceJob {
    fn drop(&mut self) {
        self.jobs.remove(&self.device);
    }
}

/// Build the backend selected in the configuration
pub fn create_backend(config: &Config) -> Result<Arc<dyn ComputeBackend>> {
    match config.backend {
        BackendType::Cpu => Ok(Arc::new(CpuBackend::new(config.device_count))),
        BackendType::External => {
            let command = config
                .external_command
                .clone()
                .ok_or_else(|| Error::config("external backend requires --external-command"))?;
            Ok(Arc::new(ExternalBackend::new(
                command,
                config.external_args.clone(),
                config.device_count.max(1),
                Duration::from_secs(config.external_timeout),
            )))
        }
    }
}

/// Create a tracing span for one backend invocation
pub fn mining_span(backend: &str, device: u32) -> Span {
    tracing::info_span!("mine", backend = backend, device = device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HDR_SIZE;
    use assert_matches::assert_matches;

    #[test]
    fn test_nonce_partitioning() {
        let params = Params::Nonce(NonceParams {
            nonce: 10,
            range: 1_000,
            ..Default::default()
        });

        assert_matches!(params.for_worker(0), Params::Nonce(p) if p.nonce == 10);
        assert_matches!(params.for_worker(3), Params::Nonce(p) if p.nonce == 3_010 && p.range == 1_000);
    }

    #[test]
    fn test_full_range_workers_overlap() {
        // Only the extra nonce randomization keeps these apart
        let params = Params::Nonce(NonceParams {
            nonce: 0,
            range: 0,
            ..Default::default()
        });
        assert_eq!(params.for_worker(0), params.for_worker(7));
    }

    #[test]
    fn test_partition_wraps() {
        let params = Params::Nonce(NonceParams {
            nonce: u32::MAX,
            range: 0x8000_0000,
            ..Default::default()
        });
        assert_matches!(params.for_worker(2), Params::Nonce(p) if p.nonce == u32::MAX);
    }

    #[test]
    fn test_cycle_params_are_shared() {
        let params = Params::Cycle(CycleParams { threads: 4, trims: 256 });
        assert_eq!(params.for_worker(5), params);
    }

    #[test]
    fn test_finalize_nonce_candidate() {
        let header = Header::from_slice(&[0u8; HDR_SIZE]).unwrap();
        let candidate = Candidate {
            nonce: 9,
            extra_nonce: [1u8; EXTRA_NONCE_SIZE],
            solution: None,
            matched: true,
        };

        let block = candidate.finalize(&header);
        assert_eq!(block.raw.len(), HDR_SIZE);
        assert_eq!(block.header.nonce(), 9);
        assert_eq!(block.header.extra_nonce(), [1u8; EXTRA_NONCE_SIZE]);
        assert_eq!(&block.raw[..], &block.header.as_bytes()[..]);
    }

    #[test]
    fn test_finalize_cycle_candidate() {
        let header = Header::from_slice(&[0u8; HDR_SIZE]).unwrap();
        let candidate = Candidate {
            nonce: 3,
            extra_nonce: [0u8; EXTRA_NONCE_SIZE],
            solution: Some(vec![0xab; 16]),
            matched: false,
        };

        let block = candidate.finalize(&header);
        assert_eq!(block.raw.len(), HDR_SIZE + 1 + 16);
        assert_eq!(block.raw[HDR_SIZE], 4);
        assert!(candidate.share().is_some());
        assert!(Candidate::none().share().is_none());
    }

    #[test]
    fn test_create_backend() {
        use clap::Parser;

        let config = Config::try_parse_from(["hs-mining-client", "-c", "3"]).unwrap();
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.name(), "cpu");
        assert_eq!(backend.device_count(), 3);

        let config = Config::try_parse_from([
            "hs-mining-client",
            "-b",
            "external",
            "--external-command",
            "solver",
        ])
        .unwrap();
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.kind(), BackendKind::Cycle);
        assert_eq!(backend.device_count(), 1);

        let config = Config::try_parse_from(["hs-mining-client", "-b", "external"]).unwrap();
        assert!(matches!(create_backend(&config), Err(Error::Config { .. })));
    }

    #[test]
    fn test_device_jobs() {
        let jobs = DeviceJobs::new();
        let parent = CancellationToken::new();

        let job = jobs.begin(0, &parent).unwrap();
        assert_matches!(jobs.begin(0, &parent), Err(Error::JobInProgress { device: 0 }));
        assert_eq!(jobs.running(), 1);

        assert!(jobs.stop(0));
        assert!(job.token().is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!jobs.stop(1));

        drop(job);
        assert_eq!(jobs.running(), 0);
        assert!(jobs.begin(0, &parent).is_ok());
    }

    #[test]
    fn test_stop_all_without_jobs() {
        let jobs = DeviceJobs::new();
        jobs.stop_all();
        assert_eq!(jobs.running(), 0);
    }

    #[test]
    fn test_parent_cancellation_reaches_jobs() {
        let jobs = DeviceJobs::new();
        let parent = CancellationToken::new();
        let a = jobs.begin(0, &parent).unwrap();
        let b = jobs.begin(1, &parent).unwrap();

        parent.cancel();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }
}
