//! CPU brute-force backend
//!
//! Each device is one blocking thread grinding the header nonce over
//! `[nonce, nonce + range)`. The search checks its cancellation token between
//! batches, so a stopped job returns within one batch.

use super::{
    mining_span, BackendKind, Candidate, ComputeBackend, DeviceJobs, MineRequest, MiningStats,
    Params,
};
use crate::crypto::PowHasher;
use crate::header::Header;
use crate::target::Target;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// Nonces hashed between cancellation checks
const BATCH_SIZE: u64 = 4_096;

/// CPU mining backend
pub struct CpuBackend {
    devices: u32,
    jobs: DeviceJobs,
    stats: Arc<CpuMiningStats>,
}

/// Thread-safe counters for the CPU backend
#[derive(Debug)]
struct CpuMiningStats {
    total_hashes: AtomicU64,
    solutions_found: AtomicU64,
    start_time: Instant,
}

impl CpuMiningStats {
    fn new() -> Self {
        Self {
            total_hashes: AtomicU64::new(0),
            solutions_found: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn to_mining_stats(&self) -> MiningStats {
        let total_hashes = self.total_hashes.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed().as_secs_f64();

        MiningStats {
            total_hashes,
            solutions_found: self.solutions_found.load(Ordering::Relaxed),
            hash_rate: if elapsed > 0.0 {
                total_hashes as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

impl CpuBackend {
    /// Create a CPU backend; `devices == 0` uses one device per core
    pub fn new(devices: u32) -> Self {
        let devices = if devices == 0 {
            num_cpus::get() as u32
        } else {
            devices
        };

        info!("Creating CPU backend with {} devices", devices);

        Self {
            devices,
            jobs: DeviceJobs::new(),
            stats: Arc::new(CpuMiningStats::new()),
        }
    }
}

/// Grind nonces until a match, exhaustion or cancellation
fn grind(
    header: &Header,
    target: &Target,
    start: u32,
    range: u32,
    cancellation: &CancellationToken,
    stats: &CpuMiningStats,
) -> Candidate {
    let mut hasher = PowHasher::new(header);
    let count = if range == 0 {
        1u64 << 32
    } else {
        range as u64
    };
    let end = (start as u64 + count).min(1u64 << 32);

    let mut nonce = start as u64;
    while nonce < end {
        if cancellation.is_cancelled() {
            debug!(nonce, "CPU job stopped");
            break;
        }

        let batch_end = (nonce + BATCH_SIZE).min(end);
        for n in nonce..batch_end {
            let hash = hasher.hash_nonce(n as u32);
            if target.is_met_by(&hash) {
                stats
                    .total_hashes
                    .fetch_add(n - nonce + 1, Ordering::Relaxed);
                stats.solutions_found.fetch_add(1, Ordering::Relaxed);
                return Candidate {
                    nonce: n as u32,
                    extra_nonce: header.extra_nonce(),
                    solution: None,
                    matched: true,
                };
            }
        }

        stats
            .total_hashes
            .fetch_add(batch_end - nonce, Ordering::Relaxed);
        nonce = batch_end;
    }

    Candidate {
        extra_nonce: header.extra_nonce(),
        ..Candidate::none()
    }
}

#[async_trait]
impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::BruteForce
    }

    fn device_count(&self) -> u32 {
        self.devices
    }

    async fn mine(
        &self,
        request: MineRequest,
        cancellation: CancellationToken,
    ) -> Result<Candidate> {
        let span = mining_span(self.name(), request.device);

        if request.device >= self.devices {
            return Err(Error::NoDevice {
                device: request.device,
            });
        }

        let params = match request.params {
            Params::Nonce(params) => params,
            Params::Cycle(_) => {
                return Err(Error::backend("cpu", "cycle parameters are not supported"))
            }
        };

        let job = self.jobs.begin(request.device, &cancellation)?;
        let token = job.token().clone();
        let stats = Arc::clone(&self.stats);
        let MineRequest { header, target, .. } = request;

        let started = Instant::now();
        let candidate = task::spawn_blocking(move || {
            grind(&header, &target, params.nonce, params.range, &token, &stats)
        })
        .instrument(span.clone())
        .await
        .map_err(|e| Error::backend("cpu", format!("mining task failed: {}", e)))?;

        drop(job);

        span.in_scope(|| {
            debug!(
                matched = candidate.matched,
                nonce = candidate.nonce,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "CPU pass finished"
            )
        });

        Ok(candidate)
    }

    fn stop(&self, device: u32) -> bool {
        self.jobs.stop(device)
    }

    fn stop_all(&self) {
        self.jobs.stop_all();
    }

    fn stats(&self) -> MiningStats {
        self.stats.to_mining_stats()
    }
}
