//! External solver backend for cycle-finding miners
//!
//! Each invocation spawns the configured solver once per device. The solver
//! reads two lines on stdin (header hex, target hex) and prints either nothing
//! (no cycle found) or `<nonce> <solution-hex>`. Search parameters and the
//! device index are passed through the environment.

use super::{
    mining_span, BackendKind, Candidate, ComputeBackend, DeviceJobs, MineRequest, MiningStats,
    Params,
};
use crate::crypto::proof_hash;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// External solver backend
pub struct ExternalBackend {
    command: String,
    args: Vec<String>,
    devices: u32,
    timeout: Duration,
    jobs: DeviceJobs,
    stats: Mutex<MiningStats>,
}

impl ExternalBackend {
    /// Create a backend running `command args...` per device
    pub fn new(command: String, args: Vec<String>, devices: u32, timeout: Duration) -> Self {
        info!(
            "Creating external backend with command: {} {:?}",
            command, args
        );

        Self {
            command,
            args,
            devices,
            timeout,
            jobs: DeviceJobs::new(),
            stats: Mutex::new(MiningStats::default()),
        }
    }

    fn environment(params: &Params, device: u32) -> Vec<(&'static str, String)> {
        let mut env = vec![("HS_DEVICE", device.to_string())];
        match params {
            Params::Cycle(p) => {
                env.push(("HS_THREADS", p.threads.to_string()));
                env.push(("HS_TRIMS", p.trims.to_string()));
            }
            Params::Nonce(p) => {
                env.push(("HS_NONCE", p.nonce.to_string()));
                env.push(("HS_RANGE", p.range.to_string()));
                env.push(("HS_GRIDS", p.grids.to_string()));
                env.push(("HS_BLOCKS", p.blocks.to_string()));
                env.push(("HS_THREADS", p.threads.to_string()));
            }
        }
        env
    }

    /// Run the solver to completion
    async fn execute(&self, request: &MineRequest) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(Self::environment(&request.params, request.device))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::backend("external", format!("failed to spawn solver: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = format!("{}\n{}\n", request.header.to_hex(), request.target.to_hex());
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| Error::backend("external", format!("failed to write stdin: {}", e)))?;
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::timeout("external solver"))?
            .map_err(|e| Error::backend("external", format!("solver failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::backend(
                "external",
                format!(
                    "solver exited with code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        Ok(output.stdout)
    }
}

/// Parse solver output into `(nonce, solution)`
pub fn parse_output(stdout: &[u8]) -> Result<Option<(u32, Vec<u8>)>> {
    let text = String::from_utf8_lossy(stdout);
    let line = text.trim();

    if line.is_empty() {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (nonce, solution) = match (parts.next(), parts.next(), parts.next()) {
        (Some(nonce), Some(solution), None) => (nonce, solution),
        _ => {
            return Err(Error::backend(
                "external",
                format!("expected `<nonce> <solution-hex>`, got {:?}", line),
            ))
        }
    };

    let nonce = nonce
        .parse::<u32>()
        .map_err(|e| Error::backend("external", format!("invalid nonce {:?}: {}", nonce, e)))?;
    let solution = hex::decode(solution)
        .map_err(|e| Error::backend("external", format!("invalid solution hex: {}", e)))?;

    if solution.is_empty() || solution.len() % 4 != 0 || solution.len() / 4 > u8::MAX as usize {
        return Err(Error::backend(
            "external",
            format!("solution of {} bytes is not a valid cycle", solution.len()),
        ));
    }

    Ok(Some((nonce, solution)))
}

#[async_trait]
impl ComputeBackend for ExternalBackend {
    fn name(&self) -> &'static str {
        "external"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cycle
    }

    fn device_count(&self) -> u32 {
        self.devices
    }

    async fn mine(
        &self,
        request: MineRequest,
        cancellation: CancellationToken,
    ) -> Result<Candidate> {
        if request.device >= self.devices {
            return Err(Error::NoDevice {
                device: request.device,
            });
        }

        let job = self.jobs.begin(request.device, &cancellation)?;
        let span = mining_span(self.name(), request.device);

        let stdout = tokio::select! {
            result = self.execute(&request).instrument(span.clone()) => result?,
            _ = job.token().cancelled() => {
                debug!(device = request.device, "External solver stopped");
                return Ok(Candidate::none());
            }
        };

        let extra_nonce = request.header.extra_nonce();
        let candidate = match parse_output(&stdout)? {
            None => Candidate {
                extra_nonce,
                ..Candidate::none()
            },
            Some((nonce, solution)) => {
                let matched = request.target.is_met_by(&proof_hash(&solution));
                Candidate {
                    nonce,
                    extra_nonce,
                    solution: Some(solution),
                    matched,
                }
            }
        };

        let mut stats = self.stats.lock();
        stats.total_hashes += 1;
        if candidate.matched {
            stats.solutions_found += 1;
        } else if candidate.solution.is_some() {
            warn!(
                device = request.device,
                "Solver returned a cycle above the target"
            );
        }

        Ok(candidate)
    }

    fn stop(&self, device: u32) -> bool {
        self.jobs.stop(device)
    }

    fn stop_all(&self) {
        self.jobs.stop_all();
    }

    fn stats(&self) -> MiningStats {
        self.stats.lock().clone()
    }
}
