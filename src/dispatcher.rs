//! Fan-out of one mining round across backend devices
//!
//! A round issues one backend invocation per device (or a single invocation
//! on a pinned device), waits for every invocation to finish, and reports the
//! lowest-indexed match. Brute-force workers get a freshly randomized
//! extra-nonce tail so concurrent workers search different headers.

use crate::header::Header;
use crate::target::Target;
use crate::worker::{BackendKind, Candidate, ComputeBackend, MineRequest, Params};
use crate::Result;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Round dispatcher over a compute backend
pub struct Dispatcher {
    backend: Arc<dyn ComputeBackend>,
    params: Params,
    device: Option<u32>,
}

impl Dispatcher {
    /// Create a dispatcher; `device` pins every round to one device
    pub fn new(backend: Arc<dyn ComputeBackend>, params: Params, device: Option<u32>) -> Self {
        Self {
            backend,
            params,
            device,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Number of backend invocations per round
    pub fn worker_count(&self) -> u32 {
        match self.device {
            Some(_) => 1,
            None => self.backend.device_count(),
        }
    }

    fn requests(&self, header: &Header, target: &Target) -> Vec<MineRequest> {
        if let Some(device) = self.device {
            debug!(device, "Using device");
            return vec![MineRequest {
                header: header.clone(),
                target: *target,
                params: self.params.for_worker(0),
                device,
            }];
        }

        let randomize = self.backend.kind() == BackendKind::BruteForce;
        let mut rng = rand::rng();

        (0..self.backend.device_count())
            .map(|index| {
                let mut header = header.clone();
                if randomize {
                    header.randomize_extra_nonce(&mut rng);
                }
                MineRequest {
                    header,
                    target: *target,
                    params: self.params.for_worker(index),
                    device: index,
                }
            })
            .collect()
    }

    /// Run one round and return the first matching candidate.
    ///
    /// Every invocation runs to completion before this returns. If any
    /// invocation failed, the first failure is returned instead.
    pub async fn mine(
        &self,
        header: &Header,
        target: &Target,
        cancellation: &CancellationToken,
    ) -> Result<Candidate> {
        let requests = self.requests(header, target);

        let results = join_all(
            requests
                .into_iter()
                .map(|request| self.backend.mine(request, cancellation.child_token())),
        )
        .await;

        let mut winner = None;
        let mut failure = None;

        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(candidate) if candidate.matched => {
                    if winner.is_none() {
                        winner = Some(candidate);
                    }
                }
                Ok(candidate) => {
                    if let Some(share) = candidate.share() {
                        debug!(worker = index, nonce = candidate.nonce, share, "Best share");
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(winner.unwrap_or_else(Candidate::none))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{EXTRA_NONCE_SIZE, HDR_SIZE, RANDOM_NONCE_START, EXTRA_NONCE_START};
    use crate::worker::{CycleParams, MiningStats, NonceParams};
    use crate::Error;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records requests and answers from a script keyed by device
    struct Recording {
        kind: BackendKind,
        devices: u32,
        matches: Vec<u32>,
        fail: Option<u32>,
        seen: Mutex<Vec<MineRequest>>,
    }

    impl Recording {
        fn new(kind: BackendKind, devices: u32) -> Self {
            Self {
                kind,
                devices,
                matches: Vec::new(),
                fail: None,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ComputeBackend for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn device_count(&self) -> u32 {
            self.devices
        }

        async fn mine(
            &self,
            request: MineRequest,
            _cancellation: CancellationToken,
        ) -> Result<Candidate> {
            self.seen.lock().push(request.clone());

            if self.fail == Some(request.device) {
                return Err(Error::backend("recording", "device lost"));
            }

            let nonce = match request.params {
                Params::Nonce(p) => p.nonce,
                Params::Cycle(_) => request.device,
            };

            Ok(Candidate {
                nonce,
                extra_nonce: request.header.extra_nonce(),
                solution: None,
                matched: self.matches.contains(&request.device),
            })
        }

        fn stop(&self, _device: u32) -> bool {
            false
        }

        fn stop_all(&self) {}

        fn stats(&self) -> MiningStats {
            MiningStats::default()
        }
    }

    fn header() -> Header {
        Header::from_slice(&[0u8; HDR_SIZE]).unwrap()
    }

    fn nonce_params(range: u32) -> Params {
        Params::Nonce(NonceParams {
            nonce: 1,
            range,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_all_workers_run_and_first_index_wins() {
        let mut backend = Recording::new(BackendKind::BruteForce, 4);
        backend.matches = vec![3, 1];
        let backend = Arc::new(backend);

        let dispatcher = Dispatcher::new(backend.clone(), nonce_params(100), None);
        let candidate = dispatcher
            .mine(&header(), &Target::max(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(candidate.matched);
        assert_eq!(candidate.nonce, 101);
        assert_eq!(backend.seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_workers_get_partitioned_nonces_and_random_tails() {
        let backend = Arc::new(Recording::new(BackendKind::BruteForce, 3));
        let dispatcher = Dispatcher::new(backend.clone(), nonce_params(1_000), None);

        let candidate = dispatcher
            .mine(&header(), &Target::max(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(candidate, Candidate::none());

        let seen = backend.seen.lock();
        let starts: Vec<_> = seen
            .iter()
            .map(|r| match r.params {
                Params::Nonce(p) => p.nonce,
                Params::Cycle(_) => unreachable!(),
            })
            .collect();
        assert_eq!(starts, vec![1, 1_001, 2_001]);

        let split = RANDOM_NONCE_START - EXTRA_NONCE_START;
        for request in seen.iter() {
            let extra = request.header.extra_nonce();
            assert!(extra[..split].iter().all(|&b| b == 0));
        }
        assert_ne!(seen[0].header.extra_nonce(), seen[1].header.extra_nonce());
    }

    #[tokio::test]
    async fn test_rounds_reuse_starting_nonces() {
        // Partitioning is per round; consecutive rounds restart at the same
        // nonces and only differ by the randomized extra nonce.
        let backend = Arc::new(Recording::new(BackendKind::BruteForce, 2));
        let dispatcher = Dispatcher::new(backend.clone(), nonce_params(10), None);
        let cancellation = CancellationToken::new();

        dispatcher.mine(&header(), &Target::max(), &cancellation).await.unwrap();
        dispatcher.mine(&header(), &Target::max(), &cancellation).await.unwrap();

        let seen = backend.seen.lock();
        assert_eq!(seen[0].params, seen[2].params);
        assert_eq!(seen[1].params, seen[3].params);
    }

    #[tokio::test]
    async fn test_pinned_device() {
        let mut backend = Recording::new(BackendKind::BruteForce, 4);
        backend.matches = vec![2];
        let backend = Arc::new(backend);

        let dispatcher = Dispatcher::new(backend.clone(), nonce_params(50), Some(2));
        assert_eq!(dispatcher.worker_count(), 1);

        let candidate = dispatcher
            .mine(&header(), &Target::max(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(candidate.matched);
        assert_eq!(candidate.nonce, 1);
        let seen = backend.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].device, 2);
        assert_eq!(seen[0].header.extra_nonce(), [0u8; EXTRA_NONCE_SIZE]);
    }

    #[tokio::test]
    async fn test_cycle_workers_keep_header() {
        let backend = Arc::new(Recording::new(BackendKind::Cycle, 2));
        let params = Params::Cycle(CycleParams { threads: 1, trims: 2 });
        let dispatcher = Dispatcher::new(backend.clone(), params, None);

        dispatcher
            .mine(&header(), &Target::max(), &CancellationToken::new())
            .await
            .unwrap();

        for request in backend.seen.lock().iter() {
            assert_eq!(request.header, header());
            assert_eq!(request.params, params);
        }
    }

    #[tokio::test]
    async fn test_failure_propagates_after_all_complete() {
        let mut backend = Recording::new(BackendKind::BruteForce, 3);
        backend.matches = vec![0];
        backend.fail = Some(1);
        let backend = Arc::new(backend);

        let dispatcher = Dispatcher::new(backend.clone(), nonce_params(1), None);
        let result = dispatcher
            .mine(&header(), &Target::max(), &CancellationToken::new())
            .await;

        assert_matches!(result, Err(Error::Backend { .. }));
        assert_eq!(backend.seen.lock().len(), 3);
    }
}
