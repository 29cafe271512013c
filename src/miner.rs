//! Polling, job replacement and the mining loop
//!
//! The [`Orchestrator`] owns two tasks: a poll timer that asks the work source
//! for new work, and a mining loop that dispatches rounds over the current
//! job. The current job lives in a single slot that is replaced by value;
//! each job carries a cancellation token that fires when it is superseded.

use crate::client::WorkSource;
use crate::crypto::pow_hash;
use crate::dispatcher::Dispatcher;
use crate::types::{Hash, Job, Network};
use crate::utils::{format_hash_rate, unix_time_secs};
use crate::worker::Block;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Rounds between "Mining height" lines
const LOG_EVERY: u64 = 100;

/// Back-off after a failed round
const ROUND_ERROR_DELAY: Duration = Duration::from_millis(500);

/// Identity sent while no job is installed
const IDLE_IDENTITY: Hash = [0u8; 32];

/// Whether the mining loop is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Mining,
}

/// Result of one poll tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The work source had nothing new
    NoWork,
    /// Work with the current identity; discarded
    Unchanged,
    /// A new job was installed
    NewJob,
}

/// Submission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Submissions {
    pub submitted: u64,
    pub accepted: u64,
}

/// Mining control plane. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    network: Network,
    poll_interval: Duration,
    source: Arc<dyn WorkSource>,
    dispatcher: Dispatcher,
    job: RwLock<Option<Arc<Job>>>,
    /// Server time minus local time, in seconds
    offset: AtomicI64,
    mining: AtomicBool,
    mining_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    fatal: Mutex<Option<Error>>,
    submitted: AtomicU64,
    accepted: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        network: Network,
        poll_interval: Duration,
        source: Arc<dyn WorkSource>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                network,
                poll_interval,
                source,
                dispatcher,
                job: RwLock::new(None),
                offset: AtomicI64::new(0),
                mining: AtomicBool::new(false),
                mining_task: Mutex::new(None),
                shutdown: CancellationToken::new(),
                fatal: Mutex::new(None),
                submitted: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
            }),
        }
    }

    pub fn network(&self) -> Network {
        self.inner.network
    }

    pub fn state(&self) -> State {
        if self.inner.mining.load(Ordering::SeqCst) {
            State::Mining
        } else {
            State::Idle
        }
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.inner.job.read().clone()
    }

    fn current_identity(&self) -> Option<Hash> {
        self.inner.job.read().as_ref().map(|job| *job.identity())
    }

    /// Last observed server time offset in seconds
    pub fn offset(&self) -> i64 {
        self.inner.offset.load(Ordering::SeqCst)
    }

    /// Local clock adjusted to the server's
    pub fn now(&self) -> u64 {
        let now = unix_time_secs() as i64 + self.offset();
        now.max(0) as u64
    }

    pub fn submissions(&self) -> Submissions {
        Submissions {
            submitted: self.inner.submitted.load(Ordering::SeqCst),
            accepted: self.inner.accepted.load(Ordering::SeqCst),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Ask the work source for work and install it if it is new.
    ///
    /// Validation failures are returned without touching any state.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let identity = self.current_identity().unwrap_or(IDLE_IDENTITY);

        let response = match self.inner.source.get_work(&identity).await? {
            Some(response) => response,
            None => return Ok(TickOutcome::NoWork),
        };

        let work = response.validate(self.inner.network)?;

        let job = {
            let mut slot = self.inner.job.write();
            if slot
                .as_ref()
                .is_some_and(|job| *job.identity() == work.identity())
            {
                return Ok(TickOutcome::Unchanged);
            }

            self.update_offset(work.time);

            // Rounds still registered belong to the outgoing job; the loop
            // cannot read the new one until the slot lock is released.
            self.inner.dispatcher.backend().stop_all();

            let job = Arc::new(Job::new(work, self.inner.shutdown.child_token()));
            if let Some(previous) = slot.replace(Arc::clone(&job)) {
                previous.cancellation().cancel();
            }
            job
        };

        info!(
            height = job.height,
            identity = %hex::encode(job.identity()),
            "New job"
        );
        info!(
            target_hex = %job.target,
            bits = job.target.to_bits(),
            difficulty = job.target.difficulty(),
            "New target"
        );
        debug!("{}", job.header.to_json());

        self.start_mining();
        Ok(TickOutcome::NewJob)
    }

    fn update_offset(&self, server_time: u32) {
        let offset = server_time as i64 - unix_time_secs() as i64;
        let previous = self.inner.offset.swap(offset, Ordering::SeqCst);
        if previous != offset {
            info!(offset, "Time offset");
        }
    }

    /// Run one tick, containing non-fatal errors.
    ///
    /// A fatal error is stored and shuts the orchestrator down; [`run`]
    /// returns it.
    ///
    /// [`run`]: Orchestrator::run
    pub async fn poll(&self) {
        match self.tick().await {
            Ok(outcome) => debug!(?outcome, "Poll"),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Fatal error");
                self.fail(e);
            }
            Err(e) => warn!(category = e.category(), error = %e, "Poll failed"),
        }
    }

    fn fail(&self, e: Error) {
        {
            let mut fatal = self.inner.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(e);
            }
        }
        self.stop();
    }

    /// Poll until stopped or a fatal error occurs
    pub async fn run(&self) -> Result<()> {
        info!(
            network = %self.inner.network,
            poll_interval = ?self.inner.poll_interval,
            workers = self.inner.dispatcher.worker_count(),
            "Starting miner"
        );

        let mut timer = interval(self.inner.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = timer.tick() => self.poll().await,
            }
        }

        self.stop();
        let handle = self.inner.mining_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Mining loop panicked");
            }
        }

        let submissions = self.submissions();
        info!(
            submitted = submissions.submitted,
            accepted = submissions.accepted,
            "Miner stopped"
        );

        match self.inner.fatal.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop polling and mining
    pub fn stop(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Stopping miner");
        }
        self.inner.shutdown.cancel();
        self.inner.dispatcher.backend().stop_all();
    }

    fn start_mining(&self) {
        if self.inner.shutdown.is_cancelled() || self.inner.mining.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.mining_loop().await;
            this.inner.mining.store(false, Ordering::SeqCst);
        });
        *self.inner.mining_task.lock() = Some(handle);
    }

    async fn mining_loop(&self) {
        let Some(mut job) = self.current_job() else {
            return;
        };

        // Private copy of the job header; advance() keeps moving it between
        // rounds until the job changes.
        let mut identity = *job.identity();
        let mut header = job.header.clone();
        let mut iterations: u64 = 0;

        while !self.inner.shutdown.is_cancelled() {
            if let Some(current) = self.current_job() {
                job = current;
            }

            if *job.identity() != identity {
                identity = *job.identity();
                header = job.header.clone();
            }

            header.advance(self.now(), self.inner.network);

            if iterations % LOG_EVERY == 0 {
                let stats = self.inner.dispatcher.backend().stats();
                info!(
                    height = job.height,
                    hash_rate = %format_hash_rate(stats.hash_rate),
                    "Mining height"
                );
            }
            iterations += 1;

            let candidate = match self
                .inner
                .dispatcher
                .mine(&header, &job.target, job.cancellation())
                .await
            {
                Ok(candidate) => candidate,
                Err(e) => {
                    error!(category = e.category(), error = %e, "Mining round failed");
                    self.pause(ROUND_ERROR_DELAY).await;
                    continue;
                }
            };

            if !candidate.matched {
                continue;
            }

            if job.is_superseded() || self.current_identity() != Some(identity) {
                info!("New job. Switching.");
                continue;
            }

            let block = candidate.finalize(&header);
            info!(
                nonce = candidate.nonce,
                height = job.height,
                "Found valid nonce"
            );
            self.submit(&block).await;

            if self.current_identity() != Some(identity) {
                info!("New job. Switching.");
                continue;
            }

            self.poll().await;
        }

        debug!("Mining loop finished");
    }

    async fn submit(&self, block: &Block) {
        self.inner.submitted.fetch_add(1, Ordering::SeqCst);
        let hash = hex::encode(pow_hash(&block.header));
        debug!("Submitting work: {}", block.header.to_json());

        match self.inner.source.submit_work(&block.raw).await {
            Ok(result) if result.accepted => {
                self.inner.accepted.fetch_add(1, Ordering::SeqCst);
                info!(hash = %hash, "Block accepted");
            }
            Ok(result) => {
                warn!(hash = %hash, "Invalid block submitted");
                warn!(reason = %result.reason, "Reason");
            }
            Err(e) => error!(hash = %hash, error = %e, "Submission failed"),
        }
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.inner.shutdown.cancelled() => {}
        }
    }
}

