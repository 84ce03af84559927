// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job worker: runs a dispatched job against the transport and reports the
//! result back into the registry.
//!
//! Whatever happens, the job's dispatch lock is released when `run` returns,
//! freeing the shard slot for the next sweep, unless another job for the
//! same resource has taken the lock over. Transport calls go through a
//! circuit breaker; a rejected call counts as a failed attempt.
//!
//! ```text
//! sync    ──► transport.sync ──► ok:  mark_synced(targets, generation)
//!                             └► err: mark_failed (retry_count += 1, backoff)
//! verify  ──► transport.checksum ─► compare with the primary's checksum
//!                                 └► err: retry_count += 1, stays pending
//! remove  ──► transport.remove
//! ```
//!
//! Failed attempts of every kind are also counted per worker
//! ([`SyncWorker::failure_counts`]); removals have no row to record them on.

use crate::circuit_breaker::{CircuitError, TransportCircuit, TransportCircuitMetrics};
use crate::dispatch::{Dispatcher, JobKind, SyncJob};
use crate::error::{ReplicationError, Result};
use crate::external::{ExternalError, ResourceRouter, Transport};
use crate::registry::RegistryStore;
use crate::resilience::RetryConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of running one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Sync succeeded.
    Synced,
    /// Sync failed; the row is `failed` with this many attempts.
    Failed { retry_count: u32, error: String },
    /// Verification ran. A mismatch forces a resync.
    Verified { matches: bool },
    /// The primary has no checksum yet; the row stays `verification_pending`.
    VerificationDeferred,
    /// The local checksum could not be computed. The row stays
    /// `verification_pending` with this many failed attempts.
    CheckFailed { retry_count: u32, error: String },
    Removed,
    /// Removal failed. The row is already gone, so nothing retries it.
    RemoveFailed { error: String },
    /// The registry row disappeared while the job ran.
    Discarded,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Synced => "synced",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::Verified { matches: true } => "verified",
            JobOutcome::Verified { matches: false } => "mismatch",
            JobOutcome::VerificationDeferred => "deferred",
            JobOutcome::CheckFailed { .. } => "check_failed",
            JobOutcome::Removed => "removed",
            JobOutcome::RemoveFailed { .. } => "remove_failed",
            JobOutcome::Discarded => "discarded",
        }
    }
}

/// Failed job attempts since the worker started, by job kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobFailureCounts {
    pub sync: u64,
    pub verify: u64,
    pub remove: u64,
}

#[derive(Default)]
struct FailureCounters {
    sync: AtomicU64,
    verify: AtomicU64,
    remove: AtomicU64,
}

impl FailureCounters {
    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Failed { .. } => &self.sync,
            JobOutcome::CheckFailed { .. } => &self.verify,
            JobOutcome::RemoveFailed { .. } => &self.remove,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> JobFailureCounts {
        JobFailureCounts {
            sync: self.sync.load(Ordering::Relaxed),
            verify: self.verify.load(Ordering::Relaxed),
            remove: self.remove.load(Ordering::Relaxed),
        }
    }
}

/// Executes jobs taken from the job processor.
pub struct SyncWorker {
    registry: RegistryStore,
    dispatcher: Arc<Dispatcher>,
    router: Arc<dyn ResourceRouter>,
    transport: Arc<dyn Transport>,
    circuit: TransportCircuit,
    retry: RetryConfig,
    failures: FailureCounters,
}

impl SyncWorker {
    pub fn new(
        registry: RegistryStore,
        dispatcher: Arc<Dispatcher>,
        router: Arc<dyn ResourceRouter>,
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            router,
            transport,
            circuit: TransportCircuit::new(),
            retry,
            failures: FailureCounters::default(),
        }
    }

    /// Replace the transport breakers.
    pub fn with_circuit(mut self, circuit: TransportCircuit) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn circuit_metrics(&self) -> TransportCircuitMetrics {
        self.circuit.metrics()
    }

    pub fn failure_counts(&self) -> JobFailureCounts {
        self.failures.snapshot()
    }

    /// Whether either transport breaker is probably open.
    pub fn circuit_open(&self) -> bool {
        self.circuit.any_open()
    }

    /// Run `job` and record its result.
    ///
    /// Transport failures are recorded on the row, not returned. Errors are
    /// registry failures only.
    pub async fn run(&self, job: SyncJob) -> Result<JobOutcome> {
        let key = job.key;
        let kind = job.kind;
        let lock = job.clone();
        let result = match kind {
            JobKind::Sync => self.run_sync(job).await,
            JobKind::Verify => self.run_verify(job).await,
            JobKind::Remove => Ok(self.run_remove(job).await),
        };
        // Leaves the lock alone if another job took it over meanwhile.
        self.dispatcher.release_job(&lock).await;

        match &result {
            Ok(outcome) => {
                self.failures.record(outcome);
                crate::metrics::record_job_completed(kind.as_str(), outcome.as_str());
                debug!(resource = %key, kind = kind.as_str(), outcome = outcome.as_str(), "Job finished");
            }
            Err(e) => {
                crate::metrics::record_job_completed(kind.as_str(), "error");
                warn!(resource = %key, kind = kind.as_str(), error = %e, "Job result could not be recorded");
            }
        }
        result
    }

    async fn run_sync(&self, mut job: SyncJob) -> Result<JobOutcome> {
        if let Some(path) = self.dispatcher.current_target(job.key).await {
            job.target_path = path;
        }
        let key = job.key;
        let targets = job.targets;
        let generation = job.generation;

        let transport = self.transport.clone();
        let attempt = self
            .circuit
            .transfers
            .call(|| async move { transport.sync(job).await })
            .await;

        match attempt {
            Ok(()) => {
                let row = self
                    .registry
                    .update(key, |r| {
                        r.mark_synced(targets, generation);
                        Ok(())
                    })
                    .await?;
                Ok(match row {
                    Some(_) => JobOutcome::Synced,
                    None => JobOutcome::Discarded,
                })
            }
            Err(e) => {
                let error = describe(e);
                let retry = &self.retry;
                let row = self
                    .registry
                    .update(key, |r| {
                        r.mark_failed(&error, retry);
                        Ok(())
                    })
                    .await?;
                match row {
                    Some(row) => {
                        info!(resource = %key, retry_count = row.retry_count, error = %error, "Sync failed");
                        Ok(JobOutcome::Failed {
                            retry_count: row.retry_count,
                            error,
                        })
                    }
                    None => Ok(JobOutcome::Discarded),
                }
            }
        }
    }

    async fn run_verify(&self, job: SyncJob) -> Result<JobOutcome> {
        let key = job.key;
        let route = self
            .router
            .route(key)
            .await
            .map_err(|e| ReplicationError::external("router.route", e.to_string()))?;
        let Some(primary) = route.and_then(|r| r.primary_checksum) else {
            debug!(resource = %key, "Primary checksum not available yet");
            return Ok(JobOutcome::VerificationDeferred);
        };

        let transport = self.transport.clone();
        let local = match self
            .circuit
            .checks
            .call(|| async move { transport.checksum(job).await })
            .await
        {
            Ok(local) => local,
            Err(e) => {
                let error = describe(e);
                warn!(resource = %key, error = %error, "Checksum failed, verification left pending");
                let row = self
                    .registry
                    .update(key, |r| {
                        r.verification_attempt_failed(&error);
                        Ok(())
                    })
                    .await?;
                return Ok(match row {
                    Some(row) => JobOutcome::CheckFailed {
                        retry_count: row.retry_count,
                        error,
                    },
                    None => JobOutcome::Discarded,
                });
            }
        };

        let matches = local.as_deref() == Some(primary.as_str());
        let row = self
            .registry
            .update(key, |r| {
                r.verification_result(local.clone(), matches);
                Ok(())
            })
            .await?;
        if row.is_none() {
            return Ok(JobOutcome::Discarded);
        }
        if !matches {
            info!(resource = %key, "Checksum mismatch, resync requested");
        }
        Ok(JobOutcome::Verified { matches })
    }

    async fn run_remove(&self, job: SyncJob) -> JobOutcome {
        let key = job.key;
        let transport = self.transport.clone();
        match self
            .circuit
            .transfers
            .call(|| async move { transport.remove(job).await })
            .await
        {
            Ok(()) => JobOutcome::Removed,
            Err(e) => {
                let error = describe(e);
                warn!(resource = %key, error = %error, "Failed to remove local copy");
                JobOutcome::RemoveFailed { error }
            }
        }
    }
}

fn describe(err: CircuitError<ExternalError>) -> String {
    match err {
        CircuitError::Rejected => "transport circuit open".to_string(),
        CircuitError::Inner(e) => e.to_string(),
    }
}
