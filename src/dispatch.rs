// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job dispatch with per-resource locks and per-shard ceilings.
//!
//! Every job goes through [`Dispatcher`]. Before a job is handed to the
//! external [`JobQueue`] the dispatcher takes a short-lived lock on the
//! resource and a slot on its shard:
//!
//! ```text
//! reserve(key, shard) ──► AlreadyInFlight   (no-op, someone else has it)
//!        │           └──► AtCapacity        (no-op, next sweep retries)
//!        ▼
//!   registry claim: → started ──► AlreadyInFlight  (another process won)
//!        │
//!   commit(job) ──► enqueue ──► worker runs ──► release(key)
//! ```
//!
//! Locks expire after `lock_ttl`, so a job the processor lost frees its slot
//! eventually. After a restart [`Dispatcher::rebuild`] restores locks and shard
//! counts from the processor's own view of what is in flight.

use crate::error::{ReplicationError, Result};
use crate::external::{JobId, JobQueue};
use crate::registry::{Claim, RegistryRecord, RegistryStore, ResourceKey, ResyncFlags, SubResource};
use chrono::{DateTime, Utc};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a job asks the transport to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Pull the flagged sub-resources.
    Sync,
    /// Compute the local checksum and compare it with the primary's.
    Verify,
    /// Delete the local copy.
    Remove,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Verify => "verify",
            JobKind::Remove => "remove",
        }
    }
}

/// A unit of work for the external job processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub kind: JobKind,
    pub key: ResourceKey,
    pub shard: String,
    /// Disk path at dispatch time. A rename while the job is queued updates
    /// the dispatcher's copy; workers read it through
    /// [`Dispatcher::current_target`].
    pub target_path: String,
    /// Sub-resources this job covers.
    pub targets: ResyncFlags,
    /// The row's `resync_generation` at dispatch.
    pub generation: i64,
    /// Why the job was dispatched (event kind or sweep), for logs.
    pub reason: String,
}

/// Result of trying to take a dispatch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Acquired,
    AlreadyInFlight,
    AtCapacity,
}

/// Result of a scheduling attempt. Only `Dispatched` enqueued anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched(JobId),
    AlreadyInFlight,
    AtCapacity,
    /// The row changed under us (deleted, or no longer schedulable).
    Skipped,
}

impl DispatchOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, DispatchOutcome::Dispatched(_))
    }

    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Dispatched(_) => "dispatched",
            DispatchOutcome::AlreadyInFlight => "already_in_flight",
            DispatchOutcome::AtCapacity => "at_capacity",
            DispatchOutcome::Skipped => "skipped",
        }
    }
}

/// Per-shard dispatch slots held by this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardLock {
    pub shard_name: String,
    pub node_id: String,
    pub in_flight_count: usize,
}

#[derive(Debug)]
struct InFlight {
    shard: String,
    /// Current disk path; may be updated by a rename before or after commit.
    target_path: Option<String>,
    job: Option<SyncJob>,
    expires_at: Instant,
}

/// Dispatches jobs at most once per resource at a time.
pub struct Dispatcher {
    node_id: String,
    queue: Arc<dyn JobQueue>,
    lock_ttl: Duration,
    in_flight: Mutex<HashMap<ResourceKey, InFlight>>,
}

impl Dispatcher {
    pub fn new(node_id: impl Into<String>, queue: Arc<dyn JobQueue>, lock_ttl: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            queue,
            lock_ttl,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// `started` rows last written before this have outlived any lock.
    pub fn stale_before(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.lock_ttl).ok()?;
        Utc::now().checked_sub_signed(ttl)
    }

    fn purge_expired(map: &mut HashMap<ResourceKey, InFlight>) {
        let now = Instant::now();
        map.retain(|key, entry| {
            let live = entry.expires_at > now;
            if !live {
                warn!(resource = %key, shard = %entry.shard, "Dispatch lock expired");
            }
            live
        });
    }

    fn count_on(map: &HashMap<ResourceKey, InFlight>, shard: &str) -> usize {
        map.values().filter(|e| e.shard == shard).count()
    }

    /// Take the resource lock and a slot on `shard`.
    pub async fn reserve(&self, key: ResourceKey, shard: &str, max_concurrency: usize) -> Reservation {
        let mut map = self.in_flight.lock().await;
        Self::purge_expired(&mut map);

        if map.contains_key(&key) {
            return Reservation::AlreadyInFlight;
        }
        let count = Self::count_on(&map, shard);
        if count >= max_concurrency {
            return Reservation::AtCapacity;
        }

        map.insert(
            key,
            InFlight {
                shard: shard.to_string(),
                target_path: None,
                job: None,
                expires_at: Instant::now() + self.lock_ttl,
            },
        );
        crate::metrics::set_shard_in_flight(shard, count + 1);
        Reservation::Acquired
    }

    /// Hand a reserved job to the processor.
    ///
    /// On failure the reservation is released.
    pub async fn commit(&self, mut job: SyncJob) -> Result<JobId> {
        {
            let map = self.in_flight.lock().await;
            if let Some(path) = map.get(&job.key).and_then(|e| e.target_path.clone()) {
                job.target_path = path;
            }
        }

        match self.queue.enqueue(job.clone()).await {
            Ok(job_id) => {
                let mut map = self.in_flight.lock().await;
                let entry = map.entry(job.key).or_insert_with(|| InFlight {
                    shard: job.shard.clone(),
                    target_path: None,
                    job: None,
                    expires_at: Instant::now(),
                });
                entry.expires_at = Instant::now() + self.lock_ttl;
                entry.target_path.get_or_insert_with(|| job.target_path.clone());
                debug!(
                    resource = %job.key,
                    shard = %job.shard,
                    job_id = %job_id,
                    kind = job.kind.as_str(),
                    reason = %job.reason,
                    "Job enqueued"
                );
                crate::metrics::record_job_dispatched(job.kind.as_str(), &job.shard);
                entry.job = Some(job);
                Ok(job_id)
            }
            Err(e) => {
                self.release(job.key).await;
                Err(ReplicationError::Dispatch {
                    resource: job.key.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Drop the lock on `key`. Returns whether one was held.
    pub async fn release(&self, key: ResourceKey) -> bool {
        let mut map = self.in_flight.lock().await;
        match map.remove(&key) {
            Some(entry) => {
                crate::metrics::set_shard_in_flight(&entry.shard, Self::count_on(&map, &entry.shard));
                true
            }
            None => false,
        }
    }

    /// Drop the lock on `job.key` if it still belongs to `job`.
    ///
    /// A lock taken over by another job (a removal replacing a sync, or a
    /// reclaim after expiry with a newer generation) is left in place.
    pub async fn release_job(&self, job: &SyncJob) -> bool {
        let mut map = self.in_flight.lock().await;
        let owned = map
            .get(&job.key)
            .and_then(|e| e.job.as_ref())
            .is_some_and(|held| held.kind == job.kind && held.generation == job.generation);
        if !owned {
            debug!(resource = %job.key, kind = job.kind.as_str(), "Lock belongs to another job, kept");
            return false;
        }
        match map.remove(&job.key) {
            Some(entry) => {
                crate::metrics::set_shard_in_flight(&entry.shard, Self::count_on(&map, &entry.shard));
                true
            }
            None => false,
        }
    }

    /// Point an in-flight job at a new disk path. Returns whether a job
    /// was in flight.
    pub async fn retarget(&self, key: ResourceKey, new_path: &str) -> bool {
        let mut map = self.in_flight.lock().await;
        match map.get_mut(&key) {
            Some(entry) => {
                entry.target_path = Some(new_path.to_string());
                if let Some(job) = entry.job.as_mut() {
                    job.target_path = new_path.to_string();
                }
                debug!(resource = %key, path = new_path, "Retargeted in-flight job");
                true
            }
            None => false,
        }
    }

    /// Disk path the in-flight job for `key` should write to.
    pub async fn current_target(&self, key: ResourceKey) -> Option<String> {
        self.in_flight
            .lock()
            .await
            .get(&key)
            .and_then(|e| e.target_path.clone())
    }

    pub async fn is_in_flight(&self, key: ResourceKey) -> bool {
        let mut map = self.in_flight.lock().await;
        Self::purge_expired(&mut map);
        map.contains_key(&key)
    }

    pub async fn in_flight_count(&self, shard: &str) -> usize {
        let mut map = self.in_flight.lock().await;
        Self::purge_expired(&mut map);
        Self::count_on(&map, shard)
    }

    /// Slots held per shard, sorted by shard name.
    pub async fn shard_locks(&self) -> Vec<ShardLock> {
        let mut map = self.in_flight.lock().await;
        Self::purge_expired(&mut map);

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in map.values() {
            *counts.entry(entry.shard.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(shard, n)| ShardLock {
                shard_name: shard.to_string(),
                node_id: self.node_id.clone(),
                in_flight_count: n,
            })
            .collect()
    }

    /// Replace all locks with the processor's in-flight jobs.
    pub async fn rebuild(&self) -> Result<usize> {
        let jobs = self
            .queue
            .in_flight()
            .await
            .map_err(|e| ReplicationError::external("job_queue.in_flight", e.to_string()))?;

        let mut map = self.in_flight.lock().await;
        map.clear();
        let expires_at = Instant::now() + self.lock_ttl;
        for job in jobs {
            map.insert(
                job.key,
                InFlight {
                    shard: job.shard.clone(),
                    target_path: Some(job.target_path.clone()),
                    job: Some(job),
                    expires_at,
                },
            );
        }

        let mut shards: BTreeMap<String, usize> = BTreeMap::new();
        for entry in map.values() {
            *shards.entry(entry.shard.clone()).or_default() += 1;
        }
        for (shard, count) in &shards {
            crate::metrics::set_shard_in_flight(shard, *count);
        }

        if !map.is_empty() {
            info!(node_id = %self.node_id, jobs = map.len(), "Rebuilt dispatch locks from job processor");
        }
        Ok(map.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scheduling
    // ═══════════════════════════════════════════════════════════════════════

    /// Move a row to `started` and enqueue a sync job for it.
    ///
    /// No-op when the resource is already in flight or the shard is full.
    /// If the processor refuses the job the row is marked `failed` and the
    /// error returned.
    pub async fn schedule_sync(
        &self,
        registry: &RegistryStore,
        record: &RegistryRecord,
        max_concurrency: usize,
        reason: &str,
        retry: &RetryConfig,
    ) -> Result<DispatchOutcome> {
        let key = record.key;
        match self.reserve(key, &record.shard, max_concurrency).await {
            Reservation::Acquired => {}
            Reservation::AlreadyInFlight => return Ok(skipped(DispatchOutcome::AlreadyInFlight)),
            Reservation::AtCapacity => return Ok(skipped(DispatchOutcome::AtCapacity)),
        }

        let started = match self.start_row(registry, record).await {
            Ok(Claim::Won(started)) => started,
            Ok(Claim::Lost) => {
                self.release(key).await;
                return Ok(skipped(DispatchOutcome::AlreadyInFlight));
            }
            Ok(Claim::Gone) => {
                self.release(key).await;
                return Ok(skipped(DispatchOutcome::Skipped));
            }
            Err(e) => {
                self.release(key).await;
                return Err(e);
            }
        };

        let targets = if started.resync.any() {
            started.resync
        } else {
            ResyncFlags::all()
        };
        let job = SyncJob {
            kind: JobKind::Sync,
            key,
            shard: started.shard.clone(),
            target_path: started.path.clone(),
            targets,
            generation: started.resync_generation,
            reason: reason.to_string(),
        };

        match self.commit(job).await {
            Ok(job_id) => Ok(DispatchOutcome::Dispatched(job_id)),
            Err(e) => {
                let message = e.to_string();
                registry
                    .update(key, |r| {
                        r.mark_failed(&message, retry);
                        Ok(())
                    })
                    .await?;
                Err(e)
            }
        }
    }

    /// Claim `record` in the registry by moving it into `started`.
    ///
    /// The local lock only covers this process. Across processes the claim
    /// is the compare-and-set on `record.lock_version`: whoever writes first
    /// wins, everyone else sees [`Claim::Lost`]. A row already `started`
    /// can only be reclaimed once it is older than the lock TTL.
    async fn start_row(&self, registry: &RegistryStore, record: &RegistryRecord) -> Result<Claim> {
        use crate::registry::SyncState;

        if record.state == SyncState::Started {
            let stale = matches!(self.stale_before(), Some(cutoff) if record.updated_at < cutoff);
            if !stale {
                return Ok(Claim::Lost);
            }
        }

        let claim = registry
            .claim(record, |r| {
                if !r.state.can_transition_to(SyncState::Started) {
                    if !r.state.can_transition_to(SyncState::Pending) {
                        return Err(ReplicationError::InvalidTransition {
                            resource: r.key.to_string(),
                            from: r.state.to_string(),
                            to: SyncState::Pending.to_string(),
                        });
                    }
                    r.mark_pending();
                }
                r.mark_started()
            })
            .await;
        match claim {
            Err(ReplicationError::InvalidTransition { .. }) => Ok(Claim::Gone),
            other => other,
        }
    }

    /// Enqueue a verification job. The row stays `verification_pending`
    /// until the worker reports back.
    pub async fn schedule_verification(
        &self,
        record: &RegistryRecord,
        max_concurrency: usize,
        reason: &str,
    ) -> Result<DispatchOutcome> {
        match self.reserve(record.key, &record.shard, max_concurrency).await {
            Reservation::Acquired => {}
            Reservation::AlreadyInFlight => return Ok(skipped(DispatchOutcome::AlreadyInFlight)),
            Reservation::AtCapacity => return Ok(skipped(DispatchOutcome::AtCapacity)),
        }

        let job = SyncJob {
            kind: JobKind::Verify,
            key: record.key,
            shard: record.shard.clone(),
            target_path: record.path.clone(),
            targets: ResyncFlags::only(SubResource::Repository),
            generation: record.resync_generation,
            reason: reason.to_string(),
        };
        let job_id = self.commit(job).await?;
        Ok(DispatchOutcome::Dispatched(job_id))
    }

    /// Enqueue deletion of the local copy of a removed resource.
    ///
    /// Takes over any lock the resource holds. Removal jobs ignore the
    /// shard ceiling.
    pub async fn schedule_removal(
        &self,
        key: ResourceKey,
        shard: &str,
        path: &str,
        reason: &str,
    ) -> Result<DispatchOutcome> {
        self.release(key).await;
        if self.reserve(key, shard, usize::MAX).await != Reservation::Acquired {
            return Ok(skipped(DispatchOutcome::AlreadyInFlight));
        }

        let job = SyncJob {
            kind: JobKind::Remove,
            key,
            shard: shard.to_string(),
            target_path: path.to_string(),
            targets: ResyncFlags::all(),
            generation: 0,
            reason: reason.to_string(),
        };
        let job_id = self.commit(job).await?;
        Ok(DispatchOutcome::Dispatched(job_id))
    }
}

fn skipped(outcome: DispatchOutcome) -> DispatchOutcome {
    crate::metrics::record_job_skipped(outcome.label());
    outcome
}
