// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Traits for the collaborators the engine consumes.
//!
//! The host application provides implementations of these traits:
//!
//! | Trait | Used by | Purpose |
//! |-------|---------|---------|
//! | [`ResourceRouter`] | handlers, schedulers, worker | resource id → shard, path, namespace |
//! | [`ShardHealth`] | schedulers | which shards are healthy this sweep |
//! | [`JobQueue`] | dispatcher | at-least-once job processor |
//! | [`Transport`] | worker | moves bytes (sync, checksum, remove) |
//! | [`ContentInspector`] | primary scheduler | lists refs for checksumming |
//!
//! # Example
//!
//! ```rust,no_run
//! use geo_replication_engine::external::{BoxFuture, ShardHealth};
//! use std::collections::BTreeSet;
//!
//! struct AllHealthy;
//!
//! impl ShardHealth for AllHealthy {
//!     fn healthy_shard_names(&self) -> BoxFuture<'_, BTreeSet<String>> {
//!         Box::pin(async move { Ok(["default".to_string()].into_iter().collect()) })
//!     }
//! }
//! ```

use crate::checksum::GitRef;
use crate::dispatch::SyncJob;
use crate::registry::{ResourceKey, ResourceType};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

/// Result type for collaborator calls.
pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ExternalResult<T>> + Send + 'a>>;

/// Simplified error for collaborator calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalError(pub String);

impl std::fmt::Display for ExternalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ExternalError {}

impl From<&str> for ExternalError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Placement of a resource as resolved by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRoute {
    pub key: ResourceKey,
    /// Storage shard holding the resource.
    pub shard: String,
    /// Disk path relative to the shard.
    pub path: String,
    /// Owning namespace, for namespace-scoped selective sync.
    pub namespace_id: Option<i64>,
    /// Checksum the primary last computed, if known. Verification on a
    /// secondary compares against this.
    pub primary_checksum: Option<String>,
}

/// Resolves resources to their placement.
pub trait ResourceRouter: Send + Sync + 'static {
    /// Route one resource. `None` means it no longer exists upstream.
    fn route(&self, key: ResourceKey) -> BoxFuture<'_, Option<ResourceRoute>>;

    /// List resources on a shard with id greater than `after_id`, ascending,
    /// at most `limit`. Used to discover resources with no registry row.
    fn list_resources(
        &self,
        shard: &str,
        resource_type: ResourceType,
        after_id: i64,
        limit: usize,
    ) -> BoxFuture<'_, Vec<ResourceRoute>>;
}

/// Reports shard health.
pub trait ShardHealth: Send + Sync + 'static {
    /// Names of shards that are healthy right now. Queried once per sweep.
    fn healthy_shard_names(&self) -> BoxFuture<'_, BTreeSet<String>>;
}

/// Identifier the job processor assigns to an accepted job.
pub type JobId = String;

/// The external job processor.
///
/// Delivery is at-least-once; the engine tolerates duplicate execution.
pub trait JobQueue: Send + Sync + 'static {
    /// Hand a job to the processor.
    fn enqueue(&self, job: SyncJob) -> BoxFuture<'_, JobId>;

    /// Jobs accepted but not yet finished. Used to rebuild dispatch locks
    /// and shard counts after a restart.
    ///
    /// Default implementation reports nothing in flight.
    fn in_flight(&self) -> BoxFuture<'_, Vec<SyncJob>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Moves data from the primary to the local node.
pub trait Transport: Send + Sync + 'static {
    /// Pull the sub-resources named in `job.targets` to `job.target_path`.
    fn sync(&self, job: SyncJob) -> BoxFuture<'_, ()>;

    /// Checksum of the local copy, `None` if there is no local copy.
    fn checksum(&self, job: SyncJob) -> BoxFuture<'_, Option<String>>;

    /// Delete the local copy at `job.target_path`.
    fn remove(&self, job: SyncJob) -> BoxFuture<'_, ()>;
}

/// Reads repository content on the primary.
pub trait ContentInspector: Send + Sync + 'static {
    /// All refs of the resource.
    fn refs(&self, route: ResourceRoute) -> BoxFuture<'_, Vec<GitRef>>;
}

// =============================================================================
// In-memory implementations (standalone mode and tests)
// =============================================================================

/// Router backed by a map of routes.
#[derive(Default)]
pub struct MemoryRouter {
    routes: std::sync::RwLock<std::collections::BTreeMap<ResourceKey, ResourceRoute>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a route.
    pub fn insert(&self, route: ResourceRoute) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(route.key, route);
        }
    }

    /// Forget a resource, as if it was deleted upstream.
    pub fn remove(&self, key: ResourceKey) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(&key);
        }
    }

    /// Set the checksum the primary reports for `key`.
    pub fn set_primary_checksum(&self, key: ResourceKey, checksum: Option<String>) {
        if let Ok(mut routes) = self.routes.write() {
            if let Some(route) = routes.get_mut(&key) {
                route.primary_checksum = checksum;
            }
        }
    }

    fn snapshot(&self) -> ExternalResult<std::collections::BTreeMap<ResourceKey, ResourceRoute>> {
        self.routes
            .read()
            .map(|routes| routes.clone())
            .map_err(|_| ExternalError::from("router lock poisoned"))
    }
}

impl ResourceRouter for MemoryRouter {
    fn route(&self, key: ResourceKey) -> BoxFuture<'_, Option<ResourceRoute>> {
        Box::pin(async move { Ok(self.snapshot()?.get(&key).cloned()) })
    }

    fn list_resources(
        &self,
        shard: &str,
        resource_type: ResourceType,
        after_id: i64,
        limit: usize,
    ) -> BoxFuture<'_, Vec<ResourceRoute>> {
        let shard = shard.to_string();
        Box::pin(async move {
            Ok(self
                .snapshot()?
                .into_values()
                .filter(|r| {
                    r.shard == shard
                        && r.key.resource_type == resource_type
                        && r.key.resource_id > after_id
                })
                .take(limit)
                .collect())
        })
    }
}

/// Health source reporting a fixed set of shards.
#[derive(Default)]
pub struct StaticShardHealth {
    healthy: std::sync::RwLock<BTreeSet<String>>,
}

impl StaticShardHealth {
    pub fn new<I, S>(shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            healthy: std::sync::RwLock::new(shards.into_iter().map(Into::into).collect()),
        }
    }

    /// Replace the healthy set.
    pub fn set<I, S>(&self, shards: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut healthy) = self.healthy.write() {
            *healthy = shards.into_iter().map(Into::into).collect();
        }
    }
}

impl ShardHealth for StaticShardHealth {
    fn healthy_shard_names(&self) -> BoxFuture<'_, BTreeSet<String>> {
        Box::pin(async move {
            self.healthy
                .read()
                .map(|h| h.clone())
                .map_err(|_| ExternalError::from("health lock poisoned"))
        })
    }
}

/// Job queue that records jobs and never runs them.
///
/// Jobs stay "in flight" until [`complete`](Self::complete) is called.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: std::sync::Mutex<Vec<(JobId, SyncJob)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job accepted so far, oldest first.
    pub fn jobs(&self) -> Vec<SyncJob> {
        self.jobs
            .lock()
            .map(|jobs| jobs.iter().map(|(_, j)| j.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return the oldest job.
    pub fn take_next(&self) -> Option<SyncJob> {
        let mut jobs = self.jobs.lock().ok()?;
        if jobs.is_empty() {
            None
        } else {
            Some(jobs.remove(0).1)
        }
    }

    /// Drop a finished job by id.
    pub fn complete(&self, id: &str) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.retain(|(job_id, _)| job_id != id);
        }
    }
}

impl JobQueue for MemoryJobQueue {
    fn enqueue(&self, job: SyncJob) -> BoxFuture<'_, JobId> {
        Box::pin(async move {
            let n = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            let id = format!("job-{}", n);
            self.jobs
                .lock()
                .map_err(|_| ExternalError::from("queue lock poisoned"))?
                .push((id.clone(), job));
            Ok(id)
        })
    }

    fn in_flight(&self) -> BoxFuture<'_, Vec<SyncJob>> {
        Box::pin(async move { Ok(self.jobs()) })
    }
}

/// Transport that succeeds without moving anything.
///
/// Reports `local_checksum` for every resource.
#[derive(Debug, Default)]
pub struct NoOpTransport {
    pub local_checksum: Option<String>,
}

impl Transport for NoOpTransport {
    fn sync(&self, _job: SyncJob) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn checksum(&self, _job: SyncJob) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.local_checksum.clone()) })
    }

    fn remove(&self, _job: SyncJob) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Inspector serving refs from a map, empty for unknown resources.
#[derive(Default)]
pub struct MemoryInspector {
    refs: std::sync::RwLock<std::collections::HashMap<ResourceKey, Vec<GitRef>>>,
}

impl MemoryInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_refs(&self, key: ResourceKey, refs: Vec<GitRef>) {
        if let Ok(mut map) = self.refs.write() {
            map.insert(key, refs);
        }
    }
}

impl ContentInspector for MemoryInspector {
    fn refs(&self, route: ResourceRoute) -> BoxFuture<'_, Vec<GitRef>> {
        Box::pin(async move {
            self.refs
                .read()
                .map(|map| map.get(&route.key).cloned().unwrap_or_default())
                .map_err(|_| ExternalError::from("inspector lock poisoned"))
        })
    }
}
