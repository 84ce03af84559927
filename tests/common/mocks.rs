// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock collaborators for testing.
//!
//! Each mock records what it was asked to do and can be told to fail, so
//! tests can assert both the happy path and degraded behavior.

#![allow(dead_code)]

use chrono::Utc;
use geo_replication_engine::event::EventFuture;
use geo_replication_engine::external::{
    BoxFuture, ExternalError, JobId, JobQueue, MemoryRouter, ResourceRoute, ResourceRouter,
    Transport,
};
use geo_replication_engine::{Event, EventId, EventKind, EventSource, ResourceKey, ResourceType, SyncJob};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// =============================================================================
// Transport
// =============================================================================

/// Transport that records every call.
///
/// # Example
/// ```rust,ignore
/// let transport = MockTransport::new();
/// transport.fail_next_syncs(2);
///
/// // Use in tests...
///
/// assert_eq!(transport.synced().len(), 3);
/// ```
#[derive(Default)]
pub struct MockTransport {
    syncs: Mutex<Vec<SyncJob>>,
    removals: Mutex<Vec<SyncJob>>,
    /// Remaining syncs that fail before syncs succeed again.
    fail_syncs: AtomicUsize,
    /// Fail every call while set.
    down: AtomicBool,
    local_checksum: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sync calls fail.
    pub fn fail_next_syncs(&self, n: usize) {
        self.fail_syncs.store(n, Ordering::SeqCst);
    }

    /// Fail (or stop failing) every call.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_local_checksum(&self, checksum: Option<&str>) {
        if let Ok(mut local) = self.local_checksum.lock() {
            *local = checksum.map(str::to_string);
        }
    }

    /// Sync calls seen so far, including failed ones.
    pub fn synced(&self) -> Vec<SyncJob> {
        self.syncs.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn removed(&self) -> Vec<SyncJob> {
        self.removals.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn check_down(&self) -> Result<(), ExternalError> {
        if self.down.load(Ordering::SeqCst) {
            Err(ExternalError::from("transport unavailable"))
        } else {
            Ok(())
        }
    }
}

impl Transport for MockTransport {
    fn sync(&self, job: SyncJob) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Ok(mut syncs) = self.syncs.lock() {
                syncs.push(job);
            }
            self.check_down()?;
            let failing = self
                .fail_syncs
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ExternalError::from("fetch failed: connection reset"));
            }
            Ok(())
        })
    }

    fn checksum(&self, _job: SyncJob) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            self.check_down()?;
            Ok(self.local_checksum.lock().ok().and_then(|c| c.clone()))
        })
    }

    fn remove(&self, job: SyncJob) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Ok(mut removals) = self.removals.lock() {
                removals.push(job);
            }
            self.check_down()
        })
    }
}

// =============================================================================
// Router
// =============================================================================

/// Router that can be switched into a failing mode.
///
/// Delegates to a [`MemoryRouter`] while healthy.
#[derive(Default)]
pub struct FlakyRouter {
    pub inner: MemoryRouter,
    failing: AtomicBool,
    route_calls: AtomicUsize,
}

impl FlakyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn route_calls(&self) -> usize {
        self.route_calls.load(Ordering::SeqCst)
    }
}

impl ResourceRouter for FlakyRouter {
    fn route(&self, key: ResourceKey) -> BoxFuture<'_, Option<ResourceRoute>> {
        self.route_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Box::pin(async { Err(ExternalError::from("router timed out")) });
        }
        self.inner.route(key)
    }

    fn list_resources(
        &self,
        shard: &str,
        resource_type: ResourceType,
        after_id: i64,
        limit: usize,
    ) -> BoxFuture<'_, Vec<ResourceRoute>> {
        if self.failing.load(Ordering::SeqCst) {
            return Box::pin(async { Err(ExternalError::from("router timed out")) });
        }
        self.inner.list_resources(shard, resource_type, after_id, limit)
    }
}

// =============================================================================
// Job queue
// =============================================================================

/// Job processor that refuses every job.
#[derive(Default)]
pub struct RefusingQueue {
    attempts: AtomicUsize,
}

impl RefusingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl JobQueue for RefusingQueue {
    fn enqueue(&self, _job: SyncJob) -> BoxFuture<'_, JobId> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(ExternalError::from("queue is read-only")) })
    }
}

// =============================================================================
// Event source
// =============================================================================

/// Event source serving a fixed list of events.
///
/// Lets tests choose event ids, which the SQLite log assigns itself.
#[derive(Default)]
pub struct VecEventSource {
    events: Mutex<Vec<Event>>,
}

impl VecEventSource {
    pub fn new(events: Vec<Event>) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(events),
        })
    }

    pub fn push(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl EventSource for VecEventSource {
    fn read_after(&self, after: EventId, limit: usize) -> EventFuture<'_, Vec<Event>> {
        let events = self
            .events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.id > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(async move { Ok(events) })
    }

    fn last_event_id(&self) -> EventFuture<'_, EventId> {
        let last = self
            .events
            .lock()
            .ok()
            .and_then(|events| events.iter().map(|e| e.id).max())
            .unwrap_or(0);
        Box::pin(async move { Ok(last) })
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Build an event with a chosen id.
pub fn event(id: EventId, kind: EventKind, resource: Option<ResourceKey>) -> Event {
    Event {
        id,
        kind,
        resource,
        created_at: Utc::now(),
    }
}

/// A route for project `id` on `shard`, at `group/project-<id>`.
pub fn route(id: i64, shard: &str) -> ResourceRoute {
    ResourceRoute {
        key: ResourceKey::repository(id),
        shard: shard.to_string(),
        path: format!("group/project-{}", id),
        namespace_id: None,
        primary_checksum: None,
    }
}
