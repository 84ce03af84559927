// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard schedulers: the periodic sweeps.
//!
//! Two implementations of [`ShardScheduler`], picked by the local node's role
//! with [`build_scheduler`]:
//!
//! - [`SecondaryScheduler`]: pulls data. Discovers unregistered resources,
//!   dispatches sync jobs for due rows and verification jobs for rows waiting
//!   to be verified, bounded per shard.
//! - [`PrimaryScheduler`]: computes repository checksums, raises
//!   `checksum_reset` events when content changed behind the update path, and
//!   drops registry rows whose resource is gone.
//!
//! Both run under the engine's sweep loop and skip the sweep entirely when
//! the node does not (or no longer) has their role.

mod primary;
mod secondary;

pub use primary::PrimaryScheduler;
pub use secondary::SecondaryScheduler;

use crate::config::ReplicationSettings;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::event::SqliteEventLog;
use crate::external::{ContentInspector, ResourceRouter, ShardHealth};
use crate::node::{Node, NodeRole};
use crate::registry::{RegistryStore, ResourceType};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Boxed future returned by [`ShardScheduler::sweep`].
pub type SweepFuture<'a> = Pin<Box<dyn Future<Output = Result<SweepStats>> + Send + 'a>>;

/// What one sweep did. Counters a scheduler does not use stay zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Healthy shards reported for this sweep.
    pub shards_healthy: usize,
    /// Shards left after selective sync.
    pub shards_eligible: usize,
    /// Rows created for resources found on a shard.
    pub discovered: usize,
    /// Rows removed (out of scope, or gone upstream).
    pub removed: usize,
    pub sync_dispatched: usize,
    pub verify_dispatched: usize,
    pub reverify_requested: usize,
    pub already_in_flight: usize,
    pub at_capacity: usize,
    pub dispatch_failures: usize,
    /// Failed rows past `max_retries`.
    pub stuck: u64,
    pub checksummed: usize,
    /// `checksum_reset` events appended.
    pub checksum_changes: usize,
    pub errors: usize,
    /// The sweep stopped early because the node lost its role.
    pub aborted: bool,
    /// The node did not have the scheduler's role; nothing was done.
    pub skipped: bool,
    pub duration_ms: u64,
}

/// A periodic sweep over the shards.
pub trait ShardScheduler: Send + Sync {
    /// Role the local node must have for the sweep to run.
    fn role(&self) -> NodeRole;

    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Time between sweeps.
    fn interval(&self) -> Duration;

    /// Run one sweep.
    ///
    /// `node` is read at the start and again before each dispatch, so a node
    /// disabled or demoted mid-sweep schedules nothing further.
    fn sweep<'a>(&'a self, node: &'a watch::Receiver<Node>) -> SweepFuture<'a>;
}

/// Everything a scheduler needs, shared with the rest of the engine.
#[derive(Clone)]
pub struct SchedulerContext {
    pub registry: RegistryStore,
    pub dispatcher: Arc<Dispatcher>,
    pub router: Arc<dyn ResourceRouter>,
    pub health: Arc<dyn ShardHealth>,
    pub inspector: Arc<dyn ContentInspector>,
    pub event_log: SqliteEventLog,
    pub settings: ReplicationSettings,
}

/// Build the scheduler for a node role.
pub fn build_scheduler(role: NodeRole, ctx: SchedulerContext) -> Box<dyn ShardScheduler> {
    match role {
        NodeRole::Primary => Box::new(PrimaryScheduler::new(ctx)),
        NodeRole::Secondary => Box::new(SecondaryScheduler::new(ctx)),
    }
}

/// Resume points for paging through a shard's resources, one per
/// `(shard, resource type)`. Wraps to the start after the last page.
#[derive(Debug, Default)]
pub(crate) struct PageCursors {
    positions: Mutex<HashMap<(String, ResourceType), i64>>,
}

impl PageCursors {
    pub(crate) fn get(&self, shard: &str, resource_type: ResourceType) -> i64 {
        self.positions
            .lock()
            .ok()
            .and_then(|p| p.get(&(shard.to_string(), resource_type)).copied())
            .unwrap_or(0)
    }

    /// Record a page. A short page means the end was reached.
    pub(crate) fn advance(
        &self,
        shard: &str,
        resource_type: ResourceType,
        last_id: Option<i64>,
        page_len: usize,
        page_size: usize,
    ) {
        if let Ok(mut positions) = self.positions.lock() {
            let next = match last_id {
                Some(id) if page_len >= page_size => id,
                _ => 0,
            };
            positions.insert((shard.to_string(), resource_type), next);
        }
    }
}

/// Whether the node behind `rx` still has `role` and is enabled.
pub(crate) fn still_active(rx: &watch::Receiver<Node>, role: NodeRole) -> bool {
    rx.borrow().is_active_as(role)
}
