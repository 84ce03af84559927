// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary sweep: checksum reconciliation and registry cleanup.
//!
//! Each sweep walks one page of resources per healthy shard and resource
//! type, computes the repository checksum from its refs and stores it. When
//! a stored checksum differs from the fresh one, the content changed without
//! an update event (a stored checksum is cleared by the normal update path),
//! so a `checksum_reset` event is appended for secondaries to re-verify.
//!
//! Cleanup walks one page of registry rows and deletes the ones the router
//! no longer knows.

use super::{still_active, PageCursors, SchedulerContext, ShardScheduler, SweepFuture, SweepStats};
use crate::checksum::repository_checksum;
use crate::error::{ReplicationError, Result};
use crate::event::EventKind;
use crate::external::ResourceRoute;
use crate::node::{Node, NodeRole};
use crate::registry::{RegistryFilter, ResourceKey, ResourceType};
use crate::resilience::Bulkhead;
use futures::future::join_all;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Sweep run on the primary.
pub struct PrimaryScheduler {
    ctx: SchedulerContext,
    pages: PageCursors,
    checksums: Bulkhead,
    cleanup_after: Mutex<Option<ResourceKey>>,
}

enum ChecksumOutcome {
    Unchanged,
    Changed,
    Failed,
}

impl PrimaryScheduler {
    pub fn new(ctx: SchedulerContext) -> Self {
        let checksums = Bulkhead::new(ctx.settings.primary.max_concurrent_checksums);
        Self {
            ctx,
            pages: PageCursors::default(),
            checksums,
            cleanup_after: Mutex::new(None),
        }
    }

    #[instrument(skip_all, fields(scheduler = "primary"))]
    async fn run_sweep(&self, node_rx: &watch::Receiver<Node>) -> Result<SweepStats> {
        let started = Instant::now();
        let mut stats = SweepStats::default();
        if !still_active(node_rx, NodeRole::Primary) {
            stats.skipped = true;
            return Ok(stats);
        }

        let healthy = self
            .ctx
            .health
            .healthy_shard_names()
            .await
            .map_err(|e| ReplicationError::external("health.healthy_shard_names", e.to_string()))?;
        stats.shards_healthy = healthy.len();
        stats.shards_eligible = healthy.len();

        let page_size = self.ctx.settings.primary.resources_per_shard;
        'shards: for shard in &healthy {
            for resource_type in ResourceType::ALL {
                if !still_active(node_rx, NodeRole::Primary) {
                    stats.aborted = true;
                    break 'shards;
                }

                let after = self.pages.get(shard, resource_type);
                let page = match self
                    .ctx
                    .router
                    .list_resources(shard, resource_type, after, page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        stats.errors += 1;
                        warn!(shard = %shard, resource_type = %resource_type, error = %e, "Failed to list resources");
                        continue;
                    }
                };
                self.pages.advance(
                    shard,
                    resource_type,
                    page.last().map(|r| r.key.resource_id),
                    page.len(),
                    page_size,
                );

                let outcomes = join_all(page.iter().map(|route| self.reconcile(route))).await;
                for outcome in outcomes {
                    match outcome {
                        ChecksumOutcome::Unchanged => stats.checksummed += 1,
                        ChecksumOutcome::Changed => {
                            stats.checksummed += 1;
                            stats.checksum_changes += 1;
                        }
                        ChecksumOutcome::Failed => stats.errors += 1,
                    }
                }
            }
        }

        if !stats.aborted {
            stats.removed = self.cleanup(page_size).await?;
        }

        if stats.checksum_changes > 0 || stats.removed > 0 {
            info!(
                checksum_changes = stats.checksum_changes,
                removed = stats.removed,
                "Primary sweep reconciled registry"
            );
        }
        stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }

    async fn reconcile(&self, route: &ResourceRoute) -> ChecksumOutcome {
        let _permit = match self.checksums.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(resource = %route.key, error = %e, "Checksum bulkhead closed");
                return ChecksumOutcome::Failed;
            }
        };

        let refs = match self.ctx.inspector.refs(route.clone()).await {
            Ok(refs) => refs,
            Err(e) => {
                warn!(resource = %route.key, error = %e, "Failed to read refs");
                return ChecksumOutcome::Failed;
            }
        };
        let checksum = repository_checksum(&refs);

        let previous = match self.ctx.registry.get(route.key).await {
            Ok(row) => row.and_then(|r| r.checksum),
            Err(e) => {
                warn!(resource = %route.key, error = %e, "Failed to read stored checksum");
                return ChecksumOutcome::Failed;
            }
        };
        let changed = matches!(&previous, Some(previous) if *previous != checksum);

        // The event goes out before the new checksum is stored. If the append
        // fails the old checksum stays and the next sweep sees the change again.
        if changed {
            debug!(resource = %route.key, "Content changed outside the update path");
            if let Err(e) = self
                .ctx
                .event_log
                .append(EventKind::ChecksumReset, Some(route.key))
                .await
            {
                warn!(resource = %route.key, error = %e, "Failed to append checksum reset");
                return ChecksumOutcome::Failed;
            }
        }

        if let Err(e) = self.ctx.registry.record_primary_checksum(route, &checksum).await {
            warn!(resource = %route.key, error = %e, "Failed to store checksum");
            return ChecksumOutcome::Failed;
        }

        if changed {
            ChecksumOutcome::Changed
        } else {
            ChecksumOutcome::Unchanged
        }
    }

    /// Delete rows of resources the router no longer knows. One page per
    /// sweep, resuming where the previous sweep stopped.
    async fn cleanup(&self, page_size: usize) -> Result<usize> {
        let after = self.cleanup_after.lock().ok().and_then(|a| *a);
        let rows = self
            .ctx
            .registry
            .list(&RegistryFilter {
                after,
                limit: page_size,
                ..Default::default()
            })
            .await?;

        let next = if rows.len() >= page_size {
            rows.last().map(|r| r.key)
        } else {
            None
        };
        if let Ok(mut cursor) = self.cleanup_after.lock() {
            *cursor = next;
        }

        let mut removed = 0;
        for row in rows {
            match self.ctx.router.route(row.key).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if self.ctx.registry.delete(row.key).await? {
                        removed += 1;
                    }
                }
                Err(e) => warn!(resource = %row.key, error = %e, "Route lookup failed during cleanup"),
            }
        }
        Ok(removed)
    }
}

impl ShardScheduler for PrimaryScheduler {
    fn role(&self) -> NodeRole {
        NodeRole::Primary
    }

    fn name(&self) -> &'static str {
        "primary"
    }

    fn interval(&self) -> Duration {
        self.ctx.settings.primary.interval()
    }

    fn sweep<'a>(&'a self, node: &'a watch::Receiver<Node>) -> SweepFuture<'a> {
        Box::pin(self.run_sweep(node))
    }
}
