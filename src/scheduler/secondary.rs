// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Secondary sweep: pull whatever the registry says is due.
//!
//! # Algorithm
//!
//! 1. Skip unless the node is an enabled secondary
//! 2. `eligible = filter_shards(healthy_shard_names(), node)`
//! 3. Drop registry rows outside the node's scope
//! 4. Per eligible shard:
//!    - discover one page of unregistered in-scope resources
//!    - queue re-verification of rows verified too long ago
//!    - dispatch sync jobs for due rows, up to the shard's free slots
//!    - re-dispatch `started` rows whose lock expired with no job
//!    - dispatch verification jobs with the slots left
//! 5. Count stuck rows
//!
//! Unhealthy shards are simply absent from step 2 and get picked up again by
//! the first sweep after they recover.

use super::{still_active, PageCursors, SchedulerContext, ShardScheduler, SweepFuture, SweepStats};
use crate::dispatch::DispatchOutcome;
use crate::error::{ReplicationError, Result};
use crate::node::{Node, NodeRole, SelectiveSync};
use crate::registry::{RegistryRecord, ResourceType};
use crate::resilience::RetryConfig;
use crate::selective_sync::{filter_shards, route_in_scope};
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Sweep run on secondaries.
pub struct SecondaryScheduler {
    ctx: SchedulerContext,
    discovery: PageCursors,
}

impl SecondaryScheduler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self {
            ctx,
            discovery: PageCursors::default(),
        }
    }

    #[instrument(skip_all, fields(scheduler = "secondary"))]
    async fn run_sweep(&self, node_rx: &watch::Receiver<Node>) -> Result<SweepStats> {
        let started = Instant::now();
        let mut stats = SweepStats::default();
        let node = node_rx.borrow().clone();
        if !node.is_active_as(NodeRole::Secondary) {
            stats.skipped = true;
            return Ok(stats);
        }

        let config = &self.ctx.settings.scheduler;
        let healthy = self
            .ctx
            .health
            .healthy_shard_names()
            .await
            .map_err(|e| ReplicationError::external("health.healthy_shard_names", e.to_string()))?;
        stats.shards_healthy = healthy.len();

        // A malformed scope stops this node's sweep here.
        let eligible = filter_shards(&healthy, &node)?;
        let scope = node.scope()?;
        stats.shards_eligible = eligible.len();

        let removed = self.ctx.registry.remove_outside_scope(&scope).await?;
        for key in &removed {
            self.ctx.dispatcher.release(*key).await;
        }
        stats.removed = removed.len();

        let retry = config.retry_config();
        let mut budget = config.max_jobs_per_sweep;

        for shard in &eligible {
            if !still_active(node_rx, NodeRole::Secondary) {
                stats.aborted = true;
                break;
            }

            self.discover(shard, &scope, &mut stats).await;
            self.queue_reverification(shard, &mut stats).await?;

            let max = config.max_concurrency_for(shard);
            let mut free = max.saturating_sub(self.ctx.dispatcher.in_flight_count(shard).await);

            if free > 0 && budget > 0 {
                let due = self
                    .ctx
                    .registry
                    .due_for_sync(shard, Utc::now(), config.max_retries, free.min(budget))
                    .await?;
                self.dispatch_syncs(node_rx, shard, due, &retry, &mut free, &mut budget, &mut stats)
                    .await;
            }
            if stats.aborted {
                break;
            }

            // Rows left `started` with no job, e.g. after a crash mid-dispatch.
            // Live jobs hold their lock and come back as already in flight.
            if free > 0 && budget > 0 {
                if let Some(stale_before) = self.ctx.dispatcher.stale_before() {
                    let orphans = self
                        .ctx
                        .registry
                        .stale_started(shard, stale_before, free.min(budget))
                        .await?;
                    self.dispatch_syncs(node_rx, shard, orphans, &retry, &mut free, &mut budget, &mut stats)
                        .await;
                }
            }
            if stats.aborted {
                break;
            }

            if free > 0 && budget > 0 {
                let waiting = self
                    .ctx
                    .registry
                    .due_for_verification(shard, free.min(budget))
                    .await?;
                for record in waiting {
                    if !still_active(node_rx, NodeRole::Secondary) {
                        stats.aborted = true;
                        break;
                    }
                    match self.ctx.dispatcher.schedule_verification(&record, max, "sweep").await {
                        Ok(DispatchOutcome::Dispatched(_)) => {
                            stats.verify_dispatched += 1;
                            budget = budget.saturating_sub(1);
                        }
                        Ok(DispatchOutcome::AlreadyInFlight) => stats.already_in_flight += 1,
                        Ok(DispatchOutcome::AtCapacity) => {
                            stats.at_capacity += 1;
                            break;
                        }
                        Ok(DispatchOutcome::Skipped) => {}
                        Err(e) => {
                            stats.dispatch_failures += 1;
                            warn!(resource = %record.key, shard = %shard, error = %e, "Verification dispatch failed");
                        }
                    }
                }
            }
            if stats.aborted {
                break;
            }
        }

        if stats.aborted {
            info!(node_id = %node.id, "Node lost its secondary role mid-sweep, stopped dispatching");
        }

        stats.stuck = self.ctx.registry.count_stuck(config.max_retries).await?;
        crate::metrics::set_stuck_resources(stats.stuck);
        stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Dispatch sync jobs for `records` until the shard fills up.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_syncs(
        &self,
        node_rx: &watch::Receiver<Node>,
        shard: &str,
        records: Vec<RegistryRecord>,
        retry: &RetryConfig,
        free: &mut usize,
        budget: &mut usize,
        stats: &mut SweepStats,
    ) {
        let max = self.ctx.settings.scheduler.max_concurrency_for(shard);
        for record in records {
            if !still_active(node_rx, NodeRole::Secondary) {
                stats.aborted = true;
                return;
            }
            match self
                .ctx
                .dispatcher
                .schedule_sync(&self.ctx.registry, &record, max, "sweep", retry)
                .await
            {
                Ok(DispatchOutcome::Dispatched(_)) => {
                    stats.sync_dispatched += 1;
                    *free = free.saturating_sub(1);
                    *budget = budget.saturating_sub(1);
                }
                Ok(DispatchOutcome::AlreadyInFlight) => stats.already_in_flight += 1,
                Ok(DispatchOutcome::AtCapacity) => {
                    stats.at_capacity += 1;
                    *free = 0;
                    return;
                }
                Ok(DispatchOutcome::Skipped) => {}
                Err(e) => {
                    stats.dispatch_failures += 1;
                    warn!(resource = %record.key, shard = %shard, error = %e, "Sweep dispatch failed");
                }
            }
        }
    }

    /// Register one page of resources the router knows and the registry
    /// does not, per resource type. Router errors skip discovery for the
    /// shard this sweep.
    async fn discover(&self, shard: &str, scope: &SelectiveSync, stats: &mut SweepStats) {
        let page_size = self.ctx.settings.scheduler.discovery_batch_size;
        if page_size == 0 {
            return;
        }

        for resource_type in ResourceType::ALL {
            let after = self.discovery.get(shard, resource_type);
            let page = match self
                .ctx
                .router
                .list_resources(shard, resource_type, after, page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    stats.errors += 1;
                    warn!(shard = %shard, resource_type = %resource_type, error = %e, "Discovery failed");
                    return;
                }
            };
            self.discovery.advance(
                shard,
                resource_type,
                page.last().map(|r| r.key.resource_id),
                page.len(),
                page_size,
            );

            for route in page.iter().filter(|r| route_in_scope(scope, r)) {
                match self
                    .ctx
                    .registry
                    .register(route, crate::registry::ResyncFlags::all())
                    .await
                {
                    Ok((_, true)) => stats.discovered += 1,
                    Ok((_, false)) => {}
                    Err(e) => {
                        stats.errors += 1;
                        warn!(resource = %route.key, error = %e, "Failed to register discovered resource");
                    }
                }
            }
        }
    }

    async fn queue_reverification(&self, shard: &str, stats: &mut SweepStats) -> Result<()> {
        let Some(interval) = self.ctx.settings.scheduler.reverify_interval() else {
            return Ok(());
        };
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(interval) else {
            return Ok(());
        };

        let limit = self.ctx.settings.scheduler.max_concurrency_for(shard);
        let stale = self
            .ctx
            .registry
            .due_for_reverification(shard, cutoff, limit)
            .await?;
        for record in stale {
            self.ctx
                .registry
                .update(record.key, |r| {
                    r.request_verification();
                    Ok(())
                })
                .await?;
            stats.reverify_requested += 1;
        }
        if stats.reverify_requested > 0 {
            debug!(shard = %shard, count = stats.reverify_requested, "Queued re-verification");
        }
        Ok(())
    }
}

impl ShardScheduler for SecondaryScheduler {
    fn role(&self) -> NodeRole {
        NodeRole::Secondary
    }

    fn name(&self) -> &'static str {
        "secondary"
    }

    fn interval(&self) -> Duration {
        self.ctx.settings.scheduler.interval()
    }

    fn sweep<'a>(&'a self, node: &'a watch::Receiver<Node>) -> SweepFuture<'a> {
        Box::pin(self.run_sweep(node))
    }
}
