// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduler loop: runs a [`ShardScheduler`] every `interval()`.
//!
//! Missed ticks are skipped rather than bursted. A failed sweep is logged
//! and counted; the next tick runs a fresh one.

use crate::metrics;
use crate::node::Node;
use crate::scheduler::ShardScheduler;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Run until shutdown is signaled.
pub async fn run_scheduler(
    scheduler: Arc<dyn ShardScheduler>,
    node_rx: watch::Receiver<Node>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("scheduler", scheduler = scheduler.name());

    async move {
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();

        let interval = scheduler.interval();
        info!(
            role = %scheduler.role(),
            interval_secs = interval.as_secs(),
            "Starting scheduler"
        );

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping scheduler");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            match scheduler.sweep(&node_rx).await {
                Ok(stats) if stats.skipped => {
                    debug!("Sweep skipped, node lacks the role");
                    metrics::record_sweep_skipped(scheduler.name());
                }
                Ok(stats) => {
                    let dispatched = stats.sync_dispatched + stats.verify_dispatched;
                    metrics::record_sweep(
                        scheduler.name(),
                        std::time::Duration::from_millis(stats.duration_ms),
                        dispatched,
                    );
                    if dispatched > 0 || stats.removed > 0 || stats.checksum_changes > 0 {
                        info!(
                            shards = stats.shards_eligible,
                            discovered = stats.discovered,
                            sync_dispatched = stats.sync_dispatched,
                            verify_dispatched = stats.verify_dispatched,
                            removed = stats.removed,
                            checksum_changes = stats.checksum_changes,
                            stuck = stats.stuck,
                            duration_ms = stats.duration_ms,
                            "Sweep complete"
                        );
                    } else {
                        debug!(
                            shards = stats.shards_eligible,
                            at_capacity = stats.at_capacity,
                            stuck = stats.stuck,
                            "Sweep complete, nothing to do"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Sweep failed");
                    metrics::record_sweep_failure(scheduler.name(), e.kind());
                }
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::node::NodeRole;
    use crate::scheduler::{SweepFuture, SweepStats};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingScheduler {
        sweeps: AtomicUsize,
    }

    impl ShardScheduler for CountingScheduler {
        fn role(&self) -> NodeRole {
            NodeRole::Secondary
        }

        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        fn sweep<'a>(&'a self, _node: &'a watch::Receiver<Node>) -> SweepFuture<'a> {
            Box::pin(async move {
                self.sweeps.fetch_add(1, Ordering::SeqCst);
                Result::Ok(SweepStats::default())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_on_each_tick_until_shutdown() {
        let scheduler = Arc::new(CountingScheduler {
            sweeps: AtomicUsize::new(0),
        });
        let (_node_tx, node_rx) = watch::channel(Node::secondary("secondary-1"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_scheduler(scheduler.clone(), node_rx, shutdown_rx));

        // First tick fires immediately, then one per interval.
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(scheduler.sweeps.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
