// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log cursor loop: keeps the local node's cursor moving.
//!
//! - Full batch: advance again right away (catching up).
//! - Short batch: wait `poll_interval`.
//! - Handler failure: the cursor is blocked on the failing event. Retry the
//!   same event with exponential backoff until it succeeds.
//!
//! The node is re-read from the watch channel before every batch. While it
//! is not an enabled secondary the loop idles.

use crate::config::LogCursorConfig;
use crate::log_cursor::LogCursor;
use crate::metrics;
use crate::node::{Node, NodeRole};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Run until shutdown is signaled.
pub async fn run_log_cursor(
    cursor: Arc<LogCursor>,
    mut node_rx: watch::Receiver<Node>,
    config: LogCursorConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let node_id = node_rx.borrow().id.clone();
    let span = tracing::info_span!("log_cursor", node_id = %node_id);

    async move {
        let _ = shutdown_rx.borrow_and_update();

        let poll_interval = config.poll_interval_duration();
        let retry = config.retry_config();
        let mut consecutive_failures: usize = 0;

        info!(
            batch_size = cursor.batch_size(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Starting log cursor"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let node = node_rx.borrow_and_update().clone();
            if !node.is_active_as(NodeRole::Secondary) {
                debug!(role = %node.role, enabled = node.enabled, "Node is not an active secondary, cursor idle");
                tokio::select! {
                    biased;
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    result = node_rx.changed() => {
                        if result.is_err() {
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            }

            let started = Instant::now();
            let wait = match cursor.advance(&node).await {
                Ok(stats) => {
                    if consecutive_failures > 0 {
                        info!(position = stats.position, "Log cursor unblocked");
                    }
                    consecutive_failures = 0;
                    metrics::record_cursor_batch(&node.id, stats.read, stats.applied, started.elapsed());
                    if stats.is_full_batch(cursor.batch_size()) {
                        Duration::ZERO
                    } else {
                        poll_interval
                    }
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    metrics::record_cursor_blocked(&node.id);
                    let backoff = retry.delay_for_attempt(consecutive_failures);
                    warn!(
                        error = %e,
                        consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Log cursor blocked, retrying with backoff"
                    );
                    backoff
                }
            };

            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                biased;
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Log cursor stopped");
    }
    .instrument(span)
    .await
}
