// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Registry writes and state transitions
//! - Event log appends and handler outcomes
//! - Log cursor position and lag per node
//! - Dispatch and per-shard in-flight jobs
//! - Sweeps and job completion
//! - Circuit breaker calls
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `geo_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use geo_replication_engine::metrics;
//! use std::time::Duration;
//!
//! // After a secondary sweep
//! metrics::record_sweep("secondary", Duration::from_millis(120), 8);
//!
//! // After a handler ran
//! metrics::record_event_processed("repository_updated", "applied");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Store Metrics
// =============================================================================

/// Record a SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("geo_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a newly registered resource.
pub fn record_registry_registered(resource_type: &str) {
    counter!("geo_registry_registered_total", "resource_type" => resource_type.to_string()).increment(1);
}

/// Record a lost compare-and-set race on a registry row.
pub fn record_registry_conflict() {
    counter!("geo_registry_conflicts_total").increment(1);
}

/// Record a registry state transition.
pub fn record_registry_transition(from: &str, to: &str) {
    counter!(
        "geo_registry_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Gauge of failed rows past the retry limit.
pub fn set_stuck_resources(count: u64) {
    gauge!("geo_registry_stuck_resources").set(count as f64);
}

// =============================================================================
// Event Log & Cursor Metrics
// =============================================================================

/// Record an event appended on the primary.
pub fn record_event_appended(kind: &str) {
    counter!("geo_events_appended_total", "kind" => kind.to_string()).increment(1);
}

/// Record a handled event (`applied` or a skip reason).
pub fn record_event_processed(kind: &str, outcome: &str) {
    counter!(
        "geo_events_processed_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a handler failure. The node's cursor stays put.
pub fn record_handler_failure(kind: &str, error_kind: &str) {
    counter!(
        "geo_handler_failures_total",
        "kind" => kind.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

/// Gauge for a node's cursor position.
pub fn set_cursor_position(node_id: &str, event_id: i64) {
    gauge!("geo_cursor_position", "node_id" => node_id.to_string()).set(event_id as f64);
}

/// Gauge for events between a node's cursor and the log head.
pub fn set_cursor_lag(node_id: &str, lag_events: i64) {
    gauge!("geo_cursor_lag_events", "node_id" => node_id.to_string()).set(lag_events as f64);
}

/// Record one cursor batch.
pub fn record_cursor_batch(node_id: &str, read: usize, applied: usize, duration: Duration) {
    let node = node_id.to_string();
    counter!("geo_cursor_events_read_total", "node_id" => node.clone()).increment(read as u64);
    counter!("geo_cursor_events_applied_total", "node_id" => node.clone()).increment(applied as u64);
    histogram!("geo_cursor_batch_duration_seconds", "node_id" => node).record(duration.as_secs_f64());
}

/// Record a batch stopped by a failing event.
pub fn record_cursor_blocked(node_id: &str) {
    counter!("geo_cursor_blocked_total", "node_id" => node_id.to_string()).increment(1);
}

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("geo_cursor_flushes_total").increment(1);
    counter!("geo_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("geo_cursor_flush_errors_total").increment(errors as u64);
    }
}

// =============================================================================
// Dispatch & Job Metrics
// =============================================================================

/// Record a job handed to the job processor.
pub fn record_job_dispatched(kind: &str, shard: &str) {
    counter!(
        "geo_jobs_dispatched_total",
        "kind" => kind.to_string(),
        "shard" => shard.to_string()
    )
    .increment(1);
}

/// Record a dispatch that was a no-op (`already_in_flight`, `at_capacity`,
/// `skipped`).
pub fn record_job_skipped(reason: &str) {
    counter!("geo_jobs_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Gauge for jobs in flight on a shard.
pub fn set_shard_in_flight(shard: &str, count: usize) {
    gauge!("geo_shard_in_flight", "shard" => shard.to_string()).set(count as f64);
}

/// Record a finished job.
pub fn record_job_completed(kind: &str, outcome: &str) {
    counter!(
        "geo_jobs_completed_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Scheduler Metrics
// =============================================================================

/// Record a completed sweep.
pub fn record_sweep(scheduler: &str, duration: Duration, dispatched: usize) {
    let name = scheduler.to_string();
    counter!("geo_sweeps_total", "scheduler" => name.clone()).increment(1);
    counter!("geo_sweep_jobs_dispatched_total", "scheduler" => name.clone()).increment(dispatched as u64);
    histogram!("geo_sweep_duration_seconds", "scheduler" => name).record(duration.as_secs_f64());
}

/// Record a sweep skipped (node lacks the role, or disabled).
pub fn record_sweep_skipped(scheduler: &str) {
    counter!("geo_sweeps_skipped_total", "scheduler" => scheduler.to_string()).increment(1);
}

/// Record a sweep that failed.
pub fn record_sweep_failure(scheduler: &str, error_kind: &str) {
    counter!(
        "geo_sweep_failures_total",
        "scheduler" => scheduler.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

// =============================================================================
// Engine & Circuit Breaker Metrics
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encoded numerically for alerting.
    let value = match state {
        "Created" => 0.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("geo_engine_state").set(value);
}

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "geo_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state with no recorder installed in
    // tests, so these only check the functions accept edge-case inputs.

    #[test]
    fn test_store_and_registry_metrics() {
        store_retries_total("registry_update");
        store_retries_total("");
        record_registry_registered("repository");
        record_registry_conflict();
        record_registry_transition("pending", "started");
        set_stuck_resources(0);
        set_stuck_resources(u64::MAX);
    }

    #[test]
    fn test_event_metrics() {
        record_event_appended("repository_updated");
        record_event_processed("repository_updated", "applied");
        record_event_processed("repository_renamed", "out_of_scope");
        record_handler_failure("repository_created", "external");
    }

    #[test]
    fn test_cursor_metrics() {
        set_cursor_position("secondary-1", 0);
        set_cursor_position("secondary-1", i64::MAX);
        set_cursor_lag("secondary-1", 0);
        record_cursor_batch("secondary-1", 100, 98, Duration::from_millis(40));
        record_cursor_batch("secondary-1", 0, 0, Duration::ZERO);
        record_cursor_blocked("secondary-1");
    }

    #[test]
    fn test_record_cursor_flush() {
        record_cursor_flush(3, 0);
        record_cursor_flush(0, 2);
    }

    #[test]
    fn test_dispatch_and_job_metrics() {
        record_job_dispatched("sync", "default");
        record_job_skipped("at_capacity");
        set_shard_in_flight("default", 0);
        set_shard_in_flight("default", usize::MAX);
        record_job_completed("verify", "mismatch");
    }

    #[test]
    fn test_sweep_metrics() {
        record_sweep("secondary", Duration::from_millis(120), 8);
        record_sweep("primary", Duration::ZERO, 0);
        record_sweep_skipped("primary");
        record_sweep_failure("secondary", "config");
    }

    #[test]
    fn test_set_engine_state_all_states() {
        for state in ["Created", "Running", "ShuttingDown", "Stopped", "Failed", "Unknown"] {
            set_engine_state(state);
        }
    }

    #[test]
    fn test_record_circuit_call() {
        record_circuit_call("transport_transfers", "success");
        record_circuit_call("transport_checks", "rejected");
    }
}
