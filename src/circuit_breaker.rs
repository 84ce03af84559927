// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker around the data transport.
//!
//! When the link to the primary degrades, every sync job would otherwise
//! sit in a transfer timeout. The breaker makes workers fail fast instead;
//! the jobs are marked `failed` and retried by later sweeps with backoff.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Transport unhealthy, calls fail fast without attempting
//! - **HalfOpen**: Probing recovery, limited calls allowed
//!
//! # Usage
//!
//! ```rust,no_run
//! # use geo_replication_engine::circuit_breaker::{TransportCircuit, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = TransportCircuit::new();
//!
//! match circuit.transfers.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, mark failed */ }
//!     Err(CircuitError::Inner(e)) => { /* transport error */ }
//! }
//! # Ok(())
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips faster and recovers cautiously. Used for bulk transfers.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Fast recovery for tests.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Check if circuit is likely open (based on recent rejections).
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }
}

/// Breakers for transport calls.
///
/// Transfers (sync, remove) and checks (checksum) fail differently, so a
/// flood of slow transfers does not stop verification and vice versa.
pub struct TransportCircuit {
    pub transfers: CircuitBreaker,
    pub checks: CircuitBreaker,
}

impl Default for TransportCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportCircuit {
    pub fn new() -> Self {
        Self::with_configs(CircuitConfig::aggressive(), CircuitConfig::default())
    }

    pub fn with_configs(transfers: CircuitConfig, checks: CircuitConfig) -> Self {
        Self {
            transfers: CircuitBreaker::new("transport_transfers", transfers),
            checks: CircuitBreaker::new("transport_checks", checks),
        }
    }

    pub fn metrics(&self) -> TransportCircuitMetrics {
        TransportCircuitMetrics {
            transfers_total: self.transfers.calls_total(),
            transfers_failures: self.transfers.failures(),
            transfers_rejections: self.transfers.rejections(),
            checks_total: self.checks.calls_total(),
            checks_failures: self.checks.failures(),
            checks_rejections: self.checks.rejections(),
        }
    }

    pub fn any_open(&self) -> bool {
        self.transfers.is_likely_open() || self.checks.is_likely_open()
    }
}

/// Counters from both transport breakers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportCircuitMetrics {
    pub transfers_total: u64,
    pub transfers_failures: u64,
    pub transfers_rejections: u64,
    pub checks_total: u64,
    pub checks_failures: u64,
    pub checks_rejections: u64,
}
