// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only status interface over the registry, dispatch locks and cursors.
//!
//! Everything returned here is `Serialize`, ready to be rendered by an admin
//! endpoint or dumped as JSON.

use crate::circuit_breaker::TransportCircuitMetrics;
use crate::dispatch::{Dispatcher, ShardLock};
use crate::error::Result;
use crate::log_cursor::{CursorStatus, CursorStatusBoard};
use crate::registry::{RegistryFilter, RegistryRecord, RegistryStore, ResourceKey, SyncState};
use crate::worker::{JobFailureCounts, SyncWorker};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Row counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    /// Keyed by state name, every state present.
    pub by_state: BTreeMap<String, u64>,
    pub total: u64,
    /// Failed rows past the retry limit.
    pub stuck: u64,
}

impl StatusSummary {
    pub fn count(&self, state: SyncState) -> u64 {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// Everything at once.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub summary: StatusSummary,
    pub cursors: Vec<CursorStatus>,
    pub shard_locks: Vec<ShardLock>,
    pub transport: Option<TransportCircuitMetrics>,
    pub job_failures: Option<JobFailureCounts>,
}

#[derive(Clone)]
pub struct StatusService {
    registry: RegistryStore,
    dispatcher: Arc<Dispatcher>,
    cursors: CursorStatusBoard,
    max_retries: u32,
    worker: Option<Arc<SyncWorker>>,
}

impl StatusService {
    pub fn new(
        registry: RegistryStore,
        dispatcher: Arc<Dispatcher>,
        cursors: CursorStatusBoard,
        max_retries: u32,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            cursors,
            max_retries,
            worker: None,
        }
    }

    /// Include the worker's transport breaker and failure counters in reports.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<SyncWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Registry row of one resource.
    pub async fn resource(&self, key: ResourceKey) -> Result<Option<RegistryRecord>> {
        self.registry.get(key).await
    }

    pub async fn list(&self, filter: &RegistryFilter) -> Result<Vec<RegistryRecord>> {
        self.registry.list(filter).await
    }

    pub async fn summary(&self) -> Result<StatusSummary> {
        let counts = self.registry.count_by_state().await?;
        let by_state: BTreeMap<String, u64> = SyncState::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
            .collect();
        let total = by_state.values().sum();
        let stuck = self.registry.count_stuck(self.max_retries).await?;
        Ok(StatusSummary {
            by_state,
            total,
            stuck,
        })
    }

    /// Failed rows that exhausted their retries. They wait for a manual
    /// resync or an upstream change.
    pub async fn stuck(&self, limit: usize) -> Result<Vec<RegistryRecord>> {
        self.registry.stuck(self.max_retries, limit).await
    }

    /// Cursor status of every node this engine consumed events for, sorted
    /// by node id.
    pub async fn cursors(&self) -> Vec<CursorStatus> {
        let mut cursors: Vec<CursorStatus> = self.cursors.read().await.values().cloned().collect();
        cursors.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        cursors
    }

    pub async fn cursor(&self, node_id: &str) -> Option<CursorStatus> {
        self.cursors.read().await.get(node_id).cloned()
    }

    pub async fn shard_locks(&self) -> Vec<ShardLock> {
        self.dispatcher.shard_locks().await
    }

    pub fn transport(&self) -> Option<TransportCircuitMetrics> {
        self.worker.as_ref().map(|w| w.circuit_metrics())
    }

    /// Failed job attempts counted by the worker, including those with no
    /// registry row left to record them on.
    pub fn job_failures(&self) -> Option<JobFailureCounts> {
        self.worker.as_ref().map(|w| w.failure_counts())
    }

    pub async fn report(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            summary: self.summary().await?,
            cursors: self.cursors().await,
            shard_locks: self.shard_locks().await,
            transport: self.transport(),
            job_failures: self.job_failures(),
        })
    }
}
