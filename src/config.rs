// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use geo_replication_engine::config::ReplicationConfig;
//! use geo_replication_engine::node::Node;
//!
//! let config = ReplicationConfig {
//!     local_node_id: "secondary-1".into(),
//!     nodes: vec![Node::primary("primary"), Node::secondary("secondary-1")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_node_id: String          # This node's unique ID
//! ├── nodes: Vec<Node>               # Node directory (one enabled primary)
//! ├── settings: ReplicationSettings
//! │   ├── log_cursor: LogCursorConfig
//! │   ├── scheduler: SchedulerConfig # Secondary sweep
//! │   ├── primary: PrimarySchedulerConfig
//! │   └── dispatch: DispatchConfig
//! └── store: StoreConfig             # SQLite persistence
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "local_node_id": "eu-secondary",
//!   "nodes": [
//!     { "id": "us-primary", "role": "primary" },
//!     { "id": "eu-secondary", "role": "secondary",
//!       "selective_sync_type": "shards",
//!       "selective_sync_shards": ["default"] }
//!   ],
//!   "settings": {
//!     "log_cursor": { "batch_size": 500, "poll_interval": "2s" },
//!     "scheduler": { "interval_sec": 60, "max_concurrency_per_shard": 10 }
//!   },
//!   "store": { "sqlite_path": "/var/lib/geo/tracking.db" }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::node::{Node, NodeDirectory};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// The identity of the local node running this engine.
    /// Must name one of the entries in `nodes`.
    pub local_node_id: String,

    /// Node directory: the primary and every secondary.
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Tunables for the log cursor, schedulers and dispatch.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// SQLite persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_node_id: "local.dev.node.default".to_string(),
            nodes: Vec::new(),
            settings: ReplicationSettings::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: one primary named `primary`,
    /// the local node as a secondary (unless it *is* `primary`), in-memory store.
    pub fn for_testing(local_node_id: &str) -> Self {
        let mut nodes = vec![Node::primary("primary")];
        if local_node_id != "primary" {
            nodes.push(Node::secondary(local_node_id));
        }
        Self {
            local_node_id: local_node_id.to_string(),
            nodes,
            settings: ReplicationSettings::default(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Parse a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ReplicationError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Build the node directory from `nodes`.
    pub fn node_directory(&self) -> Result<NodeDirectory> {
        NodeDirectory::new(self.nodes.clone())
    }

    /// The local node's entry.
    pub fn local_node(&self) -> Result<Node> {
        self.node_directory()?
            .get(&self.local_node_id)
            .cloned()
            .ok_or_else(|| {
                ReplicationError::Config(format!(
                    "local node '{}' is not in the node directory",
                    self.local_node_id
                ))
            })
    }

    /// Validate the whole tree.
    ///
    /// The local node's selective-sync scope is *not* checked here: a
    /// malformed scope only disables that node's sweep.
    pub fn validate(&self) -> Result<()> {
        self.local_node()?;
        if self.settings.log_cursor.batch_size == 0 {
            return Err(ReplicationError::Config(
                "log_cursor.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.settings.scheduler.max_concurrency_per_shard == 0 {
            return Err(ReplicationError::Config(
                "scheduler.max_concurrency_per_shard must be greater than zero".to_string(),
            ));
        }
        if let Some((shard, _)) = self
            .settings
            .scheduler
            .shard_concurrency
            .iter()
            .find(|(_, limit)| **limit == 0)
        {
            return Err(ReplicationError::Config(format!(
                "scheduler.shard_concurrency for '{}' must be greater than zero",
                shard
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the replication logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub log_cursor: LogCursorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub primary: PrimarySchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LogCursorConfig: event log consumption
// ═══════════════════════════════════════════════════════════════════════════════

/// Log cursor (event log consumption) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogCursorConfig {
    /// Whether the log cursor runs on secondaries.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum events fetched per advance.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long to wait before polling again once caught up (e.g. "1s").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Ceiling for the backoff applied while a handler keeps failing.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    /// Rate-limit event processing.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained events per second when rate limiting.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size when rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_max_backoff() -> String {
    "5m".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for LogCursorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            poll_interval: "1s".to_string(),
            max_backoff: "5m".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

impl LogCursorConfig {
    /// Parse `poll_interval`, falling back to one second.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    /// Backoff schedule used while the cursor is blocked on a failing event.
    pub fn retry_config(&self) -> RetryConfig {
        let max_delay =
            humantime::parse_duration(&self.max_backoff).unwrap_or(Duration::from_secs(300));
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: self.poll_interval_duration(),
            max_delay,
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Rate limit configuration, `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SchedulerConfig: secondary shard sweep
// ═══════════════════════════════════════════════════════════════════════════════

/// Secondary shard scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the sweep runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,

    /// Default ceiling of simultaneous sync jobs per shard.
    #[serde(default = "default_max_concurrency_per_shard")]
    pub max_concurrency_per_shard: usize,

    /// Per-shard overrides of `max_concurrency_per_shard`.
    #[serde(default)]
    pub shard_concurrency: HashMap<String, usize>,

    /// Upper bound of jobs dispatched by a single sweep across all shards.
    #[serde(default = "default_max_jobs_per_sweep")]
    pub max_jobs_per_sweep: usize,

    /// Attempts after which a failed resource is reported as stuck.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before a failed resource becomes due again.
    #[serde(default = "default_retry_base_sec")]
    pub retry_base_sec: u64,

    /// Ceiling for the failed-resource backoff.
    #[serde(default = "default_retry_max_sec")]
    pub retry_max_sec: u64,

    /// Resources requested from the router per shard and type when
    /// discovering unregistered resources.
    #[serde(default = "default_discovery_batch_size")]
    pub discovery_batch_size: usize,

    /// Re-verify synced resources after this many seconds (0 disables).
    #[serde(default = "default_reverify_interval_sec")]
    pub reverify_interval_sec: u64,
}

fn default_interval_sec() -> u64 {
    60
}

fn default_max_concurrency_per_shard() -> usize {
    10
}

fn default_max_jobs_per_sweep() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_base_sec() -> u64 {
    60
}

fn default_retry_max_sec() -> u64 {
    3600
}

fn default_discovery_batch_size() -> usize {
    100
}

fn default_reverify_interval_sec() -> u64 {
    7 * 24 * 3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 60,
            max_concurrency_per_shard: 10,
            shard_concurrency: HashMap::new(),
            max_jobs_per_sweep: 1000,
            max_retries: 10,
            retry_base_sec: 60,
            retry_max_sec: 3600,
            discovery_batch_size: 100,
            reverify_interval_sec: 7 * 24 * 3600,
        }
    }
}

impl SchedulerConfig {
    /// Get the sweep interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    /// Concurrency ceiling for a shard.
    pub fn max_concurrency_for(&self, shard: &str) -> usize {
        self.shard_concurrency
            .get(shard)
            .copied()
            .unwrap_or(self.max_concurrency_per_shard)
    }

    /// Backoff schedule for failed resources (indexed by retry count).
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries as usize,
            initial_delay: Duration::from_secs(self.retry_base_sec),
            max_delay: Duration::from_secs(self.retry_max_sec),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Re-verification cadence, `None` when disabled.
    pub fn reverify_interval(&self) -> Option<Duration> {
        (self.reverify_interval_sec > 0).then(|| Duration::from_secs(self.reverify_interval_sec))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PrimarySchedulerConfig: checksum reconciliation
// ═══════════════════════════════════════════════════════════════════════════════

/// Primary shard scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimarySchedulerConfig {
    /// Whether checksum reconciliation runs on the primary.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "default_primary_interval_sec")]
    pub interval_sec: u64,

    /// Resources checksummed per shard per sweep.
    #[serde(default = "default_resources_per_shard")]
    pub resources_per_shard: usize,

    /// Concurrent checksum calculations.
    #[serde(default = "default_max_concurrent_checksums")]
    pub max_concurrent_checksums: usize,
}

fn default_primary_interval_sec() -> u64 {
    300
}

fn default_resources_per_shard() -> usize {
    100
}

fn default_max_concurrent_checksums() -> usize {
    8
}

impl Default for PrimarySchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 300,
            resources_per_shard: 100,
            max_concurrent_checksums: 8,
        }
    }
}

impl PrimarySchedulerConfig {
    /// Get the sweep interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Job dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Lifetime of a per-resource dispatch lock. A job that never reports
    /// back releases its lock (and its shard slot) after this long.
    #[serde(default = "default_lock_ttl_sec")]
    pub lock_ttl_sec: u64,
}

fn default_lock_ttl_sec() -> u64 {
    1800
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { lock_ttl_sec: 1800 }
    }
}

impl DispatchConfig {
    /// Get the lock TTL as a Duration.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite persistence configuration for the event log, cursors and registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Pool size for file-backed databases.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "geo_tracking.db".to_string(),
            wal_mode: true,
            max_connections: 4,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
        }
    }

    /// Config for a database file at `path`.
    pub fn at_path(path: impl AsRef<Path>) -> Self {
        Self {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    /// Whether this points at an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
