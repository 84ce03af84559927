// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Geo Replication Engine
//!
//! Keeps secondary instances' copies of repositories, wikis and attachments
//! consistent with a single primary.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                        geo-replication-engine                             │
//! │                                                                           │
//! │  primary                                                                  │
//! │  ┌──────────┐   append   ┌───────────┐                                    │
//! │  │ emit()   │──────────► │ Event log │ ◄── PrimaryScheduler               │
//! │  └──────────┘            │ (SQLite)  │     (checksum_reset events)        │
//! │                          └─────┬─────┘                                    │
//! │  secondary                     │ read_after(cursor)                       │
//! │  ┌───────────┐   process  ┌────▼──────┐   register / flag  ┌──────────┐   │
//! │  │ Handlers  │ ◄───────── │ LogCursor │                    │ Registry │   │
//! │  └─────┬─────┘            └───────────┘         ┌────────► │ (SQLite) │   │
//! │        │ dispatch                               │          └──────────┘   │
//! │  ┌─────▼──────┐  ◄── SecondaryScheduler (sweep) │                         │
//! │  │ Dispatcher │ ─────► job queue ──► SyncWorker ┘ (transport, circuit)    │
//! │  └────────────┘                                                           │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Path Replication
//!
//! 1. **Event path**: each secondary consumes the primary's event log in id
//!    order and turns events into registry changes and jobs.
//! 2. **Sweep path**: periodic shard sweeps discover missing resources,
//!    retry failures and verify checksums, catching anything the event path
//!    missed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use geo_replication_engine::{Collaborators, ReplicationConfig, ReplicationEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicationConfig::for_testing("secondary-1");
//!     let mut engine = ReplicationEngine::new(config, Collaborators::in_memory())
//!         .await
//!         .expect("Failed to create engine");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod checksum;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod external;
pub mod handlers;
pub mod log_cursor;
pub mod metrics;
pub mod node;
pub mod notify;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod selective_sync;
pub mod status;
pub mod worker;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, TransportCircuit};
pub use config::{
    DispatchConfig, LogCursorConfig, PrimarySchedulerConfig, ReplicationConfig, ReplicationSettings,
    SchedulerConfig, StoreConfig,
};
pub use coordinator::{Collaborators, EngineState, HealthCheck, ReplicationEngine};
pub use cursor::CursorStore;
pub use dispatch::{DispatchOutcome, Dispatcher, JobKind, SyncJob};
pub use error::{ReplicationError, Result};
pub use event::{Event, EventId, EventKind, EventSource, SqliteEventLog, UpdateSource};
pub use external::{
    ContentInspector, ExternalError, JobQueue, ResourceRoute, ResourceRouter, ShardHealth, Transport,
};
pub use handlers::{EventHandlers, HandlerOutcome, SkipReason};
pub use log_cursor::{CursorStatus, LogCursor};
pub use node::{Node, NodeDirectory, NodeRole, SelectiveSync};
pub use notify::{ChangeBus, ResourceChange};
pub use registry::{RegistryRecord, RegistryStore, ResourceKey, ResourceType, ResyncFlags, SubResource, SyncState};
pub use scheduler::{PrimaryScheduler, SecondaryScheduler, ShardScheduler, SweepStats};
pub use status::{StatusService, StatusSummary};
pub use worker::{JobFailureCounts, JobOutcome, SyncWorker};
