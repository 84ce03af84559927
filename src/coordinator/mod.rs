// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The event log ([`crate::event::SqliteEventLog`]) and, on secondaries, the
//!   log cursor consuming it ([`crate::log_cursor::LogCursor`])
//! - The registry and dispatcher shared by handlers, sweeps and the worker
//! - The shard scheduler picked by the local node's role
//!
//! # Architecture
//!
//! ```text
//!  primary                         secondary
//!  ───────                         ─────────
//!  emit() ──► event log ─────────► log cursor loop ──► handlers ──┐
//!                                                                 ▼
//!  primary sweep                   secondary sweep ──────► dispatcher ──► job queue
//!  (checksums, cleanup)                                           ▲            │
//!                                                                 │            ▼
//!                                  worker.run(job) ◄──────────────┴──── transport
//! ```
//!
//! The engine owns the tasks: a cursor loop, a scheduler loop and a periodic
//! cursor flush. Node changes are pushed with [`ReplicationEngine::update_node`]
//! and observed by every running loop.

mod cursor_loop;
mod sweep_loop;
mod types;

pub use cursor_loop::run_log_cursor;
pub use sweep_loop::run_scheduler;
pub use types::{EngineState, HealthCheck};

use crate::config::ReplicationConfig;
use crate::cursor::CursorStore;
use crate::db;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{ReplicationError, Result};
use crate::event::{Event, EventKind, EventSource, SqliteEventLog};
use crate::external::{
    ContentInspector, JobQueue, MemoryInspector, MemoryJobQueue, MemoryRouter, NoOpTransport,
    ResourceRouter, ShardHealth, StaticShardHealth, Transport,
};
use crate::handlers::EventHandlers;
use crate::log_cursor::{CursorStatusBoard, LogCursor};
use crate::metrics;
use crate::node::{Node, NodeRole};
use crate::notify::{ChangeBus, ResourceChange};
use crate::registry::{RegistryStore, ResourceKey, ResyncFlags};
use crate::resilience::RateLimiter;
use crate::scheduler::{build_scheduler, SchedulerContext, ShardScheduler};
use crate::selective_sync::resource_in_scope;
use crate::status::StatusService;
use crate::worker::SyncWorker;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Interval of the background cursor flush.
const CURSOR_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for each task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The systems the engine talks to but does not own.
pub struct Collaborators {
    pub router: Arc<dyn ResourceRouter>,
    pub health: Arc<dyn ShardHealth>,
    pub queue: Arc<dyn JobQueue>,
    pub transport: Arc<dyn Transport>,
    pub inspector: Arc<dyn ContentInspector>,
    /// Where the log cursor reads events. `None` reads the engine's own
    /// SQLite event log (single database shared with the primary).
    pub event_source: Option<Arc<dyn EventSource>>,
}

impl Collaborators {
    /// In-memory collaborators for standalone mode and tests.
    pub fn in_memory() -> Self {
        Self {
            router: Arc::new(MemoryRouter::new()),
            health: Arc::new(StaticShardHealth::new(["default"])),
            queue: Arc::new(MemoryJobQueue::new()),
            transport: Arc::new(NoOpTransport::default()),
            inspector: Arc::new(MemoryInspector::new()),
            event_source: None,
        }
    }
}

/// The main replication engine.
///
/// On the primary it appends events and reconciles checksums. On a
/// secondary it consumes the event log, runs sweeps and hands jobs to the
/// job processor; [`worker`](Self::worker) executes them.
pub struct ReplicationEngine {
    config: ReplicationConfig,

    /// Local node, observed by every loop
    node_tx: watch::Sender<Node>,
    node_rx: watch::Receiver<Node>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    pool: SqlitePool,
    event_log: SqliteEventLog,
    cursors: CursorStore,
    registry: RegistryStore,
    dispatcher: Arc<Dispatcher>,
    router: Arc<dyn ResourceRouter>,
    log_cursor: Arc<LogCursor>,
    scheduler_ctx: SchedulerContext,
    worker: Arc<SyncWorker>,
    status: StatusService,

    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// Open the stores and wire the components.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to spawn the loops.
    pub async fn new(config: ReplicationConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let node = config.local_node()?;

        let pool = db::open_pool(&config.store).await?;
        let event_log = SqliteEventLog::new(pool.clone()).await?;
        let cursors = CursorStore::new(pool.clone()).await?;
        let registry = RegistryStore::new(pool.clone(), ChangeBus::new()).await?;

        let settings = config.settings.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            node.id.clone(),
            collaborators.queue.clone(),
            settings.dispatch.lock_ttl(),
        ));
        let handlers = Arc::new(EventHandlers::new(
            registry.clone(),
            dispatcher.clone(),
            collaborators.router.clone(),
            settings.scheduler.clone(),
        ));

        let source: Arc<dyn EventSource> = match collaborators.event_source {
            Some(source) => source,
            None => Arc::new(event_log.clone()),
        };
        let board: CursorStatusBoard = Arc::new(RwLock::new(HashMap::new()));
        let mut log_cursor = LogCursor::new(
            source,
            cursors.clone(),
            handlers,
            settings.log_cursor.batch_size,
        )
        .with_status_board(board.clone());
        if let Some(limit) = settings.log_cursor.rate_limit_config() {
            info!(
                rate_per_sec = limit.refill_rate,
                burst = limit.burst_size,
                "Rate limiting enabled for log cursor"
            );
            log_cursor = log_cursor.with_rate_limiter(RateLimiter::new(limit));
        }

        let worker = Arc::new(SyncWorker::new(
            registry.clone(),
            dispatcher.clone(),
            collaborators.router.clone(),
            collaborators.transport,
            settings.scheduler.retry_config(),
        ));
        let status = StatusService::new(
            registry.clone(),
            dispatcher.clone(),
            board,
            settings.scheduler.max_retries,
        )
        .with_worker(worker.clone());

        let scheduler_ctx = SchedulerContext {
            registry: registry.clone(),
            dispatcher: dispatcher.clone(),
            router: collaborators.router.clone(),
            health: collaborators.health,
            inspector: collaborators.inspector,
            event_log: event_log.clone(),
            settings,
        };

        let (node_tx, node_rx) = watch::channel(node);
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_engine_state("Created");

        Ok(Self {
            config,
            node_tx,
            node_rx,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            pool,
            event_log,
            cursors,
            registry,
            dispatcher,
            router: collaborators.router,
            log_cursor: Arc::new(log_cursor),
            scheduler_ctx,
            worker,
            status,
            handles: RwLock::new(Vec::new()),
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn node_id(&self) -> &str {
        &self.config.local_node_id
    }

    /// Current local node.
    pub fn node(&self) -> Node {
        self.node_rx.borrow().clone()
    }

    /// Replace the local node (enable flag, role, selective sync).
    ///
    /// Running loops see the change before their next dispatch.
    pub fn update_node(&self, node: Node) -> Result<()> {
        if node.id != self.config.local_node_id {
            return Err(ReplicationError::Config(format!(
                "node '{}' is not the local node '{}'",
                node.id, self.config.local_node_id
            )));
        }
        info!(
            node_id = %node.id,
            role = %node.role,
            enabled = node.enabled,
            "Local node updated"
        );
        self.node_tx.send_replace(node);
        Ok(())
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn event_log(&self) -> &SqliteEventLog {
        &self.event_log
    }

    /// Executes jobs from the job processor against the transport.
    pub fn worker(&self) -> Arc<SyncWorker> {
        self.worker.clone()
    }

    pub fn status(&self) -> &StatusService {
        &self.status
    }

    /// Subscribe to registry change notifications.
    pub fn changes(&self) -> broadcast::Receiver<ResourceChange> {
        self.registry.changes().subscribe()
    }

    /// The scheduler matching the local node's role.
    pub fn scheduler(&self) -> Box<dyn ShardScheduler> {
        build_scheduler(self.node().role, self.scheduler_ctx.clone())
    }

    /// Get health status for monitoring endpoints.
    ///
    /// **Performance**: no store or network I/O; everything comes from
    /// cached state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let node = self.node();
        let cursor = self.status.cursor(&node.id).await;
        let transport = self.worker.circuit_metrics();
        let transport_circuit_open = self.worker.circuit_open();

        let cursor_blocked_event_id = cursor.as_ref().and_then(|c| c.blocked_event_id);
        let ready = state == EngineState::Running;
        let healthy = ready && cursor_blocked_event_id.is_none() && !transport_circuit_open;

        HealthCheck {
            state,
            node_id: node.id,
            role: node.role,
            node_enabled: node.enabled,
            ready,
            healthy,
            cursor_blocked_event_id,
            cursor_lag: cursor.as_ref().map(|c| c.lag()),
            transport_circuit_open,
            transport,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Producer and admin operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Append an event to the log. Primary only.
    ///
    /// Updates, creations and renames clear the primary's stored checksum
    /// for the resource, so the next checksum sweep does not mistake them
    /// for out-of-band changes.
    pub async fn emit(&self, kind: EventKind, resource: Option<ResourceKey>) -> Result<Event> {
        let node = self.node();
        if !node.is_primary() {
            return Err(ReplicationError::InvalidState {
                expected: "primary".to_string(),
                actual: node.role.to_string(),
            });
        }

        if let Some(key) = resource {
            let clears_checksum = matches!(
                kind,
                EventKind::RepositoryCreated
                    | EventKind::RepositoryUpdated { .. }
                    | EventKind::RepositoryRenamed { .. }
            );
            if clears_checksum {
                self.registry
                    .update(key, |r| {
                        r.checksum = None;
                        r.verified_at = None;
                        Ok(())
                    })
                    .await?;
            }
        }

        let event = self.event_log.append(kind, resource).await?;
        debug!(event_id = event.id, kind = event.kind.name(), "Event emitted");
        Ok(event)
    }

    /// Manually resync a resource on this secondary.
    ///
    /// Raises every resync flag and resets the retry counter, so a stuck
    /// row gets a fresh set of attempts. Registers the resource first if
    /// it has no row.
    pub async fn resync(&self, key: ResourceKey) -> Result<DispatchOutcome> {
        let node = self.node();
        if !node.is_active_as(NodeRole::Secondary) {
            return Err(ReplicationError::InvalidState {
                expected: "enabled secondary".to_string(),
                actual: format!("{} (enabled: {})", node.role, node.enabled),
            });
        }

        if self.registry.get(key).await?.is_none() {
            let route = self
                .router
                .route(key)
                .await
                .map_err(|e| ReplicationError::external("router.route", e.to_string()))?;
            let Some(route) = route else {
                warn!(resource = %key, "Resync requested for unknown resource");
                return Ok(DispatchOutcome::Skipped);
            };
            if !resource_in_scope(&node, &route)? {
                return Ok(DispatchOutcome::Skipped);
            }
            self.registry.register(&route, ResyncFlags::all()).await?;
        }

        let Some(record) = self
            .registry
            .update(key, |r| {
                r.request_resync(ResyncFlags::all());
                Ok(())
            })
            .await?
        else {
            return Ok(DispatchOutcome::Skipped);
        };

        let scheduler = &self.config.settings.scheduler;
        info!(resource = %key, "Manual resync requested");
        self.dispatcher
            .schedule_sync(
                &self.registry,
                &record,
                scheduler.max_concurrency_for(&record.shard),
                "manual_resync",
                &scheduler.retry_config(),
            )
            .await
    }

    /// Move the local node's cursor, e.g. to skip a poisoned event.
    pub async fn reset_cursor(&self, event_id: i64) -> Result<()> {
        warn!(node_id = %self.config.local_node_id, event_id, "Resetting log cursor");
        self.log_cursor.reset(&self.config.local_node_id, event_id).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the replication engine.
    ///
    /// 1. Rebuilds dispatch locks from the job processor's in-flight jobs
    /// 2. Spawns the log cursor loop (if enabled)
    /// 3. Spawns the scheduler loop for the node's role (if enabled)
    /// 4. Spawns the cursor flush task
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let node = self.node();
        info!(
            node_id = %node.id,
            role = %node.role,
            enabled = node.enabled,
            "Starting replication engine"
        );

        match self.dispatcher.rebuild().await {
            Ok(count) => debug!(count, "Dispatch locks rebuilt"),
            Err(e) => {
                error!(error = %e, "Failed to rebuild dispatch locks");
                let _ = self.state_tx.send(EngineState::Failed);
                metrics::set_engine_state("Failed");
                return Err(e);
            }
        }

        let settings = &self.config.settings;
        let mut handles = self.handles.write().await;

        if settings.log_cursor.enabled {
            let cursor = self.log_cursor.clone();
            let node_rx = self.node_rx.clone();
            let config = settings.log_cursor.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_log_cursor(cursor, node_rx, config, shutdown_rx).await;
            }));
            info!("Spawned log cursor");
        }

        let scheduler_enabled = match node.role {
            NodeRole::Primary => settings.primary.enabled,
            NodeRole::Secondary => settings.scheduler.enabled,
        };
        if scheduler_enabled {
            let scheduler: Arc<dyn ShardScheduler> =
                Arc::from(build_scheduler(node.role, self.scheduler_ctx.clone()));
            let node_rx = self.node_rx.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            let name = scheduler.name();
            handles.push(tokio::spawn(async move {
                run_scheduler(scheduler, node_rx, shutdown_rx).await;
            }));
            info!(scheduler = name, "Spawned scheduler");
        }

        let cursors = self.cursors.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(CURSOR_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = cursors.flush_dirty().await {
                            warn!(error = %e, "Failed to flush cursors");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Cursor flush task stopping");
                            break;
                        }
                    }
                }
            }
        }));
        drop(handles);

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!("Replication engine running");
        Ok(())
    }

    /// Shutdown the replication engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal all loops to stop
    /// 2. Wait for them to finish (with timeout)
    /// 3. Flush cursors
    /// 4. Checkpoint and close the database
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        self.cursors.close().await;
        if !self.config.store.is_in_memory() {
            if let Err(e) = db::checkpoint(&self.pool).await {
                warn!(error = %e, "WAL checkpoint failed during shutdown");
            }
        }
        self.pool.close().await;

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Replication engine stopped");
    }
}
