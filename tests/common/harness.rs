// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Secondary-side harness.
//!
//! Wires the registry, event log, cursor store, dispatcher, handlers and log
//! cursor on one SQLite pool, with the in-memory job queue and a
//! [`FlakyRouter`] that starts out healthy.

#![allow(dead_code)]

use super::mocks::FlakyRouter;
use geo_replication_engine::db::open_pool;
use geo_replication_engine::external::{
    MemoryInspector, MemoryJobQueue, ResourceRoute, StaticShardHealth, Transport,
};
use geo_replication_engine::log_cursor::AdvanceStats;
use geo_replication_engine::scheduler::SchedulerContext;
use geo_replication_engine::{
    ChangeBus, CursorStore, Dispatcher, Event, EventHandlers, EventKind, EventSource, JobOutcome,
    LogCursor, Node, PrimaryScheduler, RegistryRecord, RegistryStore, ReplicationSettings, ResourceKey, Result,
    SecondaryScheduler, ShardScheduler, SqliteEventLog, StoreConfig, SweepStats, SyncWorker,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::watch;

pub const SECONDARY_ID: &str = "secondary-1";

pub struct Harness {
    pub pool: SqlitePool,
    pub settings: ReplicationSettings,
    pub registry: RegistryStore,
    pub log: SqliteEventLog,
    pub cursors: CursorStore,
    pub router: Arc<FlakyRouter>,
    pub health: Arc<StaticShardHealth>,
    pub queue: Arc<MemoryJobQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub handlers: Arc<EventHandlers>,
    pub cursor: LogCursor,
    pub node_tx: watch::Sender<Node>,
    pub node_rx: watch::Receiver<Node>,
}

impl Harness {
    /// In-memory store, default settings, log cursor on the SQLite log.
    pub async fn new() -> Self {
        Self::open(StoreConfig::in_memory(), ReplicationSettings::default(), None).await
    }

    pub async fn with_settings(settings: ReplicationSettings) -> Self {
        Self::open(StoreConfig::in_memory(), settings, None).await
    }

    /// In-memory store whose log cursor reads from `source`.
    pub async fn with_source(source: Arc<dyn EventSource>) -> Self {
        Self::open(StoreConfig::in_memory(), ReplicationSettings::default(), Some(source)).await
    }

    pub async fn open(
        store: StoreConfig,
        settings: ReplicationSettings,
        source: Option<Arc<dyn EventSource>>,
    ) -> Self {
        let pool = open_pool(&store).await.expect("open pool");
        let registry = RegistryStore::new(pool.clone(), ChangeBus::new())
            .await
            .expect("registry");
        let log = SqliteEventLog::new(pool.clone()).await.expect("event log");
        let cursors = CursorStore::new(pool.clone()).await.expect("cursor store");
        let router = Arc::new(FlakyRouter::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            SECONDARY_ID,
            queue.clone(),
            settings.dispatch.lock_ttl(),
        ));
        let handlers = Arc::new(EventHandlers::new(
            registry.clone(),
            dispatcher.clone(),
            router.clone(),
            settings.scheduler.clone(),
        ));
        let source = source.unwrap_or_else(|| Arc::new(log.clone()));
        let cursor = LogCursor::new(
            source,
            cursors.clone(),
            handlers.clone(),
            settings.log_cursor.batch_size,
        );
        let (node_tx, node_rx) = watch::channel(Node::secondary(SECONDARY_ID));

        Self {
            pool,
            settings,
            registry,
            log,
            cursors,
            router,
            health: Arc::new(StaticShardHealth::new(["default"])),
            queue,
            dispatcher,
            handlers,
            cursor,
            node_tx,
            node_rx,
        }
    }

    pub fn node(&self) -> Node {
        self.node_rx.borrow().clone()
    }

    pub fn set_node(&self, node: Node) {
        let _ = self.node_tx.send(node);
    }

    /// Make a resource known upstream.
    pub fn add_route(&self, route: ResourceRoute) {
        self.router.inner.insert(route);
    }

    /// Add a route and create its `pending` row.
    pub async fn track(&self, route: ResourceRoute) -> RegistryRecord {
        self.add_route(route.clone());
        let (record, _) = self
            .registry
            .register(&route, geo_replication_engine::ResyncFlags::all())
            .await
            .expect("register");
        record
    }

    pub async fn record(&self, key: ResourceKey) -> Option<RegistryRecord> {
        self.registry.get(key).await.expect("registry read")
    }

    pub async fn append(&self, kind: EventKind, key: ResourceKey) -> Event {
        self.log.append(kind, Some(key)).await.expect("append")
    }

    pub async fn advance(&self) -> Result<AdvanceStats> {
        self.cursor.advance(&self.node()).await
    }

    fn context(&self, dispatcher: Arc<Dispatcher>, inspector: Arc<MemoryInspector>) -> SchedulerContext {
        SchedulerContext {
            registry: self.registry.clone(),
            dispatcher,
            router: self.router.clone(),
            health: self.health.clone(),
            inspector,
            event_log: self.log.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn scheduler(&self) -> SecondaryScheduler {
        self.scheduler_with(self.dispatcher.clone())
    }

    /// A sweep as another worker process would run it: same registry, its
    /// own dispatch locks.
    pub fn scheduler_with(&self, dispatcher: Arc<Dispatcher>) -> SecondaryScheduler {
        SecondaryScheduler::new(self.context(dispatcher, Arc::new(MemoryInspector::new())))
    }

    /// Primary sweep over this harness's router and event log.
    pub fn primary_scheduler(&self, inspector: Arc<MemoryInspector>) -> PrimaryScheduler {
        PrimaryScheduler::new(self.context(self.dispatcher.clone(), inspector))
    }

    pub async fn sweep(&self) -> Result<SweepStats> {
        self.scheduler().sweep(&self.node_rx).await
    }

    pub fn worker(&self, transport: Arc<dyn Transport>) -> SyncWorker {
        SyncWorker::new(
            self.registry.clone(),
            self.dispatcher.clone(),
            self.router.clone(),
            transport,
            self.settings.scheduler.retry_config(),
        )
    }

    /// Run every queued job to completion, oldest first.
    pub async fn drain(&self, worker: &SyncWorker) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(job) = self.queue.take_next() {
            outcomes.push(worker.run(job).await.expect("job run"));
        }
        outcomes
    }
}
