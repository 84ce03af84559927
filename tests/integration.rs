// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the full secondary pipeline.
//!
//! Events flow through the log cursor and handlers into the registry and
//! the job queue; sweeps and the worker close the loop. Everything runs on
//! SQLite, in memory or in a temp directory.
//!
//! Run with: cargo test --test integration

mod common;

use common::*;
use geo_replication_engine::external::{MemoryInspector, MemoryJobQueue, MemoryRouter, StaticShardHealth};
use geo_replication_engine::{
    Collaborators, DispatchOutcome, EngineState, EventKind, HandlerOutcome, JobKind, JobOutcome,
    Node, ReplicationConfig, ReplicationEngine, ReplicationError, ReplicationSettings, ResourceKey,
    StoreConfig, SyncState, UpdateSource,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn updated() -> EventKind {
    EventKind::RepositoryUpdated {
        source: UpdateSource::Repository,
    }
}

async fn mark_started(h: &Harness, key: ResourceKey) {
    h.registry.update(key, |r| r.mark_started()).await.unwrap();
}

async fn mark_synced(h: &Harness, key: ResourceKey) {
    h.registry
        .update(key, |r| {
            r.mark_synced(r.resync, r.resync_generation);
            Ok(())
        })
        .await
        .unwrap();
}

async fn request_verification(h: &Harness, key: ResourceKey) {
    h.registry
        .update(key, |r| {
            r.request_verification();
            Ok(())
        })
        .await
        .unwrap();
}

async fn verify(h: &Harness, key: ResourceKey, matches: bool) {
    request_verification(h, key).await;
    h.registry
        .update(key, |r| {
            r.verification_result(Some("abc".to_string()), matches);
            Ok(())
        })
        .await
        .unwrap();
}

/// Walk a freshly registered row to `state` through legal transitions.
async fn drive_to(h: &Harness, key: ResourceKey, state: SyncState) {
    match state {
        SyncState::Pending => {}
        SyncState::Started => mark_started(h, key).await,
        SyncState::Synced => {
            mark_started(h, key).await;
            mark_synced(h, key).await;
        }
        SyncState::Failed => {
            mark_started(h, key).await;
            let retry = h.settings.scheduler.retry_config();
            h.registry
                .update(key, |r| {
                    r.mark_failed("boom", &retry);
                    Ok(())
                })
                .await
                .unwrap();
        }
        SyncState::VerificationPending => request_verification(h, key).await,
        SyncState::VerificationSucceeded | SyncState::VerificationFailed => {
            mark_started(h, key).await;
            mark_synced(h, key).await;
            verify(h, key, state == SyncState::VerificationSucceeded).await;
        }
    }
    assert_eq!(h.record(key).await.unwrap().state, state);
}

// =============================================================================
// Event Stream
// =============================================================================

#[tokio::test]
async fn update_then_rename_dispatches_one_job_at_new_path() {
    let key = ResourceKey::repository(42);
    let source = VecEventSource::new(vec![
        event(101, updated(), Some(key)),
        event(
            102,
            EventKind::RepositoryRenamed {
                old_path: "group/project-42".to_string(),
                new_path: "group/renamed".to_string(),
            },
            Some(key),
        ),
    ]);
    let h = Harness::with_source(source).await;
    h.track(route(42, "default")).await;

    let stats = h.advance().await.unwrap();

    assert_eq!(stats.read, 2);
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.position, 102);
    assert_eq!(h.cursors.position(SECONDARY_ID).await, 102);

    let record = h.record(key).await.unwrap();
    assert_eq!(record.path, "group/renamed");
    assert_eq!(record.state, SyncState::Started);
    assert_eq!(record.last_event_id, 102);

    // One job, retargeted to the new path while in flight
    assert_eq!(h.queue.len(), 1);
    assert_eq!(
        h.dispatcher.current_target(key).await.as_deref(),
        Some("group/renamed")
    );
}

#[tokio::test]
async fn created_event_registers_and_syncs_resource() {
    let h = Harness::new().await;
    h.add_route(route(1, "default"));
    h.append(EventKind::RepositoryCreated, ResourceKey::repository(1)).await;

    h.advance().await.unwrap();
    let record = h.record(ResourceKey::repository(1)).await.unwrap();
    assert_eq!(record.state, SyncState::Started);
    assert!(record.resync.any());

    let transport = Arc::new(MockTransport::new());
    let worker = h.worker(transport.clone());
    let outcomes = h.drain(&worker).await;

    assert_eq!(outcomes, vec![JobOutcome::Synced]);
    let record = h.record(ResourceKey::repository(1)).await.unwrap();
    assert_eq!(record.state, SyncState::Synced);
    assert!(!record.resync.any());
    assert_eq!(transport.synced().len(), 1);
    assert!(!h.dispatcher.is_in_flight(ResourceKey::repository(1)).await);
}

#[tokio::test]
async fn redelivered_events_are_applied_once() {
    let h = Harness::new().await;
    h.track(route(1, "default")).await;
    h.append(updated(), ResourceKey::repository(1)).await;

    let first = h.advance().await.unwrap();
    assert_eq!(first.applied, 1);
    assert_eq!(h.queue.len(), 1);

    // Rewind and replay
    h.cursor.reset(SECONDARY_ID, 0).await.unwrap();
    let replay = h.advance().await.unwrap();

    assert_eq!(replay.read, 1);
    assert_eq!(replay.applied, 0);
    assert_eq!(replay.skipped, 1);
    assert_eq!(h.queue.len(), 1);
    assert_eq!(h.cursors.position(SECONDARY_ID).await, 1);
}

#[tokio::test]
async fn handler_redelivery_reports_already_applied() {
    let h = Harness::new().await;
    h.track(route(1, "default")).await;
    let e = h.append(updated(), ResourceKey::repository(1)).await;

    let node = h.node();
    assert_eq!(h.handlers.process(&node, &e).await.unwrap(), HandlerOutcome::Applied);
    let again = h.handlers.process(&node, &e).await.unwrap();
    assert!(matches!(again, HandlerOutcome::Skipped(_)));
}

#[tokio::test]
async fn delete_event_removes_row_and_enqueues_removal() {
    let h = Harness::new().await;
    h.track(route(5, "default")).await;
    h.append(
        EventKind::RepositoryDeleted {
            path: "group/project-5".to_string(),
        },
        ResourceKey::repository(5),
    )
    .await;

    h.advance().await.unwrap();
    assert!(h.record(ResourceKey::repository(5)).await.is_none());

    let jobs = h.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Remove);
    assert_eq!(jobs[0].target_path, "group/project-5");

    let transport = Arc::new(MockTransport::new());
    let outcomes = h.drain(&h.worker(transport.clone())).await;
    assert_eq!(outcomes, vec![JobOutcome::Removed]);
    assert_eq!(transport.removed().len(), 1);
}

// =============================================================================
// Selective Sync
// =============================================================================

#[tokio::test]
async fn events_outside_selective_sync_scope_are_skipped() {
    let h = Harness::new().await;
    h.set_node(Node::secondary(SECONDARY_ID).with_shards(["default"]));
    h.add_route(route(7, "nfs-02"));
    h.add_route(route(8, "default"));
    h.append(EventKind::RepositoryCreated, ResourceKey::repository(7)).await;
    h.append(EventKind::RepositoryCreated, ResourceKey::repository(8)).await;

    let stats = h.advance().await.unwrap();

    assert_eq!(stats.applied, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.position, 2);
    assert!(h.record(ResourceKey::repository(7)).await.is_none());
    assert!(h.record(ResourceKey::repository(8)).await.is_some());
}

#[tokio::test]
async fn narrowing_scope_purges_rows_on_next_sweep() {
    let h = Harness::new().await;
    h.health.set(["default", "nfs-02"]);
    h.track(route(1, "default")).await;
    h.track(route(2, "nfs-02")).await;

    h.set_node(Node::secondary(SECONDARY_ID).with_shards(["default"]));
    let stats = h.sweep().await.unwrap();

    assert_eq!(stats.removed, 1);
    assert!(h.record(ResourceKey::repository(2)).await.is_none());
    assert!(h.record(ResourceKey::repository(1)).await.is_some());
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn sweep_never_exceeds_shard_concurrency_ceiling() {
    let mut settings = ReplicationSettings::default();
    settings.scheduler.max_concurrency_per_shard = 2;
    let h = Harness::with_settings(settings).await;
    for id in 1..=5 {
        h.track(route(id, "default")).await;
    }

    let first = h.sweep().await.unwrap();
    assert_eq!(first.sync_dispatched, 2);
    assert_eq!(h.queue.len(), 2);
    assert_eq!(h.dispatcher.in_flight_count("default").await, 2);

    // Full shard: nothing more until a job finishes
    let second = h.sweep().await.unwrap();
    assert_eq!(second.sync_dispatched, 0);
    assert_eq!(h.queue.len(), 2);

    let worker = h.worker(Arc::new(MockTransport::new()));
    let job = h.queue.take_next().unwrap();
    assert_eq!(worker.run(job).await.unwrap(), JobOutcome::Synced);

    let third = h.sweep().await.unwrap();
    assert_eq!(third.sync_dispatched, 1);
    assert_eq!(h.dispatcher.in_flight_count("default").await, 2);

    let counts = h.registry.count_by_state().await.unwrap();
    assert_eq!(counts.get(&SyncState::Pending).copied(), Some(2));
    assert_eq!(counts.get(&SyncState::Synced).copied(), Some(1));
}

#[tokio::test]
async fn concurrent_dispatch_of_same_resource_creates_one_job() {
    let h = Harness::new().await;
    let record = h.track(route(1, "default")).await;
    let retry = h.settings.scheduler.retry_config();

    let (a, b) = tokio::join!(
        h.dispatcher.schedule_sync(&h.registry, &record, 10, "sweep", &retry),
        h.dispatcher.schedule_sync(&h.registry, &record, 10, "repository_updated", &retry),
    );

    let dispatched = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(DispatchOutcome::is_dispatched)
        .count();
    assert_eq!(dispatched, 1);
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn checksum_reset_forces_verification_from_every_state() {
    for state in SyncState::ALL {
        let h = Harness::new().await;
        let key = ResourceKey::repository(1);
        h.track(route(1, "default")).await;
        drive_to(&h, key, state).await;

        h.append(EventKind::ChecksumReset, key).await;
        h.advance().await.unwrap();

        let record = h.record(key).await.unwrap();
        assert_eq!(record.state, SyncState::VerificationPending, "from {}", state);
        assert_eq!(record.checksum, None, "from {}", state);
    }
}

#[tokio::test]
async fn failed_sync_becomes_stuck_until_upstream_change() {
    let mut settings = ReplicationSettings::default();
    settings.scheduler.max_retries = 2;
    let h = Harness::with_settings(settings).await;
    let key = ResourceKey::repository(1);
    let record = h.track(route(1, "default")).await;
    let retry = h.settings.scheduler.retry_config();

    let transport = Arc::new(MockTransport::new());
    transport.fail_next_syncs(2);
    let worker = h.worker(transport.clone());

    h.sweep().await.unwrap();
    let outcomes = h.drain(&worker).await;
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Failed { retry_count: 1, .. }]));

    // Backoff keeps the row out of the next sweep
    let stats = h.sweep().await.unwrap();
    assert_eq!(stats.sync_dispatched, 0);

    // Force the second attempt as if the backoff had elapsed
    let failed = h.record(key).await.unwrap();
    h.dispatcher
        .schedule_sync(&h.registry, &failed, 10, "retry", &retry)
        .await
        .unwrap();
    let outcomes = h.drain(&worker).await;
    assert!(matches!(outcomes.as_slice(), [JobOutcome::Failed { retry_count: 2, .. }]));

    let stats = h.sweep().await.unwrap();
    assert_eq!(stats.stuck, 1);
    assert_eq!(stats.sync_dispatched, 0);
    assert_eq!(h.registry.count_stuck(2).await.unwrap(), 1);

    // An upstream update restarts it
    h.append(updated(), record.key).await;
    h.advance().await.unwrap();
    assert_eq!(h.record(key).await.unwrap().retry_count, 0);

    let outcomes = h.drain(&worker).await;
    assert_eq!(outcomes, vec![JobOutcome::Synced]);
    assert_eq!(h.registry.count_stuck(2).await.unwrap(), 0);
}

#[tokio::test]
async fn verification_mismatch_triggers_resync() {
    let h = Harness::new().await;
    let key = ResourceKey::repository(1);
    h.track(route(1, "default")).await;
    h.router.inner.set_primary_checksum(key, Some("primary-sum".to_string()));
    drive_to(&h, key, SyncState::Synced).await;
    request_verification(&h, key).await;

    let transport = Arc::new(MockTransport::new());
    transport.set_local_checksum(Some("stale-sum"));
    let worker = h.worker(transport.clone());

    let stats = h.sweep().await.unwrap();
    assert_eq!(stats.verify_dispatched, 1);
    let outcomes = h.drain(&worker).await;
    assert_eq!(outcomes, vec![JobOutcome::Verified { matches: false }]);

    let record = h.record(key).await.unwrap();
    assert_eq!(record.state, SyncState::VerificationFailed);
    assert!(record.resync.repository);

    // The mismatch is picked up as a sync
    transport.set_local_checksum(Some("primary-sum"));
    let stats = h.sweep().await.unwrap();
    assert_eq!(stats.sync_dispatched, 1);
    assert_eq!(h.drain(&worker).await, vec![JobOutcome::Synced]);
    assert!(!h.record(key).await.unwrap().resync.repository);
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn cursor_survives_restart_without_reprocessing() {
    let dir = tempdir().unwrap();
    let store = StoreConfig::at_path(dir.path().join("geo.db"));
    let key = ResourceKey::repository(1);

    {
        let h = Harness::open(store.clone(), ReplicationSettings::default(), None).await;
        h.track(route(1, "default")).await;
        for _ in 0..3 {
            h.append(updated(), key).await;
        }
        let stats = h.advance().await.unwrap();
        assert_eq!(stats.position, 3);
        h.cursors.flush_dirty().await.unwrap();
        h.cursors.close().await;
        h.pool.close().await;
    }

    let h = Harness::open(store, ReplicationSettings::default(), None).await;
    assert_eq!(h.cursors.position(SECONDARY_ID).await, 3);
    assert_eq!(h.record(key).await.unwrap().last_event_id, 3);

    let stats = h.advance().await.unwrap();
    assert_eq!(stats.read, 0);
    assert_eq!(stats.position, 3);

    h.append(updated(), key).await;
    let stats = h.advance().await.unwrap();
    assert_eq!(stats.read, 1);
    assert_eq!(stats.position, 4);
    assert_eq!(h.record(key).await.unwrap().last_event_id, 4);
}

#[tokio::test]
async fn cursor_never_moves_backwards_on_set() {
    let h = Harness::new().await;
    h.cursors.set(SECONDARY_ID, 10).await.unwrap();
    let _ = h.cursors.set(SECONDARY_ID, 4).await;
    assert_eq!(h.cursors.position(SECONDARY_ID).await, 10);

    // Explicit reset is the only way back
    h.cursors.reset(SECONDARY_ID, 4).await.unwrap();
    assert_eq!(h.cursors.position(SECONDARY_ID).await, 4);
}

// =============================================================================
// Engine
// =============================================================================

fn fast_settings() -> ReplicationSettings {
    let mut settings = ReplicationSettings::default();
    settings.log_cursor.poll_interval = "10ms".to_string();
    settings
}

#[tokio::test]
async fn primary_events_reach_secondary_and_sync() {
    let mut primary_config = ReplicationConfig::for_testing("primary");
    primary_config.nodes.push(Node::secondary(SECONDARY_ID));
    primary_config.settings = fast_settings();
    let primary = ReplicationEngine::new(primary_config, Collaborators::in_memory())
        .await
        .unwrap();

    let router = Arc::new(MemoryRouter::new());
    router.insert(route(1, "default"));
    let queue = Arc::new(MemoryJobQueue::new());
    let mut secondary_config = ReplicationConfig::for_testing(SECONDARY_ID);
    secondary_config.settings = fast_settings();
    secondary_config.settings.scheduler.enabled = false;
    let mut secondary = ReplicationEngine::new(
        secondary_config,
        Collaborators {
            router,
            health: Arc::new(StaticShardHealth::new(["default"])),
            queue: queue.clone(),
            transport: Arc::new(MockTransport::new()),
            inspector: Arc::new(MemoryInspector::new()),
            event_source: Some(Arc::new(primary.event_log().clone())),
        },
    )
    .await
    .unwrap();
    secondary.start().await.unwrap();
    assert_eq!(secondary.state(), EngineState::Running);

    primary
        .emit(EventKind::RepositoryCreated, Some(ResourceKey::repository(1)))
        .await
        .unwrap();

    let mut job = None;
    for _ in 0..200 {
        job = queue.take_next();
        if job.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = job.expect("job dispatched from primary event");
    assert_eq!(job.kind, JobKind::Sync);

    let outcome = secondary.worker().run(job).await.unwrap();
    assert_eq!(outcome, JobOutcome::Synced);
    let record = secondary.registry().get(ResourceKey::repository(1)).await.unwrap().unwrap();
    assert_eq!(record.state, SyncState::Synced);

    let health = secondary.health_check().await;
    assert!(health.ready);
    assert_eq!(health.cursor_blocked_event_id, None);

    secondary.shutdown().await;
    assert_eq!(secondary.state(), EngineState::Stopped);
}

#[tokio::test]
async fn secondary_refuses_to_emit_events() {
    let engine = ReplicationEngine::new(
        ReplicationConfig::for_testing(SECONDARY_ID),
        Collaborators::in_memory(),
    )
    .await
    .unwrap();

    let result = engine
        .emit(EventKind::RepositoryCreated, Some(ResourceKey::repository(1)))
        .await;
    assert!(matches!(result, Err(ReplicationError::InvalidState { .. })));
}
