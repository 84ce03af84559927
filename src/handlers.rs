// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event handlers: apply one event to the registry of a secondary.
//!
//! A single `match` over [`EventKind`] is the dispatch table. Every handler
//! is idempotent: the registry row remembers the highest event id applied
//! to it and later redeliveries are skipped.
//!
//! | Event | Registry effect | Job |
//! |-------|-----------------|-----|
//! | created | register, flag repository + wiki | sync |
//! | updated | flag repository or wiki | sync |
//! | renamed | update path, retarget in-flight job | none |
//! | deleted | delete row | remove |
//! | checksum reset | clear checksum, `verification_pending` | none (sweep verifies) |
//! | attachments relocated | flag attachments | sync |
//! | cache invalidated | none, notification only | none |
//! | repositories changed | purge rows outside scope | none |
//!
//! Sync jobs go through the dispatcher, so a busy shard or a job already in
//! flight makes the enqueue a no-op; the raised flags keep the row due for the
//! next sweep. A failed enqueue marks the row `failed` and is not a handler
//! failure: the sweep retries it.

use crate::config::SchedulerConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{ReplicationError, Result};
use crate::event::{Event, EventKind, UpdateSource};
use crate::external::ResourceRouter;
use crate::node::Node;
use crate::notify::ResourceChange;
use crate::registry::{RegistryRecord, RegistryStore, ResourceKey, ResyncFlags, SubResource};
use crate::resilience::RetryConfig;
use crate::selective_sync::{in_scope, route_in_scope};
use std::sync::Arc;
use tracing::{debug, warn};

/// Why an event was processed without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The resource is outside the node's selective sync scope.
    OutOfScope,
    /// The event was applied before (redelivery).
    AlreadyApplied,
    /// No registry row and nothing to create one from.
    NotTracked,
    /// A node-targeted event for another node.
    NotForThisNode,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::OutOfScope => "out_of_scope",
            SkipReason::AlreadyApplied => "already_applied",
            SkipReason::NotTracked => "not_tracked",
            SkipReason::NotForThisNode => "not_for_this_node",
        }
    }
}

/// Result of a successfully processed event. Failure is the `Err` arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Applied,
    Skipped(SkipReason),
}

impl HandlerOutcome {
    fn label(&self) -> &'static str {
        match self {
            HandlerOutcome::Applied => "applied",
            HandlerOutcome::Skipped(reason) => reason.as_str(),
        }
    }
}

enum Lookup {
    Tracked(RegistryRecord),
    Skip(SkipReason),
}

/// The handler table shared by all log cursors of an engine.
pub struct EventHandlers {
    registry: RegistryStore,
    dispatcher: Arc<Dispatcher>,
    router: Arc<dyn ResourceRouter>,
    scheduler: SchedulerConfig,
    retry: RetryConfig,
}

impl EventHandlers {
    pub fn new(
        registry: RegistryStore,
        dispatcher: Arc<Dispatcher>,
        router: Arc<dyn ResourceRouter>,
        scheduler: SchedulerConfig,
    ) -> Self {
        let retry = scheduler.retry_config();
        Self {
            registry,
            dispatcher,
            router,
            scheduler,
            retry,
        }
    }

    /// Apply `event` on behalf of `node`.
    ///
    /// Any error is wrapped as [`ReplicationError::Handler`] naming the event.
    pub async fn process(&self, node: &Node, event: &Event) -> Result<HandlerOutcome> {
        let kind = event.kind.name();
        match self.apply(node, event).await {
            Ok(outcome) => {
                debug!(
                    node_id = %node.id,
                    event_id = event.id,
                    kind,
                    outcome = outcome.label(),
                    "Processed event"
                );
                crate::metrics::record_event_processed(kind, outcome.label());
                Ok(outcome)
            }
            Err(e) => {
                crate::metrics::record_handler_failure(kind, e.kind());
                Err(match e {
                    ReplicationError::Handler { .. } => e,
                    other => ReplicationError::handler(event.id, kind, other),
                })
            }
        }
    }

    async fn apply(&self, node: &Node, event: &Event) -> Result<HandlerOutcome> {
        match &event.kind {
            EventKind::CacheInvalidated { key } => {
                self.registry.changes().publish(ResourceChange::CacheInvalidated {
                    cache_key: key.clone(),
                });
                Ok(HandlerOutcome::Applied)
            }
            EventKind::RepositoriesChanged { node_id } => {
                if node_id != &node.id {
                    return Ok(HandlerOutcome::Skipped(SkipReason::NotForThisNode));
                }
                let scope = node.scope()?;
                let removed = self.registry.remove_outside_scope(&scope).await?;
                for key in removed {
                    self.dispatcher.release(key).await;
                }
                Ok(HandlerOutcome::Applied)
            }
            EventKind::RepositoryCreated => {
                let flags = ResyncFlags {
                    repository: true,
                    wiki: true,
                    attachments: false,
                };
                self.resync(node, event, flags).await
            }
            EventKind::RepositoryUpdated { source } => {
                let sub = match source {
                    UpdateSource::Repository => SubResource::Repository,
                    UpdateSource::Wiki => SubResource::Wiki,
                };
                self.resync(node, event, ResyncFlags::only(sub)).await
            }
            EventKind::AttachmentsRelocated { .. } => {
                self.resync(node, event, ResyncFlags::only(SubResource::Attachments))
                    .await
            }
            EventKind::RepositoryRenamed { new_path, .. } => self.rename(node, event, new_path).await,
            EventKind::RepositoryDeleted { path } => self.delete(node, event, path).await,
            EventKind::ChecksumReset => self.reset_checksum(node, event).await,
        }
    }

    fn resource(event: &Event) -> Result<ResourceKey> {
        event.resource.ok_or_else(|| {
            ReplicationError::Internal(format!("event {} has no resource", event.id))
        })
    }

    /// Find the row an event applies to, registering it if allowed.
    async fn lookup(&self, node: &Node, event: &Event, register: bool) -> Result<Lookup> {
        let key = Self::resource(event)?;
        let scope = node.scope()?;

        if let Some(record) = self.registry.get(key).await? {
            if record.has_applied(event.id) {
                return Ok(Lookup::Skip(SkipReason::AlreadyApplied));
            }
            if !in_scope(&scope, &record.shard, record.namespace_id) {
                return Ok(Lookup::Skip(SkipReason::OutOfScope));
            }
            return Ok(Lookup::Tracked(record));
        }

        if !register {
            return Ok(Lookup::Skip(SkipReason::NotTracked));
        }
        let route = self
            .router
            .route(key)
            .await
            .map_err(|e| ReplicationError::external("router.route", e.to_string()))?;
        let Some(route) = route else {
            return Ok(Lookup::Skip(SkipReason::NotTracked));
        };
        if !route_in_scope(&scope, &route) {
            return Ok(Lookup::Skip(SkipReason::OutOfScope));
        }

        // A fresh row has never been synced: everything is due.
        let (record, _) = self.registry.register(&route, ResyncFlags::all()).await?;
        Ok(Lookup::Tracked(record))
    }

    async fn resync(&self, node: &Node, event: &Event, flags: ResyncFlags) -> Result<HandlerOutcome> {
        let record = match self.lookup(node, event, true).await? {
            Lookup::Tracked(record) => record,
            Lookup::Skip(reason) => return Ok(HandlerOutcome::Skipped(reason)),
        };

        let event_id = event.id;
        let Some(updated) = self
            .registry
            .update(record.key, |r| {
                r.request_resync(flags);
                r.note_event(event_id);
                Ok(())
            })
            .await?
        else {
            return Ok(HandlerOutcome::Skipped(SkipReason::NotTracked));
        };

        self.dispatch(&updated, event.kind.name()).await;
        Ok(HandlerOutcome::Applied)
    }

    async fn dispatch(&self, record: &RegistryRecord, reason: &str) {
        let max = self.scheduler.max_concurrency_for(&record.shard);
        match self
            .dispatcher
            .schedule_sync(&self.registry, record, max, reason, &self.retry)
            .await
        {
            Ok(DispatchOutcome::Dispatched(job_id)) => {
                debug!(resource = %record.key, job_id = %job_id, "Dispatched sync from event");
            }
            Ok(other) => {
                debug!(resource = %record.key, outcome = ?other, "Sync left for the next sweep");
            }
            Err(e) => {
                warn!(resource = %record.key, error = %e, "Dispatch from event failed, sweep will retry");
            }
        }
    }

    async fn rename(&self, node: &Node, event: &Event, new_path: &str) -> Result<HandlerOutcome> {
        let record = match self.lookup(node, event, true).await? {
            Lookup::Tracked(record) => record,
            Lookup::Skip(reason) => return Ok(HandlerOutcome::Skipped(reason)),
        };

        let event_id = event.id;
        let updated = self
            .registry
            .update(record.key, |r| {
                r.path = new_path.to_string();
                r.note_event(event_id);
                Ok(())
            })
            .await?;
        if updated.is_none() {
            return Ok(HandlerOutcome::Skipped(SkipReason::NotTracked));
        }

        if self.dispatcher.retarget(record.key, new_path).await {
            debug!(resource = %record.key, path = new_path, "Renamed resource with job in flight");
        }
        Ok(HandlerOutcome::Applied)
    }

    async fn delete(&self, node: &Node, event: &Event, path: &str) -> Result<HandlerOutcome> {
        let record = match self.lookup(node, event, false).await? {
            Lookup::Tracked(record) => record,
            Lookup::Skip(reason) => return Ok(HandlerOutcome::Skipped(reason)),
        };

        self.registry.delete(record.key).await?;
        self.dispatcher.release(record.key).await;
        if let Err(e) = self
            .dispatcher
            .schedule_removal(record.key, &record.shard, path, event.kind.name())
            .await
        {
            warn!(resource = %record.key, error = %e, "Failed to enqueue removal of local copy");
        }
        Ok(HandlerOutcome::Applied)
    }

    async fn reset_checksum(&self, node: &Node, event: &Event) -> Result<HandlerOutcome> {
        let record = match self.lookup(node, event, false).await? {
            Lookup::Tracked(record) => record,
            Lookup::Skip(reason) => return Ok(HandlerOutcome::Skipped(reason)),
        };

        let event_id = event.id;
        self.registry
            .update(record.key, |r| {
                r.reset_checksum();
                r.note_event(event_id);
                Ok(())
            })
            .await?;
        Ok(HandlerOutcome::Applied)
    }
}
