// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The event log: an append-only, strictly ordered record of changes on the
//! primary.
//!
//! Ids come from SQLite's `AUTOINCREMENT`, so they are assigned atomically,
//! never reused, and define the total order every secondary consumes in.
//! Payloads are stored as JSON of the tagged [`EventKind`] enum.
//!
//! # Table
//!
//! ```text
//! events(id INTEGER PRIMARY KEY AUTOINCREMENT,
//!        kind TEXT, resource_type TEXT NULL, resource_id INTEGER NULL,
//!        payload TEXT /* JSON */, created_at INTEGER /* unix ms */)
//! ```

use crate::db::{execute_with_retry, now_millis};
use crate::error::{ReplicationError, Result};
use crate::registry::{ResourceKey, ResourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use tracing::debug;

/// Position in the event log.
pub type EventId = i64;

/// Which part of a project an update touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Repository,
    Wiki,
}

/// Every kind of change the primary records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RepositoryCreated,
    RepositoryUpdated { source: UpdateSource },
    RepositoryRenamed { old_path: String, new_path: String },
    RepositoryDeleted { path: String },
    ChecksumReset,
    AttachmentsRelocated { old_path: String, new_path: String },
    CacheInvalidated { key: String },
    /// A node's selective sync scope changed.
    RepositoriesChanged { node_id: String },
}

impl EventKind {
    /// Stable name used in logs, metrics and the `kind` column.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RepositoryCreated => "repository_created",
            EventKind::RepositoryUpdated { .. } => "repository_updated",
            EventKind::RepositoryRenamed { .. } => "repository_renamed",
            EventKind::RepositoryDeleted { .. } => "repository_deleted",
            EventKind::ChecksumReset => "checksum_reset",
            EventKind::AttachmentsRelocated { .. } => "attachments_relocated",
            EventKind::CacheInvalidated { .. } => "cache_invalidated",
            EventKind::RepositoriesChanged { .. } => "repositories_changed",
        }
    }

    /// Whether events of this kind must name a resource.
    pub fn requires_resource(&self) -> bool {
        !matches!(
            self,
            EventKind::CacheInvalidated { .. } | EventKind::RepositoriesChanged { .. }
        )
    }
}

/// An immutable entry of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub resource: Option<ResourceKey>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Decode a stored row.
    pub fn from_parts(
        id: EventId,
        resource_type: Option<&str>,
        resource_id: Option<i64>,
        payload: &str,
        created_at_ms: i64,
    ) -> Result<Self> {
        let kind: EventKind = serde_json::from_str(payload)?;
        let resource = match (resource_type, resource_id) {
            (Some(t), Some(id)) => Some(ResourceKey::new(ResourceType::from_str(t)?, id)),
            (None, None) => None,
            _ => {
                return Err(ReplicationError::Internal(format!(
                    "event {} has a partial resource key",
                    id
                )))
            }
        };
        if kind.requires_resource() && resource.is_none() {
            return Err(ReplicationError::Internal(format!(
                "event {} ({}) has no resource",
                id,
                kind.name()
            )));
        }
        Ok(Self {
            id,
            kind,
            resource,
            created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_default(),
        })
    }
}

/// Boxed future returned by [`EventSource`].
pub type EventFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Read side of the event log, as consumed by log cursors.
pub trait EventSource: Send + Sync + 'static {
    /// Events with id greater than `after`, ascending, at most `limit`.
    fn read_after(&self, after: EventId, limit: usize) -> EventFuture<'_, Vec<Event>>;

    /// Id of the newest event, 0 for an empty log.
    fn last_event_id(&self) -> EventFuture<'_, EventId>;
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    resource_type: Option<String>,
    resource_id: Option<i64>,
    payload: String,
    created_at: i64,
}

/// SQLite-backed event log.
#[derive(Clone)]
pub struct SqliteEventLog {
    pool: SqlitePool,
}

impl SqliteEventLog {
    /// Open the log on `pool`, creating the table if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                resource_type TEXT,
                resource_id INTEGER,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Append an event and return it with its assigned id.
    ///
    /// Failures are returned to the caller; nothing is dropped silently.
    pub async fn append(&self, kind: EventKind, resource: Option<ResourceKey>) -> Result<Event> {
        if kind.requires_resource() && resource.is_none() {
            return Err(ReplicationError::Internal(format!(
                "{} events must name a resource",
                kind.name()
            )));
        }

        let payload = serde_json::to_string(&kind)?;
        let created_at = now_millis();
        let pool = &self.pool;
        let name = kind.name();

        let result = execute_with_retry("event_append", || async {
            sqlx::query(
                "INSERT INTO events (kind, resource_type, resource_id, payload, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(name)
            .bind(resource.map(|k| k.resource_type.as_str()))
            .bind(resource.map(|k| k.resource_id))
            .bind(&payload)
            .bind(created_at)
            .execute(pool)
            .await
        })
        .await?;

        let id = result.last_insert_rowid();
        debug!(event_id = id, kind = name, "Appended event");
        crate::metrics::record_event_appended(name);

        Ok(Event {
            id,
            kind,
            resource,
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
        })
    }

    pub async fn read_after(&self, after: EventId, limit: usize) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, resource_type, resource_id, payload, created_at FROM events \
             WHERE id > ? ORDER BY id LIMIT ?",
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Event::from_parts(
                    row.id,
                    row.resource_type.as_deref(),
                    row.resource_id,
                    &row.payload,
                    row.created_at,
                )
            })
            .collect()
    }

    pub async fn last_event_id(&self) -> Result<EventId> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0))
    }
}

impl EventSource for SqliteEventLog {
    fn read_after(&self, after: EventId, limit: usize) -> EventFuture<'_, Vec<Event>> {
        Box::pin(SqliteEventLog::read_after(self, after, limit))
    }

    fn last_event_id(&self) -> EventFuture<'_, EventId> {
        Box::pin(SqliteEventLog::last_event_id(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::open_pool;
    use std::sync::Arc;

    async fn log() -> SqliteEventLog {
        let pool = open_pool(&StoreConfig::in_memory()).await.unwrap();
        SqliteEventLog::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let log = log().await;
        let a = log
            .append(EventKind::RepositoryCreated, Some(ResourceKey::repository(1)))
            .await
            .unwrap();
        let b = log
            .append(
                EventKind::RepositoryUpdated { source: UpdateSource::Wiki },
                Some(ResourceKey::repository(1)),
            )
            .await
            .unwrap();
        assert!(b.id > a.id);
        assert_eq!(log.last_event_id().await.unwrap(), b.id);
    }

    #[tokio::test]
    async fn test_read_after_is_ordered_and_bounded() {
        let log = log().await;
        for id in 1..=5 {
            log.append(EventKind::ChecksumReset, Some(ResourceKey::repository(id)))
                .await
                .unwrap();
        }

        let first = log.read_after(0, 2).await.unwrap();
        assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);

        let rest = log.read_after(2, 100).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].resource, Some(ResourceKey::repository(3)));
        assert!(log.read_after(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_round_trips_through_storage() {
        let log = log().await;
        let kind = EventKind::RepositoryRenamed {
            old_path: "group/old".to_string(),
            new_path: "group/new".to_string(),
        };
        log.append(kind.clone(), Some(ResourceKey::repository(9))).await.unwrap();

        let events = log.read_after(0, 10).await.unwrap();
        assert_eq!(events[0].kind, kind);
    }

    #[tokio::test]
    async fn test_append_rejects_missing_resource() {
        let log = log().await;
        let err = log.append(EventKind::ChecksumReset, None).await.unwrap_err();
        assert!(err.to_string().contains("checksum_reset"));

        // Node-level events carry no resource.
        let event = log
            .append(
                EventKind::RepositoriesChanged { node_id: "secondary-1".to_string() },
                None,
            )
            .await
            .unwrap();
        assert!(event.resource.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_ids() {
        let log = Arc::new(log().await);
        let mut handles = Vec::new();
        for id in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(EventKind::RepositoryCreated, Some(ResourceKey::repository(id)))
                    .await
                    .unwrap()
                    .id
            }));
        }

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }

    #[test]
    fn test_from_parts_rejects_bad_payload() {
        assert!(Event::from_parts(1, Some("repository"), Some(1), "{\"type\":\"nope\"}", 0).is_err());
        assert!(Event::from_parts(1, Some("repository"), None, "{\"type\":\"checksum_reset\"}", 0).is_err());
        assert!(Event::from_parts(1, None, None, "{\"type\":\"checksum_reset\"}", 0).is_err());

        let ok = Event::from_parts(
            7,
            None,
            None,
            r#"{"type":"cache_invalidated","key":"projects/1/branches"}"#,
            1_700_000_000_000,
        )
        .unwrap();
        assert_eq!(ok.kind.name(), "cache_invalidated");
    }

    #[test]
    fn test_kind_json_shape() {
        let json = serde_json::to_string(&EventKind::RepositoryUpdated {
            source: UpdateSource::Repository,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"repository_updated","source":"repository"}"#);
    }
}
