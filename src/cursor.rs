// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor persistence for event log positions.
//!
//! Stores the last processed event id for each secondary node in SQLite.
//!
//! # Debounced Writes
//!
//! To reduce SQLite write pressure, cursors are debounced:
//! - `set()` updates the in-memory cache immediately and marks the cursor dirty
//! - `flush_dirty()` persists all dirty cursors to disk in a batch
//! - The log cursor flushes at the end of every batch, the engine flushes
//!   periodically and on shutdown
//!
//! A crash between `set()` and `flush_dirty()` re-delivers the events of
//! that window on restart. Handlers are idempotent, so that is safe.
//!
//! ## Cursor Semantics
//!
//! The cursor stores the **last successfully processed** event id.
//! On restart, we resume with the first event after it.
//!
//! ```text
//! read event 101 → handler succeeds → set cursor 101
//!                  (crash here = re-read 101, idempotent)
//! ```
//!
//! Positions never move backwards, except through an explicit [`reset`].
//! The upsert keeps the larger of the stored and the flushed value, so a
//! stale flush racing a newer one cannot rewind the stored position either.
//!
//! [`reset`]: CursorStore::reset

use crate::db::{execute_with_retry, now_millis};
use crate::error::{ReplicationError, Result};
use crate::event::EventId;
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Persistent cursor storage backed by SQLite.
///
/// Supports debounced writes: updates go to cache immediately,
/// and are flushed to disk periodically via `flush_dirty()`.
#[derive(Clone)]
pub struct CursorStore {
    pool: SqlitePool,
    /// In-memory cache for fast reads
    cache: Arc<RwLock<HashMap<String, EventId>>>,
    /// Node IDs with dirty (not yet persisted) cursors
    dirty: Arc<RwLock<HashSet<String>>>,
}

impl CursorStore {
    /// Open the cursor store on `pool`.
    ///
    /// Creates the table if it doesn't exist and loads existing cursors.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                node_id TEXT PRIMARY KEY,
                last_event_id INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT node_id, last_event_id FROM cursors")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (node_id, last_event_id) in rows {
            debug!(node_id = %node_id, last_event_id, "Loaded cursor from disk");
            cache.insert(node_id, last_event_id);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Get the cursor for a node (from cache).
    ///
    /// Returns `None` if the node never processed an event.
    pub async fn get(&self, node_id: &str) -> Option<EventId> {
        self.cache.read().await.get(node_id).copied()
    }

    /// Current position, 0 before the first event.
    pub async fn position(&self, node_id: &str) -> EventId {
        self.get(node_id).await.unwrap_or(0)
    }

    /// Advance the cursor for a node (debounced).
    ///
    /// Updates cache immediately, marks cursor as dirty. Setting the current
    /// value again is a no-op; a lower value is rejected.
    pub async fn set(&self, node_id: &str, event_id: EventId) -> Result<()> {
        {
            let mut cache = self.cache.write().await;
            let current = cache.get(node_id).copied().unwrap_or(0);
            if event_id < current {
                return Err(ReplicationError::InvalidState {
                    expected: format!("cursor >= {}", current),
                    actual: event_id.to_string(),
                });
            }
            if event_id == current && cache.contains_key(node_id) {
                return Ok(());
            }
            cache.insert(node_id.to_string(), event_id);
        }

        self.dirty.write().await.insert(node_id.to_string());
        crate::metrics::set_cursor_position(node_id, event_id);
        debug!(node_id = %node_id, event_id, "Cursor updated (pending flush)");
        Ok(())
    }

    /// Rewind (or move) a cursor to `event_id` and persist it immediately.
    ///
    /// The only way to lower a cursor.
    pub async fn reset(&self, node_id: &str, event_id: EventId) -> Result<()> {
        self.cache.write().await.insert(node_id.to_string(), event_id);
        self.dirty.write().await.remove(node_id);

        let pool = &self.pool;
        let now = now_millis();
        execute_with_retry("cursor_reset", || async {
            sqlx::query(
                r#"
                INSERT INTO cursors (node_id, last_event_id, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(node_id) DO UPDATE SET
                    last_event_id = excluded.last_event_id,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(node_id)
            .bind(event_id)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        crate::metrics::set_cursor_position(node_id, event_id);
        info!(node_id = %node_id, event_id, "Cursor reset");
        Ok(())
    }

    /// Flush all dirty cursors to disk.
    ///
    /// Returns the number of cursors flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        // Swap out dirty set atomically
        let dirty_nodes: Vec<String> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_nodes.is_empty() {
            return Ok(0);
        }

        let now = now_millis();
        let snapshot: Vec<(String, EventId)> = {
            let cache = self.cache.read().await;
            dirty_nodes
                .iter()
                .filter_map(|n| cache.get(n).map(|id| (n.clone(), *id)))
                .collect()
        };
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for (node_id, event_id) in &snapshot {
            let result = execute_with_retry("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO cursors (node_id, last_event_id, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(node_id) DO UPDATE SET
                        last_event_id = MAX(last_event_id, excluded.last_event_id),
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(node_id)
                .bind(*event_id)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(node_id = %node_id, error = %e, "Failed to flush cursor");
                    // Re-mark as dirty so we retry next flush
                    self.dirty.write().await.insert(node_id.clone());
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty cursors");
            crate::metrics::record_cursor_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} cursors",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Delete the cursor of a node removed from the directory.
    pub async fn delete(&self, node_id: &str) -> Result<()> {
        self.cache.write().await.remove(node_id);
        self.dirty.write().await.remove(node_id);

        let pool = &self.pool;
        execute_with_retry("cursor_delete", || async {
            sqlx::query("DELETE FROM cursors WHERE node_id = ?")
                .bind(node_id)
                .execute(pool)
                .await
        })
        .await?;

        info!(node_id = %node_id, "Deleted cursor");
        Ok(())
    }

    /// All cursors (for status and debugging).
    pub async fn get_all(&self) -> HashMap<String, EventId> {
        self.cache.read().await.clone()
    }

    /// Flush pending positions before shutdown. The pool itself is closed
    /// by the engine.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty cursors on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty cursors on close"),
            }
        }
    }
}
