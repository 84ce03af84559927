// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log cursor: consumes the event log on behalf of one secondary.
//!
//! # Flow
//!
//! ```text
//! ┌────────────┐  read_after(pos, batch)  ┌───────────────┐
//! │ Event log  │ ───────────────────────► │  LogCursor    │
//! └────────────┘                          │  advance()    │
//!                                         └───────┬───────┘
//!                              for each event, in id order
//!                                                 ▼
//!                                   handlers.process(node, event)
//!                                        │ Ok           │ Err
//!                                        ▼              ▼
//!                               cursor.set(event.id)   stop the batch,
//!                                                      record the blocked event
//! ```
//!
//! The position moves only past events whose handler succeeded, one event at
//! a time. A failing event blocks the node's cursor until it succeeds; the
//! engine's loop retries it with backoff. Positions are flushed to SQLite at
//! the end of every batch.

use crate::cursor::CursorStore;
use crate::error::Result;
use crate::event::{EventId, EventSource};
use crate::handlers::{EventHandlers, HandlerOutcome};
use crate::node::{Node, NodeRole};
use crate::resilience::RateLimiter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Progress of one node's cursor, as shown by the status interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorStatus {
    pub node_id: String,
    /// Last processed event id.
    pub position: EventId,
    /// Newest event id in the log when last checked.
    pub head: EventId,
    /// Event the cursor is stuck on, if its handler failed.
    pub blocked_event_id: Option<EventId>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl CursorStatus {
    /// Events not yet processed.
    pub fn lag(&self) -> i64 {
        (self.head - self.position).max(0)
    }
}

/// Shared cursor status, keyed by node id.
pub type CursorStatusBoard = Arc<RwLock<HashMap<String, CursorStatus>>>;

/// What one `advance` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdvanceStats {
    pub read: usize,
    pub applied: usize,
    pub skipped: usize,
    pub position: EventId,
}

impl AdvanceStats {
    /// Whether the batch was full, i.e. more events are probably waiting.
    pub fn is_full_batch(&self, batch_size: usize) -> bool {
        self.read >= batch_size
    }
}

/// Reads the event log for a node and applies each event.
pub struct LogCursor {
    source: Arc<dyn EventSource>,
    cursors: CursorStore,
    handlers: Arc<EventHandlers>,
    batch_size: usize,
    limiter: Option<RateLimiter>,
    status: CursorStatusBoard,
}

impl LogCursor {
    pub fn new(
        source: Arc<dyn EventSource>,
        cursors: CursorStore,
        handlers: Arc<EventHandlers>,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            cursors,
            handlers,
            batch_size: batch_size.max(1),
            limiter: None,
            status: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Throttle event processing.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Share a status board with the status service.
    #[must_use]
    pub fn with_status_board(mut self, status: CursorStatusBoard) -> Self {
        self.status = status;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn status_board(&self) -> CursorStatusBoard {
        self.status.clone()
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// Process the next batch of events for `node`.
    ///
    /// Does nothing unless `node` is an enabled secondary. Returns the
    /// handler error of the first failing event, after persisting the
    /// progress made before it.
    pub async fn advance(&self, node: &Node) -> Result<AdvanceStats> {
        let start = self.cursors.position(&node.id).await;
        let mut stats = AdvanceStats {
            position: start,
            ..Default::default()
        };
        if !node.is_active_as(NodeRole::Secondary) {
            return Ok(stats);
        }

        let events = self.source.read_after(start, self.batch_size).await?;
        stats.read = events.len();

        let mut failure = None;
        for event in &events {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            match self.handlers.process(node, event).await {
                Ok(outcome) => {
                    self.cursors.set(&node.id, event.id).await?;
                    stats.position = event.id;
                    match outcome {
                        HandlerOutcome::Applied => stats.applied += 1,
                        HandlerOutcome::Skipped(_) => stats.skipped += 1,
                    }
                }
                Err(e) => {
                    warn!(
                        node_id = %node.id,
                        event_id = event.id,
                        kind = event.kind.name(),
                        error = %e,
                        "Event handler failed, cursor blocked"
                    );
                    failure = Some((event.id, e));
                    break;
                }
            }
        }

        if let Err(e) = self.cursors.flush_dirty().await {
            warn!(node_id = %node.id, error = %e, "Cursor flush failed, will retry");
        }

        let head = match self.source.last_event_id().await {
            Ok(head) => head.max(stats.position),
            Err(e) => {
                debug!(node_id = %node.id, error = %e, "Could not read event log head");
                stats.position
            }
        };
        crate::metrics::set_cursor_lag(&node.id, (head - stats.position).max(0));

        match failure {
            Some((event_id, e)) => {
                self.record_status(node, stats.position, head, Some((event_id, e.to_string())))
                    .await;
                Err(e)
            }
            None => {
                self.record_status(node, stats.position, head, None).await;
                if stats.read > 0 {
                    debug!(
                        node_id = %node.id,
                        read = stats.read,
                        applied = stats.applied,
                        skipped = stats.skipped,
                        position = stats.position,
                        "Advanced log cursor"
                    );
                }
                Ok(stats)
            }
        }
    }

    async fn record_status(
        &self,
        node: &Node,
        position: EventId,
        head: EventId,
        failure: Option<(EventId, String)>,
    ) {
        let mut board = self.status.write().await;
        let entry = board.entry(node.id.clone()).or_insert_with(|| CursorStatus {
            node_id: node.id.clone(),
            position,
            head,
            blocked_event_id: None,
            last_error: None,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        });
        entry.position = position;
        entry.head = head;
        entry.updated_at = Utc::now();
        match failure {
            Some((event_id, error)) => {
                entry.blocked_event_id = Some(event_id);
                entry.last_error = Some(error);
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            }
            None => {
                entry.blocked_event_id = None;
                entry.last_error = None;
                entry.consecutive_failures = 0;
            }
        }
    }

    /// Move a node's cursor to `event_id`, including backwards.
    pub async fn reset(&self, node_id: &str, event_id: EventId) -> Result<()> {
        self.cursors.reset(node_id, event_id).await?;
        let mut board = self.status.write().await;
        if let Some(entry) = board.get_mut(node_id) {
            entry.position = event_id;
            entry.blocked_event_id = None;
            entry.last_error = None;
            entry.consecutive_failures = 0;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }
}
