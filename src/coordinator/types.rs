// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! Defines the state machine for the replication engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                              │
//!    │ shutdown()                   │ shutdown()
//!    ↓                              ↓
//! Stopped ←──────────────── ShuttingDown
//!
//! Created ──(lock rebuild failed)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicationEngine::new()`. Stores are
//!   open, no task is running.
//! - **Running**: Log cursor and scheduler loops are running.
//! - **ShuttingDown**: `shutdown()` called. Loops are draining.
//! - **Stopped**: Cursors flushed, database checkpointed and closed.
//! - **Failed**: `start()` could not complete. The engine cannot be restarted.

use crate::circuit_breaker::TransportCircuitMetrics;
use crate::node::NodeRole;
use serde::Serialize;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Running and replicating.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Stopped. Safe to drop.
    Stopped,

    /// Failed to start.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health snapshot for readiness/liveness endpoints.
///
/// Built from cached state only; no store or network I/O.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    pub node_id: String,
    pub role: NodeRole,
    pub node_enabled: bool,
    /// Engine is running.
    pub ready: bool,
    /// Ready, and neither the cursor nor the transport is stuck.
    pub healthy: bool,
    /// Event the local cursor is blocked on, if any.
    pub cursor_blocked_event_id: Option<i64>,
    pub cursor_lag: Option<i64>,
    pub transport_circuit_open: bool,
    pub transport: TransportCircuitMetrics,
}
