// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by their source (SQLite, external collaborators,
//! configuration) and carry enough context to identify the resource or event
//! that failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Payload` | No | Event payload could not be encoded/decoded |
//! | `Config` | No | Configuration invalid (fatal to one node's sweep) |
//! | `Handler` | Yes | Event handler failed; the cursor retries the same event |
//! | `Dispatch` | Yes | Job processor refused or failed to enqueue |
//! | `External` | Yes | Routing / health / transport collaborator failed |
//! | `Conflict` | Yes | Compare-and-set lost too many races |
//! | `InvalidTransition` | No | Registry state machine violation |
//! | `InvalidState` | No | Engine lifecycle violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Duplicate work and out-of-scope resources are *not* errors anywhere in
//! this crate: they surface as successful no-op outcomes instead.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// SQLite error in the event log, cursor store or registry store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Event payload serialization failure.
    ///
    /// Not retryable - the stored payload is malformed.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    ///
    /// Includes malformed selective-sync scopes. Fatal to the sweep of the
    /// affected node only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An event handler failed to apply an event.
    ///
    /// The cursor does not advance past `event_id` and retries it on the
    /// next advance.
    #[error("Handler error (event {event_id}, {kind}): {message}")]
    Handler {
        event_id: i64,
        kind: String,
        message: String,
    },

    /// The external job processor failed to accept a job.
    #[error("Dispatch error ({resource}): {message}")]
    Dispatch { resource: String, message: String },

    /// An external collaborator (router, health, transport) failed.
    #[error("External error ({operation}): {message}")]
    External { operation: String, message: String },

    /// Compare-and-set update lost the race too many times.
    #[error("Concurrent update conflict on {resource} after {attempts} attempts")]
    Conflict { resource: String, attempts: u32 },

    /// Registry state machine violation.
    #[error("Invalid transition for {resource}: {from} -> {to}")]
    InvalidTransition {
        resource: String,
        from: String,
        to: String,
    },

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong lifecycle state
    /// (e.g., calling `start()` on an already-running engine).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap an error raised while handling an event.
    pub fn handler(event_id: i64, kind: impl Into<String>, source: impl std::fmt::Display) -> Self {
        Self::Handler {
            event_id,
            kind: kind.into(),
            message: source.to_string(),
        }
    }

    /// Create an error for a failed external collaborator call.
    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::External {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_) => false, // Local DB issues need attention
            Self::Payload(_) => false,
            Self::Config(_) => false,
            Self::Handler { .. } => true,
            Self::Dispatch { .. } => true,
            Self::External { .. } => true,
            Self::Conflict { .. } => true,
            Self::InvalidTransition { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Payload(_) => "payload",
            Self::Config(_) => "config",
            Self::Handler { .. } => "handler",
            Self::Dispatch { .. } => "dispatch",
            Self::External { .. } => "external",
            Self::Conflict { .. } => "conflict",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_handler() {
        let err = ReplicationError::handler(101, "repository_updated", "registry busy");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("101"));
        assert!(err.to_string().contains("repository_updated"));
    }

    #[test]
    fn test_is_retryable_dispatch() {
        let err = ReplicationError::Dispatch {
            resource: "repository/42".to_string(),
            message: "queue unavailable".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("repository/42"));
    }

    #[test]
    fn test_is_retryable_external() {
        let err = ReplicationError::external("healthy_shard_names", "timeout");
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "external");
    }

    #[test]
    fn test_is_retryable_conflict() {
        let err = ReplicationError::Conflict {
            resource: "repository/1".to_string(),
            attempts: 8,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("selective sync type 'shards' with no shards".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_not_retryable_invalid_transition() {
        let err = ReplicationError::InvalidTransition {
            resource: "repository/7".to_string(),
            from: "pending".to_string(),
            to: "synced".to_string(),
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("pending -> synced"));
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Running".to_string(),
            actual: "Stopped".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Running"));
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_not_retryable_payload() {
        let source = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = ReplicationError::from(source);
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "payload");
    }

    #[test]
    fn test_not_retryable_shutdown_and_internal() {
        assert!(!ReplicationError::Shutdown.is_retryable());
        assert!(!ReplicationError::Internal("boom".to_string()).is_retryable());
    }
}
