// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resource change notifications.
//!
//! The registry publishes a [`ResourceChange`] after every committed write.
//! Listeners (status caches, UIs, tests) subscribe to the [`ChangeBus`];
//! nothing in the engine depends on anyone listening.

use crate::registry::{ResourceKey, SyncState};
use tokio::sync::broadcast;

/// Capacity of the broadcast buffer. Slow subscribers lag, they never block writers.
const CHANGE_BUS_CAPACITY: usize = 1024;

/// A committed change to replicated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceChange {
    /// A new registry row was created.
    Registered { key: ResourceKey, state: SyncState },
    /// A row moved between states.
    StateChanged {
        key: ResourceKey,
        from: SyncState,
        to: SyncState,
    },
    /// A row changed without changing state (flags, path, checksum).
    Updated { key: ResourceKey, state: SyncState },
    /// A row was deleted.
    Removed { key: ResourceKey },
    /// A cache key was invalidated upstream.
    CacheInvalidated { cache_key: String },
}

impl ResourceChange {
    /// Key of the affected resource, if any.
    pub fn key(&self) -> Option<ResourceKey> {
        match self {
            ResourceChange::Registered { key, .. }
            | ResourceChange::StateChanged { key, .. }
            | ResourceChange::Updated { key, .. }
            | ResourceChange::Removed { key } => Some(*key),
            ResourceChange::CacheInvalidated { .. } => None,
        }
    }
}

/// Broadcast channel of [`ResourceChange`] notifications.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ResourceChange>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a change. Having no subscribers is fine.
    pub fn publish(&self, change: ResourceChange) {
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceChange> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
