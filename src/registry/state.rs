// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry value types and the replication state machine.
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!                 ▼                                      │
//!   pending ──► started ──► synced ──────────────────────┤
//!                 │  ▲                                   │
//!                 ▼  │                                   │
//!               failed ──────────────────────────────────┤
//!                                                        │
//!   (any) ──► verification_pending ──► verification_succeeded
//!                      │          └──► verification_failed
//!                      └──────────────────────────────────► pending
//! ```
//!
//! Terminal-for-now states (`synced`, `failed`, `verification_*`) re-enter
//! `pending` when a new relevant event arrives.

use crate::error::ReplicationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Replication state of one registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Started,
    Synced,
    Failed,
    VerificationPending,
    VerificationSucceeded,
    VerificationFailed,
}

impl SyncState {
    pub const ALL: [SyncState; 7] = [
        SyncState::Pending,
        SyncState::Started,
        SyncState::Synced,
        SyncState::Failed,
        SyncState::VerificationPending,
        SyncState::VerificationSucceeded,
        SyncState::VerificationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Started => "started",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
            SyncState::VerificationPending => "verification_pending",
            SyncState::VerificationSucceeded => "verification_succeeded",
            SyncState::VerificationFailed => "verification_failed",
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Same-state moves are always allowed (and are no-ops).
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        if *self == next || next == VerificationPending {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Started)
                | (Started, Synced)
                | (Started, Failed)
                | (Failed, Started)
                | (Failed, Pending)
                | (Synced, Pending)
                | (VerificationPending, VerificationSucceeded)
                | (VerificationPending, VerificationFailed)
                | (VerificationPending, Pending)
                | (VerificationSucceeded, Pending)
                | (VerificationFailed, Pending)
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ReplicationError::Internal(format!("unknown sync state '{}'", s)))
    }
}

/// Kind of replicated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Project container: repository, wiki and attachments.
    Repository,
    Snippet,
    Design,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [
        ResourceType::Repository,
        ResourceType::Snippet,
        ResourceType::Design,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Repository => "repository",
            ResourceType::Snippet => "snippet",
            ResourceType::Design => "design",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ReplicationError::Internal(format!("unknown resource type '{}'", s)))
    }
}

/// Composite key of a registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub resource_id: i64,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, resource_id: i64) -> Self {
        Self {
            resource_type,
            resource_id,
        }
    }

    pub fn repository(resource_id: i64) -> Self {
        Self::new(ResourceType::Repository, resource_id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

/// Part of a resource that can drift independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubResource {
    Repository,
    Wiki,
    Attachments,
}

/// Which sub-resources need a resync.
///
/// Flags are set on drift and cleared only by a successful sync of the
/// matching sub-resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResyncFlags {
    pub repository: bool,
    pub wiki: bool,
    pub attachments: bool,
}

impl ResyncFlags {
    /// Flags with every sub-resource set.
    pub fn all() -> Self {
        Self {
            repository: true,
            wiki: true,
            attachments: true,
        }
    }

    pub fn only(sub: SubResource) -> Self {
        let mut flags = Self::default();
        flags.set(sub);
        flags
    }

    pub fn set(&mut self, sub: SubResource) {
        *self.slot(sub) = true;
    }

    pub fn clear(&mut self, sub: SubResource) {
        *self.slot(sub) = false;
    }

    pub fn is_set(&self, sub: SubResource) -> bool {
        match sub {
            SubResource::Repository => self.repository,
            SubResource::Wiki => self.wiki,
            SubResource::Attachments => self.attachments,
        }
    }

    pub fn any(&self) -> bool {
        self.repository || self.wiki || self.attachments
    }

    /// Union of two flag sets.
    #[must_use]
    pub fn union(self, other: ResyncFlags) -> Self {
        Self {
            repository: self.repository || other.repository,
            wiki: self.wiki || other.wiki,
            attachments: self.attachments || other.attachments,
        }
    }

    /// Clear every flag that is set in `synced`.
    pub fn clear_synced(&mut self, synced: ResyncFlags) {
        self.repository &= !synced.repository;
        self.wiki &= !synced.wiki;
        self.attachments &= !synced.attachments;
    }

    fn slot(&mut self, sub: SubResource) -> &mut bool {
        match sub {
            SubResource::Repository => &mut self.repository,
            SubResource::Wiki => &mut self.wiki,
            SubResource::Attachments => &mut self.attachments,
        }
    }
}
