// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node directory.
//!
//! Holds the configuration of the primary and every secondary: role,
//! enabled flag and selective-sync scope. Components never look up a
//! "current node" on their own; a [`Node`] value is handed to them at
//! construction or per call.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// The single writable instance. Produces the event log.
    Primary,
    /// A read replica. Consumes the event log and pulls data.
    Secondary,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// How a node's selective-sync scope is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectiveSyncType {
    Shards,
    Namespaces,
}

/// Resolved selective-sync scope of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectiveSync {
    /// Replicate everything.
    All,
    /// Replicate only resources stored on these shards.
    Shards(BTreeSet<String>),
    /// Replicate only resources belonging to these namespaces.
    Namespaces(BTreeSet<i64>),
}

impl SelectiveSync {
    /// Whether any restriction applies.
    pub fn is_restricted(&self) -> bool {
        !matches!(self, SelectiveSync::All)
    }
}

/// A running instance in primary or secondary role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub role: NodeRole,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub selective_sync_type: Option<SelectiveSyncType>,
    #[serde(default)]
    pub selective_sync_shards: BTreeSet<String>,
    #[serde(default)]
    pub selective_sync_namespaces: BTreeSet<i64>,
}

fn default_enabled() -> bool {
    true
}

impl Node {
    fn new(id: &str, role: NodeRole) -> Self {
        Self {
            id: id.to_string(),
            role,
            enabled: true,
            selective_sync_type: None,
            selective_sync_shards: BTreeSet::new(),
            selective_sync_namespaces: BTreeSet::new(),
        }
    }

    /// An enabled primary with no selective sync.
    pub fn primary(id: &str) -> Self {
        Self::new(id, NodeRole::Primary)
    }

    /// An enabled secondary replicating everything.
    pub fn secondary(id: &str) -> Self {
        Self::new(id, NodeRole::Secondary)
    }

    /// Restrict replication to the given shards.
    #[must_use]
    pub fn with_shards<I, S>(mut self, shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selective_sync_type = Some(SelectiveSyncType::Shards);
        self.selective_sync_shards = shards.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict replication to the given namespaces.
    #[must_use]
    pub fn with_namespaces<I: IntoIterator<Item = i64>>(mut self, namespaces: I) -> Self {
        self.selective_sync_type = Some(SelectiveSyncType::Namespaces);
        self.selective_sync_namespaces = namespaces.into_iter().collect();
        self
    }

    /// Copy of this node with the enabled flag changed.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    pub fn is_secondary(&self) -> bool {
        self.role == NodeRole::Secondary
    }

    /// Whether this node is enabled and has the given role.
    pub fn is_active_as(&self, role: NodeRole) -> bool {
        self.enabled && self.role == role
    }

    /// Resolve the selective-sync scope.
    ///
    /// Fails on a malformed scope: a declared type with an empty set, or
    /// both sets populated without a declared type.
    pub fn scope(&self) -> Result<SelectiveSync> {
        let shards = &self.selective_sync_shards;
        let namespaces = &self.selective_sync_namespaces;

        match self.selective_sync_type {
            Some(SelectiveSyncType::Shards) if shards.is_empty() => Err(ReplicationError::Config(
                format!("node '{}': selective sync by shards with no shards", self.id),
            )),
            Some(SelectiveSyncType::Shards) => Ok(SelectiveSync::Shards(shards.clone())),
            Some(SelectiveSyncType::Namespaces) if namespaces.is_empty() => {
                Err(ReplicationError::Config(format!(
                    "node '{}': selective sync by namespaces with no namespaces",
                    self.id
                )))
            }
            Some(SelectiveSyncType::Namespaces) => {
                Ok(SelectiveSync::Namespaces(namespaces.clone()))
            }
            None => match (shards.is_empty(), namespaces.is_empty()) {
                (true, true) => Ok(SelectiveSync::All),
                (false, true) => Ok(SelectiveSync::Shards(shards.clone())),
                (true, false) => Ok(SelectiveSync::Namespaces(namespaces.clone())),
                (false, false) => Err(ReplicationError::Config(format!(
                    "node '{}': both shard and namespace scopes set without a selective_sync_type",
                    self.id
                ))),
            },
        }
    }
}

/// Read-only directory of all nodes.
#[derive(Debug, Clone)]
pub struct NodeDirectory {
    nodes: Vec<Node>,
}

impl NodeDirectory {
    /// Build a directory, enforcing unique ids and exactly one enabled primary.
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for node in &nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ReplicationError::Config(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let primaries = nodes
            .iter()
            .filter(|n| n.is_active_as(NodeRole::Primary))
            .count();
        if primaries != 1 {
            return Err(ReplicationError::Config(format!(
                "expected exactly one enabled primary, found {}",
                primaries
            )));
        }

        Ok(Self { nodes })
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The enabled primary.
    pub fn primary(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_active_as(NodeRole::Primary))
    }

    /// All secondaries, enabled or not.
    pub fn secondaries(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_secondary())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
