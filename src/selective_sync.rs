// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Selective sync filter.
//!
//! Narrows the set of shards (and resources) a secondary is responsible for.
//! Namespace scopes never reach [`filter_shards`]: they are applied per
//! resource by [`resource_in_scope`], which sees the namespace the router
//! resolved for that resource.

use crate::error::Result;
use crate::external::ResourceRoute;
use crate::node::{Node, SelectiveSync};
use std::collections::BTreeSet;

/// Narrow `shards` to the ones `node` replicates.
///
/// Returns the input unchanged when the node has no shard scope.
/// Fails only when the node's scope is malformed.
pub fn filter_shards(shards: &BTreeSet<String>, node: &Node) -> Result<BTreeSet<String>> {
    Ok(match node.scope()? {
        SelectiveSync::Shards(allowed) => shards.intersection(&allowed).cloned().collect(),
        SelectiveSync::All | SelectiveSync::Namespaces(_) => shards.clone(),
    })
}

/// Whether a routed resource falls inside `scope`.
pub fn route_in_scope(scope: &SelectiveSync, route: &ResourceRoute) -> bool {
    in_scope(scope, &route.shard, route.namespace_id)
}

/// Whether a resource with the given placement falls inside `scope`.
pub fn in_scope(scope: &SelectiveSync, shard: &str, namespace_id: Option<i64>) -> bool {
    match scope {
        SelectiveSync::All => true,
        SelectiveSync::Shards(shards) => shards.contains(shard),
        SelectiveSync::Namespaces(namespaces) => {
            namespace_id.is_some_and(|id| namespaces.contains(&id))
        }
    }
}

/// Whether `node` replicates the routed resource.
pub fn resource_in_scope(node: &Node, route: &ResourceRoute) -> Result<bool> {
    Ok(route_in_scope(&node.scope()?, route))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ResourceKey, ResourceType};

    fn shards(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn route(shard: &str, namespace_id: Option<i64>) -> ResourceRoute {
        ResourceRoute {
            key: ResourceKey::new(ResourceType::Repository, 1),
            shard: shard.to_string(),
            path: "group/project".to_string(),
            namespace_id,
            primary_checksum: None,
        }
    }

    #[test]
    fn test_no_scope_returns_all_shards() {
        let node = Node::secondary("s1");
        let input = shards(&["default", "nfs-01"]);
        assert_eq!(filter_shards(&input, &node).unwrap(), input);
    }

    #[test]
    fn test_shard_scope_intersects() {
        let node = Node::secondary("s1").with_shards(["default", "gone"]);
        let out = filter_shards(&shards(&["default", "nfs-01"]), &node).unwrap();
        assert_eq!(out, shards(&["default"]));
    }

    #[test]
    fn test_namespace_scope_keeps_all_shards() {
        let node = Node::secondary("s1").with_namespaces([4]);
        let input = shards(&["default", "nfs-01"]);
        assert_eq!(filter_shards(&input, &node).unwrap(), input);
    }

    #[test]
    fn test_malformed_scope_is_error() {
        let node = Node::secondary("s1").with_shards(Vec::<String>::new());
        assert!(filter_shards(&shards(&["default"]), &node).is_err());
        assert!(resource_in_scope(&node, &route("default", None)).is_err());
    }

    #[test]
    fn test_resource_in_scope_by_shard() {
        let node = Node::secondary("s1").with_shards(["default"]);
        assert!(resource_in_scope(&node, &route("default", None)).unwrap());
        assert!(!resource_in_scope(&node, &route("nfs-01", None)).unwrap());
    }

    #[test]
    fn test_resource_in_scope_by_namespace() {
        let node = Node::secondary("s1").with_namespaces([4, 5]);
        assert!(resource_in_scope(&node, &route("default", Some(4))).unwrap());
        assert!(!resource_in_scope(&node, &route("default", Some(6))).unwrap());
        // No namespace resolved means not selected.
        assert!(!resource_in_scope(&node, &route("default", None)).unwrap());
    }
}
