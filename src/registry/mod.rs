// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry: durable per-resource replication state.
//!
//! - [`state`]: value types and the state machine
//! - [`store`]: the SQLite store with compare-and-set updates

pub mod state;
pub mod store;

pub use state::{ResourceKey, ResourceType, ResyncFlags, SubResource, SyncState};
pub use store::{Claim, RegistryFilter, RegistryRecord, RegistryStore};
