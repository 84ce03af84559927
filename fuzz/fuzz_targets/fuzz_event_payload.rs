// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for stored event decoding.
//!
//! Event rows come from a shared database, so decoding must never panic on
//! arbitrary payloads or key columns.

#![no_main]

use geo_replication_engine::Event;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, Option<&str>, Option<i64>, i64)| {
    let (payload, resource_type, resource_id, created_at) = data;

    // Should never panic
    if let Ok(event) = Event::from_parts(1, resource_type, resource_id, payload, created_at) {
        // A decoded event that needs a resource always has one
        if event.kind.requires_resource() {
            assert!(event.resource.is_some());
        }
        // Re-encoding the kind must decode to the same kind
        let encoded = serde_json::to_string(&event.kind).expect("kind encodes");
        let again = Event::from_parts(1, resource_type, resource_id, &encoded, created_at)
            .expect("re-encoded payload decodes");
        assert_eq!(again.kind, event.kind);
    }
});
