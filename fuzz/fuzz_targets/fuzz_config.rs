// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for config parsing.
//!
//! Any document either parses into a config whose local node resolves, or
//! is rejected with an error.

#![no_main]

use geo_replication_engine::ReplicationConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|raw: &str| {
    if let Ok(config) = ReplicationConfig::from_json_str(raw) {
        // Validation passed, so these must not fail
        let node = config.local_node().expect("validated config has a local node");
        let _ = node.scope();
        let _ = config.settings.scheduler.retry_config();
        let _ = config.settings.log_cursor.poll_interval_duration();
    }
});
