// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for repository checksums.
//!
//! Checks that ref order never changes the result.

#![no_main]

use geo_replication_engine::checksum::{repository_checksum, GitRef};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|refs: Vec<(&str, &str)>| {
    let refs: Vec<GitRef> = refs.into_iter().map(|(n, t)| GitRef::new(n, t)).collect();
    let forward = repository_checksum(&refs);

    let mut reversed = refs.clone();
    reversed.reverse();
    assert_eq!(forward, repository_checksum(&reversed));

    assert_eq!(forward.len(), 64);
});
