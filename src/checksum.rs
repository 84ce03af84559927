// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Repository checksums.
//!
//! A checksum is the XOR of `sha256("<target> <name>")` over every ref,
//! hex encoded. XOR makes it independent of ref order, so the primary and a
//! secondary agree no matter how their ref listings are sorted.

use sha2::{Digest, Sha256};

/// A named ref and the object it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRef {
    pub name: String,
    pub target: String,
}

impl GitRef {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
        }
    }
}

/// Checksum of an empty repository.
pub const EMPTY_CHECKSUM: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Order-independent checksum over `refs`.
pub fn repository_checksum(refs: &[GitRef]) -> String {
    let mut acc = [0u8; 32];
    for r in refs {
        let mut hasher = Sha256::new();
        hasher.update(r.target.as_bytes());
        hasher.update(b" ");
        hasher.update(r.name.as_bytes());
        let digest = hasher.finalize();
        for (a, b) in acc.iter_mut().zip(digest.iter()) {
            *a ^= b;
        }
    }
    to_hex(&acc)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}
