// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - A secondary-side harness wired from the in-memory collaborators
//! - Mock collaborators that record calls and inject failures
//! - Event and route helpers

pub mod harness;
pub mod mocks;

#[allow(unused_imports)]
pub use harness::*;
#[allow(unused_imports)]
pub use mocks::*;
