// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for the end-to-end, chaos and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - An in-process server over [`MemorySource`] with a real listener
//! - Raw WebSocket helpers for speaking the wire protocol directly

#![allow(dead_code)]

pub mod containers;
pub mod harness;

pub use containers::*;
pub use harness::*;
