// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The cached (timestamp, snapshot, diffs) triple.

use bytes::Bytes;
use std::collections::BTreeMap;

/// One consistent read of the shared store.
///
/// `diffs` is keyed by *origin* timestamp: `diffs[t]` transforms the
/// snapshot at `t` into the snapshot at `timestamp`. Diffs never chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreState {
    pub timestamp: u64,
    pub full: Option<Bytes>,
    pub diffs: BTreeMap<u64, Bytes>,
}

impl StoreState {
    /// Nothing published yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new<I>(timestamp: u64, full: impl Into<Bytes>, diffs: I) -> Self
    where
        I: IntoIterator<Item = (u64, Bytes)>,
    {
        Self {
            timestamp,
            full: Some(full.into()),
            diffs: diffs.into_iter().collect(),
        }
    }

    /// True once a snapshot is available.
    pub fn has_data(&self) -> bool {
        self.full.is_some()
    }

    /// True if neither a timestamp nor a snapshot was read.
    pub fn is_empty(&self) -> bool {
        self.timestamp == 0 && self.full.is_none() && self.diffs.is_empty()
    }

    /// The diff that brings a client at `origin` up to `timestamp`.
    ///
    /// Origin `0` never has a diff: it means "needs full".
    pub fn diff_from(&self, origin: u64) -> Option<&Bytes> {
        if origin == 0 {
            return None;
        }
        self.diffs.get(&origin)
    }

    /// Drop origins that are not older than `timestamp`, then keep only
    /// the `depth` newest.
    pub fn retain_reachable(&mut self, depth: usize) {
        let timestamp = self.timestamp;
        self.diffs.retain(|&origin, _| origin != 0 && origin < timestamp);
        while self.diffs.len() > depth {
            self.diffs.pop_first();
        }
    }

    pub fn oldest_origin(&self) -> Option<u64> {
        self.diffs.keys().next().copied()
    }
}
