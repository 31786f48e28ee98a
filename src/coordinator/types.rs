// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!    │                              │
//!    │ shutdown()                   ├── bind / subscribe failed ──→ Failed
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!                          shutdown()
//! ```
//!
//! - **Created**: built, nothing spawned.
//! - **Connecting**: initial store read, subscription, listener bind.
//! - **Running**: accepting sockets and fanning out on every notification.
//! - **ShuttingDown**: close frames sent, connections draining.
//! - **Stopped**: all tasks finished.
//! - **Failed**: startup could not complete.

/// Lifecycle state of a [`FanoutServer`](super::FanoutServer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Connecting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Created => "Created",
            ServerState::Connecting => "Connecting",
            ServerState::Running => "Running",
            ServerState::ShuttingDown => "ShuttingDown",
            ServerState::Stopped => "Stopped",
            ServerState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time health snapshot. Built from cached state only; no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: ServerState,

    /// Running and still subscribed to change notifications.
    ///
    /// The subscription is never re-established locally, so once it ends
    /// this stays `false` until restart.
    pub ready: bool,

    /// Ready and holding a snapshot to serve.
    pub healthy: bool,

    pub has_data: bool,
    pub current_timestamp: u64,
    pub diff_history_len: usize,

    /// Client records, including those awaiting eviction.
    pub clients_total: usize,
    pub clients_connected: usize,

    /// Sockets holding a connection slot (includes mid-handshake).
    pub connections_open: usize,
    pub max_connections: usize,

    pub notifications_active: bool,
}
