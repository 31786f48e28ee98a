// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Thin wrappers over the `metrics` facade. Nothing is exported unless the
//! embedding binary installs a recorder (Prometheus exporter, etc.).
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `fanout_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use fanout_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_push("full", 48_213);
//! metrics::record_fanout(Duration::from_millis(3), 120, 0);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Connections
// =============================================================================

/// Record an opened connection; `reconnect` when the client id was known.
pub fn record_client_connection(reconnect: bool) {
    let kind = if reconnect { "reconnect" } else { "new" };
    counter!("fanout_client_connections_total", "kind" => kind).increment(1);
}

/// Record a handshake refused (missing id, wrong path, connection limit).
pub fn record_connection_rejected(reason: &str) {
    counter!("fanout_connections_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record a client socket closing.
pub fn record_client_disconnect() {
    counter!("fanout_client_disconnects_total").increment(1);
}

/// Record a client record removed after its expiration window.
pub fn record_client_eviction() {
    counter!("fanout_client_evictions_total").increment(1);
}

/// Gauge: clients with an open socket.
pub fn set_connected_clients(count: usize) {
    gauge!("fanout_connected_clients").set(count as f64);
}

/// Gauge: all client records (connected + awaiting eviction).
pub fn set_registered_clients(count: usize) {
    gauge!("fanout_registered_clients").set(count as f64);
}

// =============================================================================
// Pushes
// =============================================================================

/// Record a push enqueued for one client. `kind` is `full`, `diff` or `no_data`.
pub fn record_push(kind: &str, payload_bytes: usize) {
    counter!("fanout_pushes_total", "kind" => kind.to_string()).increment(1);
    if payload_bytes > 0 {
        counter!("fanout_push_bytes_total", "kind" => kind.to_string())
            .increment(payload_bytes as u64);
    }
}

/// Record a push that could not be handed to a client's connection.
/// `reason` is `closed` or `overflow`.
pub fn record_send_failure(reason: &str) {
    counter!("fanout_send_failures_total", "reason" => reason.to_string()).increment(1);
}

/// Record one fan-out pass over all connected clients.
pub fn record_fanout(duration: Duration, pushed: usize, failed: usize) {
    counter!("fanout_rounds_total").increment(1);
    histogram!("fanout_round_duration_seconds").record(duration.as_secs_f64());
    histogram!("fanout_round_clients").record(pushed as f64);
    if failed > 0 {
        counter!("fanout_round_failures_total").increment(failed as u64);
    }
}

// =============================================================================
// Store
// =============================================================================

/// Record a store refresh attempt.
pub fn record_store_refresh(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("fanout_store_refreshes_total", "status" => status).increment(1);
    histogram!("fanout_store_refresh_duration_seconds").record(duration.as_secs_f64());
}

/// Gauge: timestamp of the cached snapshot.
pub fn set_current_timestamp(timestamp: u64) {
    gauge!("fanout_current_timestamp").set(timestamp as f64);
}

/// Gauge: diff origins held in the cache.
pub fn set_diff_history_len(len: usize) {
    gauge!("fanout_diff_history_len").set(len as f64);
}

/// Record a change notification; `accepted` if it was the new-data token.
pub fn record_notification(accepted: bool) {
    let status = if accepted { "accepted" } else { "ignored" };
    counter!("fanout_notifications_total", "status" => status).increment(1);
}

// =============================================================================
// Control messages
// =============================================================================

/// Record an acknowledgement; `regressed` if it moved backwards.
pub fn record_ack(regressed: bool) {
    counter!("fanout_acks_total").increment(1);
    if regressed {
        counter!("fanout_acks_regressed_total").increment(1);
    }
}

/// Record a client-initiated full resync.
pub fn record_full_request() {
    counter!("fanout_full_requests_total").increment(1);
}

/// Record an unparsable or unexpected client message.
pub fn record_malformed_message(kind: &str) {
    counter!("fanout_malformed_messages_total", "kind" => kind.to_string()).increment(1);
}

// =============================================================================
// Server
// =============================================================================

/// Gauge for server state.
pub fn set_server_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("fanout_server_state").set(value);
}
