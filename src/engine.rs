// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronization engine: decides FULL vs DIFF per client and sends it.
//!
//! # Decision Rule
//!
//! ```text
//! no snapshot yet                     → error/no_data
//! force_full                          → FULL(current)
//! last_ack is an origin in diffs      → DIFF(last_ack → current)
//! anything else (incl. 0, current)    → FULL(current)
//! ```
//!
//! Diffs are never chained. A client whose acknowledged timestamp has
//! aged out of the history just gets the full snapshot.

use crate::error::{FanoutError, Result};
use crate::metrics;
use crate::protocol::{Frame, Push, ServerMessage};
use crate::registry::{client_tag, ClientRegistry, ConnectedClient, SendFailure};
use crate::store::{SharedStore, StoreState};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What to send one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    Push(Push),
    NoData,
}

/// Apply the decision rule to a cached state.
pub fn select_push(last_ack: u64, state: &StoreState, force_full: bool) -> SyncDecision {
    let Some(full) = &state.full else {
        return SyncDecision::NoData;
    };

    if !force_full {
        if let Some(diff) = state.diff_from(last_ack) {
            return SyncDecision::Push(Push::Diff {
                from: last_ack,
                to: state.timestamp,
                payload: diff.clone(),
            });
        }
    }

    SyncDecision::Push(Push::Full {
        timestamp: state.timestamp,
        payload: full.clone(),
    })
}

/// What was sent to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Full { timestamp: u64 },
    Diff { from: u64, to: u64 },
    NoData,
}

/// Per-pass tally from [`SyncEngine::fan_out`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub full: usize,
    pub diff: usize,
    pub no_data: usize,
    pub failed: usize,
}

impl FanoutReport {
    /// Clients that were sent something.
    pub fn delivered(&self) -> usize {
        self.full + self.diff + self.no_data
    }

    fn count(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Full { .. } => self.full += 1,
            SyncOutcome::Diff { .. } => self.diff += 1,
            SyncOutcome::NoData => self.no_data += 1,
        }
    }
}

/// Pushes cached state to connected clients.
pub struct SyncEngine {
    store: Arc<SharedStore>,
    registry: Arc<ClientRegistry>,
}

impl SyncEngine {
    pub fn new(store: Arc<SharedStore>, registry: Arc<ClientRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Send every connected client what it needs to reach the current state.
    ///
    /// Sends only enqueue, so a slow client never holds up the others. A
    /// client whose connection is gone is marked disconnected and the pass
    /// continues.
    pub fn fan_out(&self) -> FanoutReport {
        let start = Instant::now();
        let state = self.store.snapshot();
        let mut report = FanoutReport::default();

        self.registry.for_each_connected(|client| match deliver(client, &state, false) {
            Ok(outcome) => report.count(outcome),
            Err(e) => {
                report.failed += 1;
                warn!(client = %client_tag(&client.client_id), error = %e, "Push failed, marking client disconnected");
                self.registry
                    .mark_disconnected(&client.client_id, client.connection.id());
            }
        });

        metrics::record_fanout(start.elapsed(), report.delivered(), report.failed);
        info!(
            timestamp = state.timestamp,
            full = report.full,
            diff = report.diff,
            no_data = report.no_data,
            failed = report.failed,
            elapsed_us = start.elapsed().as_micros() as u64,
            "Fan-out complete"
        );
        report
    }

    /// Serve one client, e.g. on `request_full` or right after connecting.
    pub fn push_to(&self, client_id: &str, force_full: bool) -> Result<SyncOutcome> {
        let client = self
            .registry
            .connected_client(client_id)
            .ok_or_else(|| FanoutError::UnknownClient(client_tag(client_id)))?;
        let state = self.store.snapshot();

        match deliver(&client, &state, force_full) {
            Ok(outcome) => {
                debug!(client = %client_tag(client_id), ?outcome, force_full, "Pushed to client");
                Ok(outcome)
            }
            Err(e) => {
                self.registry
                    .mark_disconnected(client_id, client.connection.id());
                Err(e)
            }
        }
    }
}

fn deliver(client: &ConnectedClient, state: &StoreState, force_full: bool) -> Result<SyncOutcome> {
    let (frames, outcome, kind, bytes) = match select_push(client.last_ack, state, force_full) {
        SyncDecision::Push(push) => {
            let outcome = match &push {
                Push::Full { timestamp, .. } => SyncOutcome::Full {
                    timestamp: *timestamp,
                },
                Push::Diff { from, to, .. } => SyncOutcome::Diff { from: *from, to: *to },
            };
            let kind = push.kind();
            let bytes = push.payload().len();
            (Vec::from(push.into_frames()?), outcome, kind, bytes)
        }
        SyncDecision::NoData => (
            vec![Frame::Text(ServerMessage::no_data().to_json()?)],
            SyncOutcome::NoData,
            "no_data",
            0,
        ),
    };

    for frame in frames {
        if let Err(failure) = client.connection.send(frame) {
            metrics::record_send_failure(failure.as_str());
            return Err(FanoutError::ClientSend {
                client: client_tag(&client.client_id),
                message: match failure {
                    SendFailure::Closed => "connection closed".to_string(),
                    SendFailure::Overflow => "outbound queue full".to_string(),
                },
            });
        }
    }

    metrics::record_push(kind, bytes);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientConnection;
    use crate::store::MemorySource;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn scenario_state() -> StoreState {
        StoreState::new(
            100,
            Bytes::from_static(b"S100"),
            vec![
                (90, Bytes::from_static(b"D90")),
                (95, Bytes::from_static(b"D95")),
            ],
        )
    }

    async fn engine_with(state: StoreState) -> SyncEngine {
        let source = Arc::new(MemorySource::with_state(state));
        let store = Arc::new(SharedStore::new(source, "new_data"));
        store.refresh().await;
        let registry = Arc::new(ClientRegistry::new(Duration::from_secs(300)));
        SyncEngine::new(store, registry)
    }

    fn connect(engine: &SyncEngine, id: &str, conn_id: u64, last_ack: u64) -> Receiver<Frame> {
        let (connection, rx) = ClientConnection::channel(conn_id);
        engine.registry().get_or_create(id, connection);
        if last_ack != 0 {
            engine.registry().record_ack(id, last_ack).unwrap();
        }
        rx
    }

    fn drain(rx: &mut Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn header(frame: &Frame) -> ServerMessage {
        match frame {
            Frame::Text(text) => serde_json::from_str(text).unwrap(),
            Frame::Binary(_) => panic!("expected a text header"),
        }
    }

    #[test]
    fn test_zero_ack_gets_full() {
        let decision = select_push(0, &scenario_state(), false);
        assert!(matches!(decision, SyncDecision::Push(Push::Full { timestamp: 100, .. })));
    }

    #[test]
    fn test_known_origin_gets_diff() {
        let decision = select_push(95, &scenario_state(), false);
        assert_eq!(
            decision,
            SyncDecision::Push(Push::Diff {
                from: 95,
                to: 100,
                payload: Bytes::from_static(b"D95")
            })
        );
    }

    #[test]
    fn test_unknown_origin_gets_full() {
        assert!(matches!(
            select_push(92, &scenario_state(), false),
            SyncDecision::Push(Push::Full { .. })
        ));
        // up to date still gets the snapshot
        assert!(matches!(
            select_push(100, &scenario_state(), false),
            SyncDecision::Push(Push::Full { .. })
        ));
    }

    #[test]
    fn test_force_full_overrides_diff() {
        assert!(matches!(
            select_push(95, &scenario_state(), true),
            SyncDecision::Push(Push::Full { .. })
        ));
    }

    #[test]
    fn test_no_snapshot_is_no_data() {
        assert_eq!(select_push(95, &StoreState::empty(), false), SyncDecision::NoData);
        assert_eq!(select_push(0, &StoreState::empty(), true), SyncDecision::NoData);
    }

    #[tokio::test]
    async fn test_fan_out_scenario() {
        let engine = engine_with(scenario_state()).await;
        let mut a = connect(&engine, "A", 1, 0);
        let mut b = connect(&engine, "B", 2, 95);
        let mut c = connect(&engine, "C", 3, 92);

        let report = engine.fan_out();
        assert_eq!(
            report,
            FanoutReport {
                full: 2,
                diff: 1,
                no_data: 0,
                failed: 0
            }
        );

        let a = drain(&mut a);
        assert_eq!(a.len(), 2);
        assert_eq!(header(&a[0]), ServerMessage::DataFull { timestamp: 100, data_size: 4 });
        assert_eq!(a[1], Frame::Binary(Bytes::from_static(b"S100")));

        let b = drain(&mut b);
        assert_eq!(
            header(&b[0]),
            ServerMessage::DataUpdate {
                timestamp_from: 95,
                timestamp_to: 100,
                data_size: 3
            }
        );
        assert_eq!(b[1], Frame::Binary(Bytes::from_static(b"D95")));

        let c = drain(&mut c);
        assert!(matches!(header(&c[0]), ServerMessage::DataFull { timestamp: 100, .. }));
    }

    #[tokio::test]
    async fn test_fan_out_does_not_touch_acks() {
        let engine = engine_with(scenario_state()).await;
        let _rx = connect(&engine, "B", 1, 95);
        engine.fan_out();
        assert_eq!(engine.registry().last_ack("B"), Some(95));
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let engine = engine_with(scenario_state()).await;
        let mut healthy = connect(&engine, "healthy", 1, 90);
        let dead = connect(&engine, "dead", 2, 0);
        let mut other = connect(&engine, "other", 3, 0);
        drop(dead);

        let report = engine.fan_out();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered(), 2);

        assert_eq!(drain(&mut healthy).len(), 2);
        assert_eq!(drain(&mut other).len(), 2);
        assert!(!engine.registry().is_connected("dead"));
        assert!(engine.registry().contains("dead"));
    }

    #[tokio::test]
    async fn test_fan_out_drops_client_that_stops_reading() {
        let engine = engine_with(scenario_state()).await;
        let (connection, _undrained) = ClientConnection::with_capacity(1, 4);
        engine.registry().get_or_create("stalled", connection);
        let mut healthy = connect(&engine, "healthy", 2, 0);

        // two pushes fill four slots, the third overflows
        for _ in 0..2 {
            assert_eq!(engine.fan_out().failed, 0);
        }
        let report = engine.fan_out();
        assert_eq!(report.failed, 1);
        assert!(!engine.registry().is_connected("stalled"));

        // later passes skip it entirely
        assert_eq!(engine.fan_out().failed, 0);
        assert_eq!(drain(&mut healthy).len(), 8);
    }

    #[tokio::test]
    async fn test_fan_out_without_data_sends_no_data() {
        let engine = engine_with(StoreState::empty()).await;
        let mut rx = connect(&engine, "A", 1, 0);

        let report = engine.fan_out();
        assert_eq!(report.no_data, 1);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(header(&frames[0]), ServerMessage::no_data());
    }

    #[tokio::test]
    async fn test_push_to_forced_full() {
        let engine = engine_with(scenario_state()).await;
        let mut rx = connect(&engine, "B", 1, 95);

        assert_eq!(engine.push_to("B", false).unwrap(), SyncOutcome::Diff { from: 95, to: 100 });
        assert_eq!(engine.push_to("B", true).unwrap(), SyncOutcome::Full { timestamp: 100 });
        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[tokio::test]
    async fn test_push_to_unknown_or_closed() {
        let engine = engine_with(scenario_state()).await;
        assert!(matches!(
            engine.push_to("nobody", true),
            Err(FanoutError::UnknownClient(_))
        ));

        let rx = connect(&engine, "A", 1, 0);
        drop(rx);
        assert!(matches!(
            engine.push_to("A", true),
            Err(FanoutError::ClientSend { .. })
        ));
        assert!(!engine.registry().is_connected("A"));
    }
}
