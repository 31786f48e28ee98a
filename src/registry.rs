// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client registry.
//!
//! Maps the client-supplied id to its connection handle and last
//! acknowledged timestamp. Records survive disconnects for the expiration
//! window so a client that drops and comes back can still be sent a diff.
//!
//! # Record Lifecycle
//!
//! ```text
//!   get_or_create ──► Connected ──mark_disconnected──► Disconnected(epoch)
//!                        ▲                                  │
//!                        └──────── get_or_create ◄──────────┤
//!                                                           │ window elapsed,
//!                                                           ▼ same epoch
//!                                                        evicted
//! ```
//!
//! Every disconnect gets a fresh epoch and its own eviction timer; the
//! timer only evicts if the record is still disconnected under that epoch.

use crate::error::{FanoutError, Result};
use crate::metrics;
use crate::protocol::Frame;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Eviction deadline used when the window does not fit on the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Short, stable fingerprint of a client id for logs.
///
/// Ids are untrusted peer input and may be long; we never log them raw.
pub fn client_tag(client_id: &str) -> String {
    let digest = Sha256::digest(client_id.as_bytes());
    hex::encode(&digest[..6])
}

/// Frames a socket may have queued before it is treated as stalled.
///
/// One push is two frames, so this holds a few dozen undelivered pushes.
pub const OUTBOUND_QUEUE_FRAMES: usize = 64;

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The socket's writer is gone.
    Closed,
    /// The peer stopped reading and the queue filled up.
    Overflow,
}

impl SendFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendFailure::Closed => "closed",
            SendFailure::Overflow => "overflow",
        }
    }
}

/// Sending half of one socket's outbound queue.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: u64,
    tx: mpsc::Sender<Frame>,
    overflow: Arc<Notify>,
}

impl ClientConnection {
    /// New handle plus the receiver its writer task drains.
    pub fn channel(id: u64) -> (Self, mpsc::Receiver<Frame>) {
        Self::with_capacity(id, OUTBOUND_QUEUE_FRAMES)
    }

    pub fn with_capacity(id: u64, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let overflow = Arc::new(Notify::new());
        (Self { id, tx, overflow }, rx)
    }

    /// Server-assigned connection id (distinct from the client id).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue wakes [`overflowed`](Self::overflowed) so the socket's
    /// reader can close it.
    pub fn send(&self, frame: Frame) -> std::result::Result<(), SendFailure> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SendFailure::Closed),
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                Err(SendFailure::Overflow)
            }
        }
    }

    /// Resolves once a send has found the queue full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone)]
pub enum ClientState {
    Connected(ClientConnection),
    Disconnected { since: Instant, epoch: u64 },
}

#[derive(Debug)]
struct ClientRecord {
    state: ClientState,
    last_ack: u64,
    eviction: Option<AbortHandle>,
}

impl ClientRecord {
    fn cancel_eviction(&mut self) {
        if let Some(handle) = self.eviction.take() {
            handle.abort();
        }
    }
}

/// What `get_or_create` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this id was seen (or it had been evicted).
    New,
    /// Known id coming back from a disconnect.
    Reconnected { last_ack: u64 },
    /// Known id that was still connected; the old socket is superseded.
    Replaced { last_ack: u64 },
}

impl Registration {
    pub fn last_ack(&self) -> u64 {
        match self {
            Registration::New => 0,
            Registration::Reconnected { last_ack } | Registration::Replaced { last_ack } => *last_ack,
        }
    }
}

/// A connected client as seen at snapshot time.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub client_id: String,
    pub connection: ClientConnection,
    pub last_ack: u64,
}

/// Concurrency-safe map of client id → record.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: DashMap<String, ClientRecord>,
    expiration_window: Duration,
    epochs: AtomicU64,
}

impl ClientRegistry {
    pub fn new(expiration_window: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            expiration_window,
            epochs: AtomicU64::new(0),
        }
    }

    pub fn expiration_window(&self) -> Duration {
        self.expiration_window
    }

    /// Register a connection under `client_id`.
    ///
    /// A known id keeps its last acknowledged timestamp and any pending
    /// eviction is cancelled.
    pub fn get_or_create(&self, client_id: &str, connection: ClientConnection) -> Registration {
        let registration = match self.clients.entry(client_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.cancel_eviction();
                let was_connected = matches!(record.state, ClientState::Connected(_));
                record.state = ClientState::Connected(connection);
                if was_connected {
                    Registration::Replaced {
                        last_ack: record.last_ack,
                    }
                } else {
                    Registration::Reconnected {
                        last_ack: record.last_ack,
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(ClientRecord {
                    state: ClientState::Connected(connection),
                    last_ack: 0,
                    eviction: None,
                });
                Registration::New
            }
        };

        metrics::record_client_connection(registration != Registration::New);
        self.publish_gauges();
        registration
    }

    /// Mark `client_id` disconnected if `connection_id` is still its
    /// current socket, and schedule eviction.
    ///
    /// Returns `false` when the record is gone or already belongs to a
    /// newer connection. Must be called within a tokio runtime.
    pub fn mark_disconnected(self: &Arc<Self>, client_id: &str, connection_id: u64) -> bool {
        let Some(mut record) = self.clients.get_mut(client_id) else {
            return false;
        };
        match &record.state {
            ClientState::Connected(conn) if conn.id() == connection_id => {}
            _ => return false,
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(self.expiration_window)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        record.cancel_eviction();
        record.state = ClientState::Disconnected { since: now, epoch };

        let registry = Arc::downgrade(self);
        let id = client_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            evict_after_window(registry, &id, epoch);
        });
        record.eviction = Some(timer.abort_handle());
        drop(record);

        metrics::record_client_disconnect();
        self.publish_gauges();
        true
    }

    /// Remove `client_id` if it is disconnected. Connected records are
    /// never removed.
    pub fn try_evict(&self, client_id: &str) -> bool {
        let removed = self
            .clients
            .remove_if(client_id, |_, record| {
                matches!(record.state, ClientState::Disconnected { .. })
            })
            .is_some();
        if removed {
            metrics::record_client_eviction();
            self.publish_gauges();
        }
        removed
    }

    fn evict_epoch(&self, client_id: &str, epoch: u64) -> bool {
        let removed = self
            .clients
            .remove_if(client_id, |_, record| {
                matches!(record.state, ClientState::Disconnected { epoch: e, .. } if e == epoch)
            })
            .is_some();
        if removed {
            metrics::record_client_eviction();
            self.publish_gauges();
        }
        removed
    }

    /// Store the client's acknowledged timestamp. Last write wins.
    pub fn record_ack(&self, client_id: &str, timestamp: u64) -> Result<()> {
        let mut record = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| FanoutError::UnknownClient(client_tag(client_id)))?;

        let regressed = timestamp < record.last_ack;
        if regressed {
            debug!(
                client = %client_tag(client_id),
                previous = record.last_ack,
                timestamp,
                "Acknowledged timestamp moved backwards"
            );
        }
        record.last_ack = timestamp;
        metrics::record_ack(regressed);
        Ok(())
    }

    /// Snapshot of every connected client.
    pub fn connected_clients(&self) -> Vec<ConnectedClient> {
        self.clients
            .iter()
            .filter_map(|entry| match &entry.state {
                ClientState::Connected(connection) => Some(ConnectedClient {
                    client_id: entry.key().clone(),
                    connection: connection.clone(),
                    last_ack: entry.last_ack,
                }),
                ClientState::Disconnected { .. } => None,
            })
            .collect()
    }

    /// Call `f` for each connected client.
    ///
    /// Iterates a snapshot taken before the first call, so `f` may touch
    /// the registry freely.
    pub fn for_each_connected<F>(&self, mut f: F)
    where
        F: FnMut(&ConnectedClient),
    {
        for client in self.connected_clients() {
            f(&client);
        }
    }

    pub fn connected_client(&self, client_id: &str) -> Option<ConnectedClient> {
        let record = self.clients.get(client_id)?;
        match &record.state {
            ClientState::Connected(connection) => Some(ConnectedClient {
                client_id: client_id.to_string(),
                connection: connection.clone(),
                last_ack: record.last_ack,
            }),
            ClientState::Disconnected { .. } => None,
        }
    }

    pub fn state(&self, client_id: &str) -> Option<ClientState> {
        self.clients.get(client_id).map(|record| record.state.clone())
    }

    pub fn last_ack(&self, client_id: &str) -> Option<u64> {
        self.clients.get(client_id).map(|record| record.last_ack)
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|record| matches!(record.state, ClientState::Connected(_)))
    }

    /// True if `connection_id` is the live socket for `client_id`.
    pub fn is_current(&self, client_id: &str, connection_id: u64) -> bool {
        self.clients.get(client_id).is_some_and(|record| {
            matches!(&record.state, ClientState::Connected(conn) if conn.id() == connection_id)
        })
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// All records, connected or awaiting eviction.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|entry| matches!(entry.state, ClientState::Connected(_)))
            .count()
    }

    fn publish_gauges(&self) {
        metrics::set_registered_clients(self.len());
        metrics::set_connected_clients(self.connected_count());
    }
}

fn evict_after_window(registry: Weak<ClientRegistry>, client_id: &str, epoch: u64) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    if registry.evict_epoch(client_id, epoch) {
        info!(client = %client_tag(client_id), epoch, "Evicted expired client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn registry() -> Arc<ClientRegistry> {
        Arc::new(ClientRegistry::new(WINDOW))
    }

    fn conn(id: u64) -> ClientConnection {
        ClientConnection::channel(id).0
    }

    /// Let spawned eviction timers run after the clock moves.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_client_tag_is_short_and_stable() {
        let tag = client_tag("some-long-browser-generated-id");
        assert_eq!(tag.len(), 12);
        assert_eq!(tag, client_tag("some-long-browser-generated-id"));
        assert_ne!(tag, client_tag("another"));
    }

    #[test]
    fn test_get_or_create_new_then_replaced() {
        let reg = registry();
        assert_eq!(reg.get_or_create("a", conn(1)), Registration::New);
        reg.record_ack("a", 100).unwrap();

        let second = reg.get_or_create("a", conn(2));
        assert_eq!(second, Registration::Replaced { last_ack: 100 });
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.connected_client("a").unwrap().connection.id(), 2);
    }

    #[test]
    fn test_connection_send_detects_closed_receiver() {
        let (connection, rx) = ClientConnection::channel(7);
        assert!(connection.send(Frame::Text("x".into())).is_ok());
        drop(rx);
        assert!(connection.is_closed());
        assert_eq!(
            connection.send(Frame::Text("y".into())),
            Err(SendFailure::Closed)
        );
    }

    #[tokio::test]
    async fn test_undrained_queue_overflows_and_signals() {
        let (connection, _rx) = ClientConnection::with_capacity(7, 4);
        for i in 0..4 {
            assert!(connection.send(Frame::Text(i.to_string())).is_ok());
        }
        assert_eq!(
            connection.send(Frame::Text("late".into())),
            Err(SendFailure::Overflow)
        );

        let signalled =
            tokio::time::timeout(Duration::from_secs(1), connection.overflowed()).await;
        assert!(signalled.is_ok());
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow_the_clock() {
        let reg = Arc::new(ClientRegistry::new(Duration::MAX));
        reg.get_or_create("a", conn(1));
        assert!(reg.mark_disconnected("a", 1));
        assert!(matches!(reg.state("a"), Some(ClientState::Disconnected { .. })));

        // eviction is still scheduled, so reconnecting cancels a live timer
        assert!(matches!(
            reg.get_or_create("a", conn(2)),
            Registration::Reconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_reconnect_preserves_last_ack() {
        let reg = registry();
        reg.get_or_create("a", conn(1));
        reg.record_ack("a", 95).unwrap();
        assert!(reg.mark_disconnected("a", 1));
        assert!(!reg.is_connected("a"));

        let again = reg.get_or_create("a", conn(2));
        assert_eq!(again, Registration::Reconnected { last_ack: 95 });
        assert!(reg.is_connected("a"));
    }

    #[tokio::test]
    async fn test_stale_connection_close_is_ignored() {
        let reg = registry();
        reg.get_or_create("a", conn(1));
        reg.get_or_create("a", conn(2));

        assert!(!reg.is_current("a", 1));
        assert!(reg.is_current("a", 2));
        assert!(!reg.mark_disconnected("a", 1));
        assert!(reg.is_connected("a"));
        assert!(!reg.mark_disconnected("missing", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_exactly_the_window() {
        let reg = registry();
        reg.get_or_create("a", conn(1));
        reg.mark_disconnected("a", 1);

        tokio::time::advance(WINDOW - Duration::from_millis(1)).await;
        settle().await;
        assert!(reg.contains("a"));

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert!(!reg.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_eviction() {
        let reg = registry();
        reg.get_or_create("a", conn(1));
        reg.mark_disconnected("a", 1);

        tokio::time::advance(WINDOW / 2).await;
        reg.get_or_create("a", conn(2));

        tokio::time::advance(WINDOW).await;
        settle().await;
        assert!(reg.is_connected("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_timer_cannot_evict_after_later_disconnect() {
        let reg = registry();
        reg.get_or_create("a", conn(1));
        reg.mark_disconnected("a", 1);

        tokio::time::advance(WINDOW / 2).await;
        reg.get_or_create("a", conn(2));
        reg.mark_disconnected("a", 2);

        // first disconnect's window has passed, second's has not
        tokio::time::advance(WINDOW / 2 + Duration::from_secs(1)).await;
        settle().await;
        assert!(reg.contains("a"));

        tokio::time::advance(WINDOW / 2).await;
        settle().await;
        assert!(!reg.contains("a"));
    }

    #[tokio::test]
    async fn test_try_evict_only_disconnected() {
        let reg = registry();
        reg.get_or_create("a", conn(1));
        assert!(!reg.try_evict("a"));

        reg.mark_disconnected("a", 1);
        assert!(reg.try_evict("a"));
        assert!(reg.is_empty());
        assert!(!reg.try_evict("a"));
    }

    #[test]
    fn test_record_ack_last_write_wins() {
        let reg = registry();
        reg.get_or_create("a", conn(1));
        reg.record_ack("a", 100).unwrap();
        reg.record_ack("a", 90).unwrap();
        assert_eq!(reg.last_ack("a"), Some(90));
    }

    #[test]
    fn test_record_ack_unknown_client() {
        let reg = registry();
        let err = reg.record_ack("ghost", 1).unwrap_err();
        assert!(matches!(err, FanoutError::UnknownClient(_)));
    }

    #[tokio::test]
    async fn test_for_each_connected_skips_disconnected_and_allows_mutation() {
        let reg = registry();
        reg.get_or_create("a", conn(1));
        reg.get_or_create("b", conn(2));
        reg.get_or_create("c", conn(3));
        reg.mark_disconnected("c", 3);

        let mut seen = Vec::new();
        reg.for_each_connected(|client| {
            // mutating from inside the callback must not deadlock
            reg.record_ack(&client.client_id, 42).unwrap();
            seen.push(client.client_id.clone());
        });
        seen.sort();

        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(reg.connected_count(), 2);
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.last_ack("b"), Some(42));
    }
}
