// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process server harness.

use bytes::Bytes;
use fanout_engine::client::{ClientEvent, SyncClient};
use fanout_engine::protocol::{ClientMessage, ServerMessage};
use fanout_engine::store::{MemorySource, StoreState};
use fanout_engine::{FanoutConfig, FanoutServer};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Snapshot `S<ts>` with one diff `D<origin>` per origin.
pub fn state(timestamp: u64, origins: &[u64]) -> StoreState {
    StoreState::new(
        timestamp,
        Bytes::from(format!("S{}", timestamp)),
        origins
            .iter()
            .map(|origin| (*origin, Bytes::from(format!("D{}", origin)))),
    )
}

/// A running server over a [`MemorySource`].
pub struct TestServer {
    pub server: FanoutServer,
    pub source: Arc<MemorySource>,
    pub url: String,
}

impl TestServer {
    pub async fn start(initial: StoreState) -> Self {
        Self::start_with(FanoutConfig::for_testing(), initial).await
    }

    pub async fn start_empty() -> Self {
        Self::start_with(FanoutConfig::for_testing(), StoreState::empty()).await
    }

    pub async fn start_with(config: FanoutConfig, initial: StoreState) -> Self {
        let path = config.server.path_prefix.clone().unwrap_or_else(|| "/ws".to_string());
        let source = Arc::new(MemorySource::with_state(initial));
        let mut server = FanoutServer::with_source(config, source.clone()).unwrap();
        server.start().await.unwrap();

        let addr = server.local_addr().unwrap();
        Self {
            server,
            source,
            url: format!("ws://{}{}", addr, path),
        }
    }

    /// Publish `next` and wait until the server has loaded it.
    pub async fn publish(&self, next: StoreState) {
        let timestamp = next.timestamp;
        self.source.publish(next, "new_data");
        let store = self.server.store().clone();
        assert!(
            eventually(|| store.current_timestamp() == timestamp).await,
            "server never loaded timestamp {}",
            timestamp
        );
    }

    pub async fn client(&self, id: &str) -> SyncClient {
        SyncClient::connect(&self.url, id).await.unwrap()
    }

    /// Connect without sending anything.
    pub async fn raw(&self, id: &str) -> RawSocket {
        let url = format!("{}?unique_id={}", self.url, id);
        let (socket, _) = connect_async(url.as_str()).await.unwrap();
        let registry = self.server.registry().clone();
        let id = id.to_string();
        assert!(eventually(|| registry.is_connected(&id)).await);
        socket
    }

    pub async fn wait_for_ack(&self, id: &str, timestamp: u64) {
        let registry = self.server.registry().clone();
        assert!(
            eventually(|| registry.last_ack(id) == Some(timestamp)).await,
            "client {} never acknowledged {} (last_ack {:?})",
            id,
            timestamp,
            registry.last_ack(id)
        );
    }

    pub async fn stop(mut self) {
        self.server.shutdown().await;
    }
}

/// Poll `check` every 10ms until it holds or [`WAIT`] passes.
pub async fn eventually<F>(check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Next client event, failing the test if none arrives in time.
pub async fn next_event(client: &mut SyncClient) -> ClientEvent {
    tokio::time::timeout(WAIT, client.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("client error")
}

pub async fn send_json(socket: &mut RawSocket, message: &ClientMessage) {
    let json = message.to_json().unwrap();
    socket.send(Message::text(json)).await.unwrap();
}

pub async fn send_ack(socket: &mut RawSocket, id: &str, timestamp: u64) {
    send_json(socket, &ClientMessage::ack(id, timestamp)).await;
}

/// Next non-control frame from a raw socket.
pub async fn read_frame(socket: &mut RawSocket) -> Message {
    loop {
        let message = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("read failed");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

/// Read a header and, unless it is an error, its binary body.
pub async fn read_push(socket: &mut RawSocket) -> (ServerMessage, Option<Bytes>) {
    let header = match read_frame(socket).await {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(text.as_str()).unwrap(),
        other => panic!("expected text header, got {:?}", other),
    };
    if matches!(header, ServerMessage::Error { .. }) {
        return (header, None);
    }
    match read_frame(socket).await {
        Message::Binary(body) => (header, Some(body)),
        other => panic!("expected binary body, got {:?}", other),
    }
}
