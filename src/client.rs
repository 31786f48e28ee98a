// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reference client for the fan-out protocol.
//!
//! Connects with a client id, asks for a full snapshot on open, assembles
//! each header + body pair, acknowledges what it applied and resyncs on any
//! framing problem. Used by the end-to-end tests and for load testing.
//!
//! ```rust,no_run
//! # async fn run() -> fanout_engine::Result<()> {
//! use fanout_engine::client::{ClientEvent, SyncClient};
//!
//! let mut client = SyncClient::connect("ws://127.0.0.1:8000/ws", "device-42").await?;
//! loop {
//!     match client.next_event().await? {
//!         ClientEvent::Applied(push) => println!("now at {}", push.target_timestamp()),
//!         ClientEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::connection::CLIENT_ID_PARAM;
use crate::error::{FanoutError, Result};
use crate::protocol::{Assembled, ClientMessage, FrameAssembler, Push, ResyncReason};
use crate::registry::client_tag;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What [`SyncClient::next_event`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A full snapshot or diff arrived intact and was acknowledged.
    Applied(Push),
    /// The server has nothing published yet.
    NoData,
    /// The server reported some other error.
    ServerError(String),
    /// Framing went wrong; a full snapshot has been requested.
    Resynced(ResyncReason),
    /// The server closed the connection.
    Closed,
}

/// One client session over a WebSocket.
pub struct SyncClient {
    socket: Socket,
    client_id: String,
    assembler: FrameAssembler,
    last_successful: u64,
    auto_ack: bool,
}

/// Append the client id to `base_url` as the `unique_id` query parameter.
pub fn session_url(base_url: &str, client_id: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(base_url)
        .map_err(|e| FanoutError::Config(format!("invalid server url {:?}: {}", base_url, e)))?;
    url.query_pairs_mut().append_pair(CLIENT_ID_PARAM, client_id);
    Ok(url)
}

impl SyncClient {
    /// Connect and send `request_full`.
    pub async fn connect(base_url: &str, client_id: &str) -> Result<Self> {
        let url = session_url(base_url, client_id)?;
        let (socket, response) = connect_async(url.as_str()).await?;

        info!(
            client = %client_tag(client_id),
            status = %response.status(),
            "Connected to fan-out server"
        );

        let mut client = Self {
            socket,
            client_id: client_id.to_string(),
            assembler: FrameAssembler::new(),
            last_successful: 0,
            auto_ack: true,
        };
        client.request_full(None).await?;
        Ok(client)
    }

    /// Leave acknowledgements to the caller (see [`ack`](Self::ack)).
    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Timestamp of the last push applied in full.
    pub fn last_successful_timestamp(&self) -> u64 {
        self.last_successful
    }

    pub async fn request_full(&mut self, reason: Option<&str>) -> Result<()> {
        let message = match reason {
            Some(reason) => ClientMessage::request_full(reason),
            None => ClientMessage::RequestFull { error: None },
        };
        self.send(&message).await
    }

    pub async fn ack(&mut self, timestamp: u64) -> Result<()> {
        let message = ClientMessage::ack(self.client_id.clone(), timestamp);
        self.send(&message).await
    }

    /// Send a raw text frame. Useful for probing the server with malformed
    /// input.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.socket.send(Message::text(text.into())).await?;
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = message.to_json()?;
        self.send_text(json).await
    }

    /// Wait for the next complete event.
    ///
    /// Pending headers, pings and pongs are consumed silently.
    pub async fn next_event(&mut self) -> Result<ClientEvent> {
        loop {
            let message = match self.socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(ClientEvent::Closed),
            };

            let assembled = match message {
                Message::Text(text) => self.assembler.on_text(text.as_str()),
                Message::Binary(payload) => self.assembler.on_binary(payload),
                Message::Close(_) => return Ok(ClientEvent::Closed),
                _ => continue,
            };

            match assembled {
                Assembled::Pending => continue,
                Assembled::Complete(push) => return self.apply(push).await,
                Assembled::NoData => return Ok(ClientEvent::NoData),
                Assembled::ServerError(error) => return Ok(ClientEvent::ServerError(error)),
                Assembled::Resync(reason) => return self.resync(reason).await,
            }
        }
    }

    async fn apply(&mut self, push: Push) -> Result<ClientEvent> {
        if let Push::Diff { from, .. } = push {
            if from != self.last_successful {
                return self
                    .resync(ResyncReason::OriginMismatch {
                        held: self.last_successful,
                        origin: from,
                    })
                    .await;
            }
        }

        self.last_successful = push.target_timestamp();
        debug!(
            client = %client_tag(&self.client_id),
            kind = push.kind(),
            timestamp = self.last_successful,
            bytes = push.payload().len(),
            "Applied push"
        );

        if self.auto_ack {
            self.ack(self.last_successful).await?;
        }
        Ok(ClientEvent::Applied(push))
    }

    async fn resync(&mut self, reason: ResyncReason) -> Result<ClientEvent> {
        warn!(client = %client_tag(&self.client_id), reason = %reason, "Resyncing");
        self.assembler.reset();
        self.request_full(Some(reason.as_str())).await?;
        Ok(ClientEvent::Resynced(reason))
    }

    /// Send a close frame and wait for the server to finish the handshake.
    pub async fn close(mut self) -> Result<()> {
        self.socket.close(None).await?;
        while let Some(message) = self.socket.next().await {
            if message.is_err() {
                break;
            }
        }
        Ok(())
    }
}
