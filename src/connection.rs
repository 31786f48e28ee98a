// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection lifecycle: handshake, control-message dispatch, disconnect.
//!
//! ```text
//!  CONNECTING ──handshake ok──► OPEN ──close / error / shutdown──► CLOSED
//!      │                         │                                   │
//!      └─ 400 no client id       ├─ data_received → record_ack       └─ mark_disconnected
//!      └─ 404 wrong path         └─ request_full  → push FULL
//! ```
//!
//! Each socket gets two tasks: the reader below, and a writer that drains
//! the connection's outbound queue so per-socket frame order is kept while
//! fan-out never waits on a socket.

use crate::engine::SyncEngine;
use crate::error::Result;
use crate::metrics;
use crate::protocol::{parse_client_message, ClientMessage, Frame, Inbound};
use crate::registry::{client_tag, ClientConnection, Registration};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, info_span, warn, Instrument};

/// Query parameter carrying the client id.
pub const CLIENT_ID_PARAM: &str = "unique_id";

/// Accepted alias for [`CLIENT_ID_PARAM`].
pub const CLIENT_ID_ALIAS: &str = "client_id";

/// Longest client id accepted at handshake.
pub const MAX_CLIENT_ID_LEN: usize = 512;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    WrongPath,
    MissingClientId,
    ClientIdTooLong,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::WrongPath => StatusCode::NOT_FOUND,
            Rejection::MissingClientId | Rejection::ClientIdTooLong => StatusCode::BAD_REQUEST,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::WrongPath => "wrong_path",
            Rejection::MissingClientId => "missing_client_id",
            Rejection::ClientIdTooLong => "client_id_too_long",
        }
    }

    fn into_response(self) -> ErrorResponse {
        let body = match self {
            Rejection::WrongPath => "unknown path".to_string(),
            Rejection::MissingClientId => format!("missing {} query parameter", CLIENT_ID_PARAM),
            Rejection::ClientIdTooLong => format!("client id longer than {} bytes", MAX_CLIENT_ID_LEN),
        };
        let mut response = ErrorResponse::new(Some(body));
        *response.status_mut() = self.status();
        response
    }
}

/// Validate the request target and pull out the client id.
pub fn client_id_from_target(
    path: &str,
    query: Option<&str>,
    path_prefix: Option<&str>,
) -> std::result::Result<String, Rejection> {
    if let Some(prefix) = path_prefix {
        if !path_matches(path, prefix) {
            return Err(Rejection::WrongPath);
        }
    }

    let query = query.unwrap_or("");
    let mut alias = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if value.trim().is_empty() {
            continue;
        }
        if key == CLIENT_ID_PARAM {
            return check_len(&value);
        }
        if key == CLIENT_ID_ALIAS && alias.is_none() {
            alias = Some(value.into_owned());
        }
    }

    match alias {
        Some(id) => check_len(&id),
        None => Err(Rejection::MissingClientId),
    }
}

/// `prefix` itself or anything below it, segment-wise.
fn path_matches(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn check_len(id: &str) -> std::result::Result<String, Rejection> {
    if id.len() > MAX_CLIENT_ID_LEN {
        Err(Rejection::ClientIdTooLong)
    } else {
        Ok(id.to_string())
    }
}

/// Resolves once shutdown is signalled (or the sender is gone).
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Shared state every connection task needs.
pub struct ConnectionContext {
    engine: Arc<SyncEngine>,
    path_prefix: Option<String>,
    shutdown: watch::Receiver<bool>,
    next_connection_id: AtomicU64,
}

impl ConnectionContext {
    pub fn new(
        engine: Arc<SyncEngine>,
        path_prefix: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            path_prefix,
            shutdown,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Run one socket from handshake to close.
    ///
    /// Refused handshakes are not errors: the HTTP response has already
    /// been written and the rejection is logged and counted.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut accepted: Option<String> = None;
        let mut rejected: Option<Rejection> = None;
        let prefix = self.path_prefix.as_deref();

        let callback = |request: &Request, response: Response| {
            let uri = request.uri();
            match client_id_from_target(uri.path(), uri.query(), prefix) {
                Ok(id) => {
                    accepted = Some(id);
                    Ok(response)
                }
                Err(rejection) => {
                    rejected = Some(rejection);
                    Err(rejection.into_response())
                }
            }
        };

        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await;

        let ws = match handshake {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                match rejected {
                    Some(rejection) => {
                        metrics::record_connection_rejected(rejection.reason());
                        info!(peer = %peer, reason = rejection.reason(), "Handshake rejected");
                        return Ok(());
                    }
                    None => {
                        metrics::record_connection_rejected("handshake_failed");
                        return Err(e.into());
                    }
                }
            }
            Err(_) => {
                metrics::record_connection_rejected("handshake_timeout");
                debug!(peer = %peer, "Handshake timed out");
                return Ok(());
            }
        };

        let Some(client_id) = accepted else {
            return Ok(());
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!(
            "connection",
            client = %client_tag(&client_id),
            conn = connection_id,
            peer = %peer
        );

        self.run_open(ws, client_id, connection_id).instrument(span).await;
        Ok(())
    }

    async fn run_open<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        client_id: String,
        connection_id: u64,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let registry = self.engine.registry();
        let (connection, outbound) = ClientConnection::channel(connection_id);
        let stalled = connection.clone();

        match registry.get_or_create(&client_id, connection) {
            Registration::New => info!("Client connected"),
            Registration::Reconnected { last_ack } => info!(last_ack, "Client reconnected"),
            Registration::Replaced { last_ack } => {
                info!(last_ack, "Client connected again, replacing previous socket")
            }
        }

        let (sink, mut inbound) = ws.split();
        let mut writer = tokio::spawn(
            write_frames(sink, outbound, self.shutdown.clone()).in_current_span(),
        );

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                message = inbound.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.dispatch(&client_id, connection_id, text.as_str());
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        debug!(bytes = payload.len(), "Ignoring binary frame from client");
                        metrics::record_malformed_message("binary");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Read failed");
                        break;
                    }
                },
                _ = stalled.overflowed() => {
                    warn!("Client stopped reading, closing connection");
                    break;
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        registry.mark_disconnected(&client_id, connection_id);
        info!("Client disconnected");

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
    }

    /// Handle one text frame from the client.
    fn dispatch(&self, client_id: &str, connection_id: u64, text: &str) {
        let message = match parse_client_message(text) {
            Ok(Inbound::Message(message)) => message,
            Ok(Inbound::Unknown(kind)) => {
                debug!(kind = %kind, "Ignoring unknown message type");
                metrics::record_malformed_message("unknown_type");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Malformed client message");
                metrics::record_malformed_message("malformed");
                return;
            }
        };

        let registry = self.engine.registry();
        if !registry.is_current(client_id, connection_id) {
            debug!("Ignoring message from superseded connection");
            return;
        }

        match message {
            ClientMessage::DataReceived {
                client_id: claimed,
                last_successful_timestamp,
            } => {
                if claimed.as_deref().is_some_and(|claimed| claimed != client_id) {
                    debug!("Acknowledgement names another client id, using the connection's");
                }
                if let Err(e) = registry.record_ack(client_id, last_successful_timestamp) {
                    debug!(error = %e, "Acknowledgement dropped");
                }
            }
            ClientMessage::RequestFull { error } => {
                metrics::record_full_request();
                match error.as_deref() {
                    None | Some("none") => debug!("Client requested full snapshot"),
                    Some(reason) => info!(reason, "Client requested resync"),
                }
                if let Err(e) = self.engine.push_to(client_id, true) {
                    debug!(error = %e, "Full push failed");
                }
            }
        }
    }
}

/// Writer task: forward queued frames to the socket, close on shutdown.
async fn write_frames<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: futures::Sink<Message> + Unpin,
    K::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::from(frame)).await {
                    debug!(error = %e, "Write failed");
                    return;
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}
