// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the fan-out engine.
//!
//! Errors are categorized by their source (Redis, WebSocket transport, the
//! client protocol, ...) and carry enough context to be logged on their own.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Redis` | Yes | Network errors, timeouts, connection failures |
//! | `IncompleteState` | Yes | Store read returned a partial triple |
//! | `Transport` | Yes | WebSocket accept/read/write failure |
//! | `ClientSend` | No | Client's socket is gone (mark it disconnected) |
//! | `UnknownClient` | No | No connected record for this client id |
//! | `MissingClientId` | No | Handshake without a client id |
//! | `Protocol` | No | Malformed control message |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Server state machine violation |
//! | `Shutdown` | No | Server is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Nothing here is fatal to the process except `Config` at startup.

use thiserror::Error;

/// Result type alias for fan-out operations.
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Errors that can occur while serving clients.
#[derive(Error, Debug)]
pub enum FanoutError {
    /// Redis connection or command error.
    ///
    /// Raised by the shared store adapter. The cached state stays in place
    /// and the next change notification retries the read.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// The store returned a timestamp without a snapshot (or the reverse).
    #[error("Incomplete store state: {0}")]
    IncompleteState(String),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A control message could not be parsed or encoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection handshake carried no client id.
    #[error("Missing client id in connection request")]
    MissingClientId,

    /// No connected client is registered under this id.
    #[error("Unknown or disconnected client: {0}")]
    UnknownClient(String),

    /// Writing to a client's connection failed (receiver dropped).
    #[error("Send to client {client} failed: {message}")]
    ClientSend { client: String, message: String },

    /// WebSocket transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanoutError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::IncompleteState(_) => true, // producer mid-write, next tick fixes it
            Self::Transport(_) => true,
            Self::ClientSend { .. } => false,
            Self::UnknownClient(_) => false,
            Self::MissingClientId => false,
            Self::Protocol(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for FanoutError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for FanoutError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FanoutError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
