// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Fan-out Engine
//!
//! A realtime synchronization server that pushes one continuously updated
//! dataset to many WebSocket clients as a full snapshot plus diffs.
//!
//! ## Architecture
//!
//! An external producer writes `(timestamp, snapshot, diffs)` to Redis and
//! posts a token on a pub/sub channel. Every token triggers one refresh and
//! one fan-out pass:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              fanout-engine                               │
//! │                                                                          │
//! │  ┌──────────────┐  refresh  ┌──────────────┐  fan_out  ┌──────────────┐  │
//! │  │ notification │──────────►│ SharedStore  │──────────►│  SyncEngine  │  │
//! │  │  listener    │           │ (ArcSwap)    │           │ FULL / DIFF  │  │
//! │  └──────────────┘           └──────────────┘           └──────┬───────┘  │
//! │         ▲                                                     │          │
//! │         │ PUBLISH new_data                                    ▼          │
//! │  ┌──────┴───────┐           ┌──────────────┐  frames   ┌──────────────┐  │
//! │  │    Redis     │           │ClientRegistry│◄─────────►│ connections  │  │
//! │  │ (StateSource)│           │  (DashMap)   │  acks     │ (WebSocket)  │  │
//! │  └──────────────┘           └──────────────┘           └──────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sync Rule
//!
//! A client whose last acknowledged timestamp is an origin in the diff
//! history gets that one diff; anyone else (including a fresh client at 0)
//! gets the full snapshot. Each push is a JSON header frame followed by a
//! binary frame of exactly `data_size` bytes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fanout_engine::{FanoutConfig, FanoutServer};
//!
//! #[tokio::main]
//! async fn main() -> fanout_engine::Result<()> {
//!     let config = FanoutConfig::from_env()?;
//!
//!     let mut server = FanoutServer::connect(config).await?;
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use client::{ClientEvent, SyncClient};
pub use config::{FanoutConfig, HistoryConfig, ServerConfig, StoreConfig};
pub use coordinator::{FanoutServer, HealthCheck, ServerState};
pub use engine::{select_push, FanoutReport, SyncDecision, SyncEngine, SyncOutcome};
pub use error::{FanoutError, Result};
pub use protocol::{ClientMessage, Frame, FrameAssembler, Push, ServerMessage};
pub use registry::{ClientRegistry, ClientState};
pub use store::{MemorySource, RedisStore, SharedStore, StateSource, StoreState};
