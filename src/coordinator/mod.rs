// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fan-out server coordinator.
//!
//! Ties together:
//! - The shared store cache via [`crate::store::SharedStore`]
//! - The client registry via [`crate::registry::ClientRegistry`]
//! - Fan-out and on-demand pushes via [`crate::engine::SyncEngine`]
//! - Per-socket handling via [`crate::connection::ConnectionContext`]
//!
//! # Lifecycle
//!
//! 1. Read the store once so early clients have something to fetch
//! 2. Subscribe to change notifications (refresh + fan out per token)
//! 3. Bind the listener and accept WebSocket clients
//! 4. On shutdown: stop accepting, send close frames, drain connections

mod accept;
mod notify;
mod types;

pub use types::{HealthCheck, ServerState};

use crate::config::FanoutConfig;
use crate::connection::ConnectionContext;
use crate::engine::SyncEngine;
use crate::error::{FanoutError, Result};
use crate::metrics;
use crate::registry::ClientRegistry;
use crate::resilience::{Bulkhead, RetryConfig};
use crate::store::{RedisStore, RefreshOutcome, SharedStore, StateSource};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Extra time granted to background tasks on top of the connection drain.
const TASK_GRACE: Duration = Duration::from_secs(1);

/// The fan-out server.
///
/// Holds the cached store state and every connected client, and pushes
/// each new publication to all of them.
pub struct FanoutServer {
    config: FanoutConfig,

    /// Server state (broadcast to watchers)
    state_tx: watch::Sender<ServerState>,
    state_rx: watch::Receiver<ServerState>,

    store: Arc<SharedStore>,
    registry: Arc<ClientRegistry>,
    engine: Arc<SyncEngine>,

    /// Connection slots
    bulkhead: Arc<Bulkhead>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Set once the listener is bound.
    local_addr: Option<SocketAddr>,

    notifications_active: Arc<AtomicBool>,

    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl FanoutServer {
    /// Connect to Redis and build a server in the `Created` state.
    ///
    /// Retries the connection with [`RetryConfig::startup`] bounded by the
    /// configured per-attempt timeout.
    pub async fn connect(config: FanoutConfig) -> Result<Self> {
        config.validate()?;

        let retry = RetryConfig::startup()
            .with_connection_timeout(config.store.connection_timeout_duration());
        let source = RedisStore::connect(&config.store, &retry).await?;

        Self::with_source(config, Arc::new(source))
    }

    /// Build a server over any [`StateSource`].
    pub fn with_source(config: FanoutConfig, source: Arc<dyn StateSource>) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(ServerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = Arc::new(SharedStore::new(source, config.store.new_data_token.clone()));
        let registry = Arc::new(ClientRegistry::new(config.expiration_window()));
        let engine = Arc::new(SyncEngine::new(Arc::clone(&store), Arc::clone(&registry)));
        let bulkhead = Arc::new(Bulkhead::for_connections(config.server.max_connections));

        metrics::set_server_state(&ServerState::Created.to_string());

        Ok(Self {
            config,
            state_tx,
            state_rx,
            store,
            registry,
            engine,
            bulkhead,
            shutdown_tx,
            shutdown_rx,
            local_addr: None,
            notifications_active: Arc::new(AtomicBool::new(false)),
            handles: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get current server state.
    pub fn state(&self) -> ServerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ServerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ServerState::Running)
    }

    /// Health snapshot for monitoring. Performs no I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let snapshot = self.store.snapshot();
        let notifications_active = self.notifications_active.load(Ordering::Acquire);

        let ready = state == ServerState::Running && notifications_active;
        let has_data = snapshot.has_data();

        HealthCheck {
            state,
            ready,
            healthy: ready && has_data,
            has_data,
            current_timestamp: snapshot.timestamp,
            diff_history_len: snapshot.diffs.len(),
            clients_total: self.registry.len(),
            clients_connected: self.registry.connected_count(),
            connections_open: self.bulkhead.in_use(),
            max_connections: self.bulkhead.max_concurrent(),
            notifications_active,
        }
    }

    fn set_state(&self, state: ServerState) {
        let _ = self.state_tx.send(state);
        metrics::set_server_state(&state.to_string());
    }

    /// Start serving.
    ///
    /// 1. Initial store read (a failure here is logged, not fatal)
    /// 2. Subscribe to change notifications
    /// 3. Bind the WebSocket listener
    /// 4. Spawn the notification listener and the accept loop
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ServerState::Created {
            return Err(FanoutError::InvalidState {
                expected: ServerState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            bind = %self.config.server.bind_addr(),
            channel = %self.config.store.channel_name(),
            "Starting fan-out server"
        );
        self.set_state(ServerState::Connecting);

        match self.store.refresh().await {
            RefreshOutcome::Updated { timestamp } => {
                info!(timestamp, "Loaded initial state");
            }
            RefreshOutcome::Empty => {
                info!("Store is empty, waiting for first publication");
            }
            RefreshOutcome::Failed => {
                warn!("Initial store read failed, will retry on next notification");
            }
        }

        let notifications = match self.store.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Failed to subscribe to change notifications");
                self.set_state(ServerState::Failed);
                return Err(e);
            }
        };

        let listener = match TcpListener::bind(self.config.server.bind_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(bind = %self.config.server.bind_addr(), error = %e, "Failed to bind listener");
                self.set_state(ServerState::Failed);
                return Err(FanoutError::Transport(format!(
                    "bind {}: {}",
                    self.config.server.bind_addr(),
                    e
                )));
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| FanoutError::Transport(format!("local address: {}", e)))?;
        self.local_addr = Some(local_addr);

        self.spawn_notification_listener(notifications).await;
        self.spawn_accept_loop(listener).await;

        self.set_state(ServerState::Running);
        info!(
            addr = %local_addr,
            timestamp = self.store.current_timestamp(),
            "Fan-out server running"
        );

        Ok(())
    }

    async fn spawn_notification_listener(&self, notifications: crate::store::NotificationStream) {
        // Mark active before returning so health is accurate immediately.
        self.notifications_active.store(true, Ordering::Release);

        let handle = tokio::spawn(notify::run_listener(
            Arc::clone(&self.engine),
            notifications,
            Arc::clone(&self.notifications_active),
            self.shutdown_rx.clone(),
        ));

        debug!("Spawned notification listener");
        self.handles.write().await.push(handle);
    }

    async fn spawn_accept_loop(&self, listener: TcpListener) {
        let context = Arc::new(ConnectionContext::new(
            Arc::clone(&self.engine),
            self.config.server.path_prefix.clone(),
            self.shutdown_rx.clone(),
        ));

        let handle = tokio::spawn(accept::run_accept_loop(
            listener,
            context,
            Arc::clone(&self.bulkhead),
            self.shutdown_rx.clone(),
            self.config.server.drain_timeout(),
        ));

        debug!("Spawned accept loop");
        self.handles.write().await.push(handle);
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal every task to stop
    /// 2. Connections send close frames and drain (bounded by `drain_timeout`)
    /// 3. Wait for the background tasks
    pub async fn shutdown(&mut self) {
        if self.state() == ServerState::Stopped {
            return;
        }

        info!("Shutting down fan-out server");
        self.set_state(ServerState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        let timeout = self.config.server.drain_timeout() + TASK_GRACE;
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        self.notifications_active.store(false, Ordering::Release);
        metrics::set_connected_clients(self.registry.connected_count());

        self.set_state(ServerState::Stopped);
        info!("Fan-out server stopped");
    }
}
