// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared store adapter.
//!
//! The producer writes `(timestamp, snapshot, diffs)` to Redis and posts a
//! token on a pub/sub channel. [`SharedStore`] keeps the last good read in
//! an [`ArcSwap`] so fan-out readers always see one consistent triple, and
//! a failed or partial read never clobbers it.
//!
//! ```text
//!   producer ──SET/HSET──► Redis ──PUBLISH new_data──► subscription
//!                            ▲                              │
//!                            │ MULTI GET GET HGETALL EXEC   ▼
//!                       StateSource ◄──── refresh() ◄── on_change_notification
//!                            │
//!                            ▼
//!                ArcSwap<StoreState>  ──snapshot()──►  SyncEngine
//! ```
//!
//! The backend sits behind the [`StateSource`] trait: [`RedisStore`] in
//! production, [`MemorySource`] for tests and standalone runs.

mod memory;
mod redis_store;
mod state;

pub use self::memory::MemorySource;
pub use self::redis_store::RedisStore;
pub use self::state::StoreState;

use crate::error::Result;
use crate::metrics;
use arc_swap::ArcSwap;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Boxed future returned by [`StateSource`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stream of raw change-notification payloads.
pub type NotificationStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Backend holding the published state.
pub trait StateSource: Send + Sync + 'static {
    /// Read timestamp, snapshot and diff map in one consistent operation.
    ///
    /// An empty store yields [`StoreState::empty()`]; a timestamp without a
    /// snapshot is an error.
    fn read_state(&self) -> BoxFuture<'_, StoreState>;

    /// Open a subscription to the change-notification channel.
    fn subscribe(&self) -> BoxFuture<'_, NotificationStream>;
}

/// Result of one [`SharedStore::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Cache replaced with the new read.
    Updated { timestamp: u64 },
    /// Store was empty; cache left as is.
    Empty,
    /// Read failed; cache left as is.
    Failed,
}

/// Cached view over a [`StateSource`].
pub struct SharedStore {
    source: Arc<dyn StateSource>,
    current: ArcSwap<StoreState>,
    new_data_token: String,
}

impl SharedStore {
    pub fn new(source: Arc<dyn StateSource>, new_data_token: impl Into<String>) -> Self {
        Self {
            source,
            current: ArcSwap::from_pointee(StoreState::empty()),
            new_data_token: new_data_token.into(),
        }
    }

    /// The cached state. Cheap: an `Arc` clone.
    pub fn snapshot(&self) -> Arc<StoreState> {
        self.current.load_full()
    }

    pub fn current_timestamp(&self) -> u64 {
        self.current.load().timestamp
    }

    pub fn has_data(&self) -> bool {
        self.current.load().has_data()
    }

    pub fn new_data_token(&self) -> &str {
        &self.new_data_token
    }

    /// Re-read the store and swap the cache on success.
    pub async fn refresh(&self) -> RefreshOutcome {
        let start = Instant::now();
        let result = self.source.read_state().await;
        metrics::record_store_refresh(result.is_ok(), start.elapsed());

        match result {
            Ok(state) if state.is_empty() => {
                if self.has_data() {
                    warn!("Store read returned no data, keeping cached snapshot");
                } else {
                    debug!("Store is empty, nothing published yet");
                }
                RefreshOutcome::Empty
            }
            Ok(state) => {
                let timestamp = state.timestamp;
                let previous = self.current_timestamp();
                if timestamp < previous {
                    warn!(previous, timestamp, "Store timestamp moved backwards");
                }
                metrics::set_current_timestamp(timestamp);
                metrics::set_diff_history_len(state.diffs.len());
                debug!(
                    timestamp,
                    diffs = state.diffs.len(),
                    full_bytes = state.full.as_ref().map_or(0, |b| b.len()),
                    "Store cache refreshed"
                );
                self.current.store(Arc::new(state));
                RefreshOutcome::Updated { timestamp }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    cached_timestamp = self.current_timestamp(),
                    "Store refresh failed, keeping last known state"
                );
                RefreshOutcome::Failed
            }
        }
    }

    /// Subscribe to the backend's change channel.
    pub async fn subscribe(&self) -> Result<NotificationStream> {
        self.source.subscribe().await
    }

    /// Drive a subscription: on every new-data token, refresh and call
    /// `handler` if the cache was updated. Other payloads are ignored.
    ///
    /// Returns when the stream ends; there is no local reconnect.
    pub async fn on_change_notification<F, Fut>(
        &self,
        mut notifications: NotificationStream,
        mut handler: F,
    ) where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        info!("Listening for change notifications");

        while let Some(payload) = notifications.next().await {
            if payload != self.new_data_token {
                debug!(payload = %payload, "Ignoring unrecognized notification");
                metrics::record_notification(false);
                continue;
            }
            metrics::record_notification(true);

            if let RefreshOutcome::Updated { .. } = self.refresh().await {
                handler().await;
            }
        }

        error!("Change notification stream ended");
    }
}
