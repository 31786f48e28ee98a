// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process state source.
//!
//! Holds the published triple in memory and hands out channel-backed
//! notification streams. Used by the test suites and for running the
//! server without Redis.

use super::{BoxFuture, NotificationStream, StateSource, StoreState};
use crate::error::FanoutError;
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct MemorySource {
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    fail_reads: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `state` already published.
    pub fn with_state(state: StoreState) -> Self {
        let source = Self::default();
        source.set_state(state);
        source
    }

    /// Replace the stored triple. Subscribers are not notified.
    pub fn set_state(&self, state: StoreState) {
        *self.state.lock() = state;
    }

    /// Store `state` and post `token` to every subscriber.
    pub fn publish(&self, state: StoreState, token: &str) -> usize {
        self.set_state(state);
        self.notify(token)
    }

    /// Post a raw payload; returns how many live subscribers received it.
    pub fn notify(&self, payload: &str) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.unbounded_send(payload.to_string()).is_ok());
        subscribers.len()
    }

    /// End every open notification stream.
    pub fn close_subscriptions(&self) {
        self.subscribers.lock().clear();
    }

    /// Make `read_state` fail until switched back.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Make `subscribe` fail until switched back.
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::Release);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl StateSource for MemorySource {
    fn read_state(&self) -> BoxFuture<'_, StoreState> {
        Box::pin(async move {
            if self.fail_reads.load(Ordering::Acquire) {
                return Err(FanoutError::redis_msg("read_state", "simulated read failure"));
            }
            Ok(self.state.lock().clone())
        })
    }

    fn subscribe(&self) -> BoxFuture<'_, NotificationStream> {
        Box::pin(async move {
            if self.fail_subscribe.load(Ordering::Acquire) {
                return Err(FanoutError::redis_msg("SUBSCRIBE", "simulated subscribe failure"));
            }
            let (tx, rx) = mpsc::unbounded();
            self.subscribers.lock().push(tx);
            Ok(Box::pin(rx) as NotificationStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_read_returns_published_state() {
        let source = MemorySource::with_state(StoreState::new(7, Bytes::from_static(b"S7"), []));
        let state = source.read_state().await.unwrap();
        assert_eq!(state.timestamp, 7);
    }

    #[tokio::test]
    async fn test_fail_reads() {
        let source = MemorySource::new();
        source.fail_reads(true);
        let err = source.read_state().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_notify_reaches_subscribers() {
        let source = MemorySource::new();
        let mut a = source.subscribe().await.unwrap();
        let mut b = source.subscribe().await.unwrap();

        assert_eq!(source.notify("new_data"), 2);
        assert_eq!(a.next().await.as_deref(), Some("new_data"));
        assert_eq!(b.next().await.as_deref(), Some("new_data"));

        drop(b);
        assert_eq!(source.notify("new_data"), 1);

        source.close_subscriptions();
        assert_eq!(a.next().await.as_deref(), Some("new_data"));
        assert_eq!(a.next().await, None);
    }

    #[tokio::test]
    async fn test_fail_subscribe() {
        let source = MemorySource::new();
        source.fail_subscribe(true);
        assert!(source.subscribe().await.is_err());
        assert_eq!(source.subscriber_count(), 0);
    }
}
