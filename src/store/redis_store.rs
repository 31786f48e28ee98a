// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed state source.
//!
//! # Keys
//!
//! ```text
//! {prefix}realtime:current_timestamp   STRING  decimal u64
//! {prefix}realtime:data_full           STRING  snapshot blob
//! {prefix}realtime:data_diffs          HASH    origin timestamp → diff blob
//! {prefix}realtime:updates             CHANNEL "new_data" after each write
//! ```
//!
//! Reads go through one `MULTI`/`EXEC` so a producer write landing between
//! commands can never produce a torn triple.

use super::{BoxFuture, NotificationStream, StateSource, StoreState};
use crate::config::StoreConfig;
use crate::error::{FanoutError, Result};
use crate::resilience::RetryConfig;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use std::collections::HashMap;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Connection to the shared Redis store.
///
/// `ConnectionManager` reconnects on its own and is cheap to clone; each
/// call works on a clone so reads never serialize behind each other.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    config: StoreConfig,
}

impl RedisStore {
    /// Connect with exponential backoff.
    ///
    /// An unparsable URL is a `Config` error and is not retried.
    pub async fn connect(config: &StoreConfig, retry: &RetryConfig) -> Result<Self> {
        let url = config.redis_url();
        info!(url = %url, "Connecting to Redis");

        let client = Client::open(url.as_str())
            .map_err(|e| FanoutError::Config(format!("Invalid Redis URL {}: {}", url, e)))?;

        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let failure = match timeout(retry.connection_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    if attempt > 1 {
                        info!(attempt, elapsed_ms = started.elapsed().as_millis(), "Connected to Redis after retry");
                    } else {
                        info!("Connected to Redis");
                    }
                    return Ok(Self {
                        client,
                        conn,
                        config: config.clone(),
                    });
                }
                Ok(Err(e)) => FanoutError::redis("connect", e),
                Err(_) => FanoutError::redis_msg(
                    "connect",
                    format!("timed out after {:?}", retry.connection_timeout),
                ),
            };

            if attempt >= retry.max_attempts {
                error!(attempt, error = %failure, "Failed to connect to Redis after max retries");
                return Err(failure);
            }

            let delay = retry.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %failure,
                "Redis connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Write a new triple and announce it.
    ///
    /// Replaces the diff hash wholesale, keeping only reachable origins
    /// (older than `timestamp`, newest `history_depth`). Returns the number
    /// of subscribers that received the token.
    pub async fn publish<I>(
        &self,
        timestamp: u64,
        full: Bytes,
        diffs: I,
        history_depth: usize,
    ) -> Result<i64>
    where
        I: IntoIterator<Item = (u64, Bytes)>,
    {
        let mut state = StoreState::new(timestamp, full, diffs);
        state.retain_reachable(history_depth);

        let diffs_key = self.config.diffs_key();
        let fields: Vec<(u64, &[u8])> = state
            .diffs
            .iter()
            .map(|(origin, blob)| (*origin, blob.as_ref()))
            .collect();
        let full_blob: &[u8] = state.full.as_deref().unwrap_or_default();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.config.timestamp_key(), timestamp)
            .ignore()
            .set(self.config.full_key(), full_blob)
            .ignore()
            .del(&diffs_key)
            .ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(&diffs_key, &fields[..]).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| FanoutError::redis("MULTI publish", e))?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.config.channel_name())
            .arg(&self.config.new_data_token)
            .query_async(&mut conn)
            .await
            .map_err(|e| FanoutError::redis("PUBLISH", e))?;

        debug!(timestamp, diffs = fields.len(), receivers, "Published new state");
        Ok(receivers)
    }
}

type RawTriple = (Option<String>, Option<Vec<u8>>, HashMap<String, Vec<u8>>);

/// Turn the raw `EXEC` reply into a [`StoreState`].
///
/// Hash fields that are not decimal integers are skipped with a warning.
fn decode_triple((timestamp, full, diffs): RawTriple) -> Result<StoreState> {
    let timestamp = match timestamp {
        None => {
            if full.is_some() {
                return Err(FanoutError::IncompleteState(
                    "snapshot present without timestamp".to_string(),
                ));
            }
            return Ok(StoreState::empty());
        }
        Some(raw) => raw.trim().parse::<u64>().map_err(|e| {
            FanoutError::IncompleteState(format!("timestamp {:?} is not an integer: {}", raw, e))
        })?,
    };

    let full = full.ok_or_else(|| {
        FanoutError::IncompleteState(format!("timestamp {} without snapshot", timestamp))
    })?;

    let mut parsed = Vec::with_capacity(diffs.len());
    for (field, blob) in diffs {
        match field.trim().parse::<u64>() {
            Ok(origin) => parsed.push((origin, Bytes::from(blob))),
            Err(_) => warn!(field = %field, "Skipping diff with non-numeric origin"),
        }
    }

    Ok(StoreState::new(timestamp, Bytes::from(full), parsed))
}

impl StateSource for RedisStore {
    fn read_state(&self) -> BoxFuture<'_, StoreState> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: RawTriple = redis::pipe()
                .atomic()
                .get(self.config.timestamp_key())
                .get(self.config.full_key())
                .hgetall(self.config.diffs_key())
                .query_async(&mut conn)
                .await
                .map_err(|e| FanoutError::redis("MULTI read", e))?;
            decode_triple(raw)
        })
    }

    fn subscribe(&self) -> BoxFuture<'_, NotificationStream> {
        Box::pin(async move {
            let channel = self.config.channel_name();
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| FanoutError::redis("pubsub connect", e))?;
            pubsub
                .subscribe(&channel)
                .await
                .map_err(|e| FanoutError::redis("SUBSCRIBE", e))?;
            info!(channel = %channel, "Subscribed to change notifications");

            let stream = pubsub.into_on_message().filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(error = %e, "Dropping non-text notification payload");
                        None
                    }
                }
            });
            Ok(Box::pin(stream) as NotificationStream)
        })
    }
}
