// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Accept loop: admit sockets through the bulkhead and spawn their tasks.
//!
//! On shutdown the listener is dropped first, then open connections get
//! `drain_timeout` to send their close frames before being aborted.

use crate::connection::{wait_for_shutdown, ConnectionContext};
use crate::metrics;
use crate::resilience::Bulkhead;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

/// Pause after a failed `accept()` (e.g. EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(super) async fn run_accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    bulkhead: Arc<Bulkhead>,
    mut shutdown_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    let span = info_span!("accept");

    async move {
        let mut connections = JoinSet::new();
        info!(max_connections = bulkhead.max_concurrent(), "Accepting connections");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let permit = match bulkhead.admit() {
                            Ok(permit) => permit,
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "Refusing connection");
                                metrics::record_connection_rejected("connection_limit");
                                continue;
                            }
                        };
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
                        }

                        let context = Arc::clone(&context);
                        connections.spawn(async move {
                            let _permit = permit;
                            if let Err(e) = context.handle_connection(stream, peer).await {
                                debug!(peer = %peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        drop(listener);
        info!(open = connections.len(), "Accept loop stopped, draining connections");

        let drained = tokio::time::timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "Connections did not close in time, aborting");
            connections.abort_all();
        }
    }
    .instrument(span)
    .await
}
