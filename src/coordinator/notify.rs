// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Notification listener: refresh the cache and fan out on every token.

use crate::connection::wait_for_shutdown;
use crate::engine::SyncEngine;
use crate::store::NotificationStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, Instrument};

/// Run until the subscription ends or shutdown is signalled.
///
/// `active` is cleared on exit so the health check can report a dead
/// subscription.
pub(super) async fn run_listener(
    engine: Arc<SyncEngine>,
    notifications: NotificationStream,
    active: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("notifications");

    async move {
        active.store(true, Ordering::Release);

        let store = Arc::clone(engine.store());
        let fan_out = || {
            engine.fan_out();
            std::future::ready(())
        };

        tokio::select! {
            _ = store.on_change_notification(notifications, fan_out) => {}
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                debug!("Notification listener stopping");
            }
        }

        active.store(false, Ordering::Release);
        info!("Notification listener stopped");
    }
    .instrument(span)
    .await
}
