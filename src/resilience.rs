// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Startup retry and connection admission.
//!
//! - [`RetryConfig`]: exponential backoff for reaching the store at startup
//! - [`Bulkhead`]: caps how many client sockets are open at once
//!
//! # Example
//!
//! ```rust
//! use fanout_engine::resilience::Bulkhead;
//!
//! let bulkhead = Bulkhead::for_connections(2);
//! let a = bulkhead.try_acquire().expect("slot");
//! let _b = bulkhead.try_acquire().expect("slot");
//! assert!(bulkhead.try_acquire().is_none()); // third socket is refused
//! drop(a);
//! assert_eq!(bulkhead.available(), 1);
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Backoff policy for the store connection.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up.
    pub max_attempts: usize,

    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Ceiling for the exponential delay.
    pub max_delay: Duration,

    /// Multiplier applied per attempt.
    pub backoff_factor: f64,

    /// Bound on each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Startup policy: ~20 attempts over roughly a minute, so a Redis
    /// container that is still booting gets time to come up while a
    /// wrong hostname still fails the process.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        750ms
    /// 3        1.12s
    /// ...
    /// 12+      30s (cap)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(5),
        }
    }

    /// Fails fast; for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Same policy with a different per-attempt timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

/// Returned when every connection slot is taken.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection limit reached: max {max_concurrent} open connections")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Semaphore-backed concurrency cap.
///
/// Each accepted socket holds an [`OwnedSemaphorePermit`] for its whole
/// lifetime; dropping the permit frees the slot.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Bulkhead sized for `server.max_connections`.
    pub fn for_connections(max_connections: usize) -> Self {
        Self::new(max_connections.max(1))
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Like [`try_acquire`](Self::try_acquire) but with an error to log.
    pub fn admit(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.try_acquire().ok_or_else(|| self.full())
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn full(&self) -> BulkheadFull {
        BulkheadFull {
            max_concurrent: self.max_concurrent,
        }
    }
}
