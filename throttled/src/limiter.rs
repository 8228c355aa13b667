//! Interval rate limiter.
//!
//! Each [`RateLimiter::wait`] takes one of `capacity` slots and returns at
//! once. The slot is handed back by a detached task only after the interval
//! has elapsed, measured from when the slot was taken. The first `capacity`
//! callers therefore pass immediately and every later caller waits for the
//! oldest slot's interval to run out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::gate_size;
use crate::error::{ConfigError, LimiterClosed};

/// Paces admission events to a fixed or jittered interval.
///
/// Not wired into [`ThrottledQueue`](crate::ThrottledQueue); callers that
/// want paced admission call [`wait`](Self::wait) before each event.
pub struct RateLimiter {
    gate: Arc<Semaphore>,
    min_interval: Duration,
    max_interval: Duration,
    capacity: usize,
    /// Cancelled on close so pending delayed releases stop sleeping.
    shutdown: CancellationToken,
}

impl RateLimiter {
    /// Fixed interval, one slot.
    pub fn new(interval: Duration) -> Result<Self, ConfigError> {
        Self::jittered_with_capacity(interval, interval, 1)
    }

    /// Fixed interval, `capacity` slots.
    pub fn with_capacity(interval: Duration, capacity: usize) -> Result<Self, ConfigError> {
        Self::jittered_with_capacity(interval, interval, capacity)
    }

    /// Interval drawn uniformly from `[min_interval, max_interval]`, one slot.
    pub fn jittered(min_interval: Duration, max_interval: Duration) -> Result<Self, ConfigError> {
        Self::jittered_with_capacity(min_interval, max_interval, 1)
    }

    pub fn jittered_with_capacity(
        min_interval: Duration,
        max_interval: Duration,
        capacity: usize,
    ) -> Result<Self, ConfigError> {
        if min_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if min_interval > max_interval {
            return Err(ConfigError::InvertedInterval {
                min: min_interval,
                max: max_interval,
            });
        }
        let capacity = gate_size(capacity, ConfigError::ZeroCapacity)?.get();

        tracing::debug!(?min_interval, ?max_interval, capacity, "Creating rate limiter");

        Ok(Self {
            gate: Arc::new(Semaphore::new(capacity)),
            min_interval,
            max_interval,
            capacity,
            shutdown: CancellationToken::new(),
        })
    }

    /// Wait for a free slot.
    ///
    /// Returns as soon as a slot is taken; the slot itself stays occupied for
    /// one interval after that. Dropping the returned future before it
    /// completes takes no slot.
    pub async fn wait(&self) -> Result<(), LimiterClosed> {
        let delay = self.next_delay();
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        tracing::trace!(?delay, available = self.gate.available_permits(), "Rate limiter slot taken");

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {}
            }
            // Returning a permit to a closed semaphore is a no-op.
            drop(permit);
        });

        Ok(())
    }

    /// Wait for a slot, then run `fut`.
    pub async fn throttle<F>(&self, fut: F) -> Result<F::Output, LimiterClosed>
    where
        F: Future,
    {
        self.wait().await?;
        Ok(fut.await)
    }

    /// Close the limiter. Pending and future `wait` calls fail with
    /// [`LimiterClosed`]. Safe to call more than once.
    pub fn close(&self) {
        if self.gate.is_closed() {
            return;
        }
        tracing::debug!("Closing rate limiter");
        self.gate.close();
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    fn next_delay(&self) -> Duration {
        if self.min_interval == self.max_interval {
            return self.min_interval;
        }
        let splay = self.max_interval - self.min_interval;
        self.min_interval + splay.mul_f64(rand::rng().random::<f64>())
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("min_interval", &self.min_interval)
            .field("max_interval", &self.max_interval)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}
