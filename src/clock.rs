//! Injectable clock and sleeper so time-based operators (`with_retry` backoff,
//! `buffer_time` windows, EMA rate tracking) can be driven deterministically in tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// A source of the current instant.
///
/// Production code uses [`SystemClock`]; tests can substitute a clock backed
/// by `tokio::time::pause`/`advance` without changing operator code.
pub trait Clock: Send + Sync {
    /// Returns the current instant as observed by this clock.
    fn now(&self) -> Instant;
}

/// A cooperative sleep primitive, separated from [`Clock`] so it can be backed
/// by `tokio::time::sleep` in production and by a paused tokio test clock in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Suspends the caller for approximately `duration`.
    async fn sleep(&self, duration: Duration);
}

/// The default, real-time clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The default sleeper, backed by `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A shared handle to a clock + sleeper pair, threaded through operators that
/// need time (retry backoff, time-based buffering, progress ETA).
#[derive(Clone)]
pub struct TimeSource {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl TimeSource {
    /// Builds a time source from explicit clock/sleeper implementations.
    pub fn new(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { clock, sleeper }
    }

    /// Returns the current instant.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Suspends the caller for `duration` using the configured sleeper.
    pub async fn sleep(&self, duration: Duration) {
        self.sleeper.sleep(duration).await;
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(TokioSleeper))
    }
}

impl std::fmt::Debug for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSource").finish_non_exhaustive()
    }
}
