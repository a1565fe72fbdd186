//! Shared admission rate limiter for source tasks.
//!
//! One [`RateLimiter`] exists per pipeline and every source worker holds a
//! clone of it. All clones draw permits from the same interval, so the
//! configured rate is an aggregate ceiling across every source, not a
//! per-worker one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Highest admission rate a limiter can express; one permit per nanosecond
pub const MAX_RATE_PER_SECOND: u32 = 1_000_000_000;

struct Inner {
    period: Duration,
    interval: Mutex<Option<Interval>>,
    stop_requested: AtomicBool,
    stopped: CancellationToken,
    ticks: AtomicU64,
}

/// A periodic permit source shared by every source task of a pipeline.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("period", &self.inner.period)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter handing out `rate` permits per second.
    ///
    /// `rate` must lie in `1..=MAX_RATE_PER_SECOND`.
    pub fn per_second(rate: u32) -> Result<Self> {
        if rate == 0 || rate > MAX_RATE_PER_SECOND {
            return Err(Error::InvalidRate);
        }
        Ok(Self::with_period(Duration::from_secs(1) / rate))
    }

    fn with_period(period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                period,
                interval: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                stopped: CancellationToken::new(),
                ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Time between two permits
    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Number of permits handed out so far
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// Wait for the next permit.
    ///
    /// Returns `None` once the limiter has been stopped; a stopped limiter
    /// never hands out another permit.
    pub async fn tick(&self) -> Option<Instant> {
        if self.inner.stopped.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.inner.stopped.cancelled() => None,
            instant = self.next_tick() => Some(instant),
        }
    }

    async fn next_tick(&self) -> Instant {
        let mut guard = self.inner.interval.lock().await;
        // Created lazily so the limiter can be built outside a runtime.
        let interval = guard.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(self.inner.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let instant = interval.tick().await;
        self.inner.ticks.fetch_add(1, Ordering::Relaxed);
        instant.into_std()
    }

    /// Wait until either a permit is available or `cancel` fires.
    ///
    /// Returns `true` when the caller may emit one item, `false` when it
    /// should exit. Cancellation wins when both are ready.
    pub async fn admit(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            permit = self.tick() => permit.is_some(),
        }
    }

    /// Stop handing out permits. Returns `true` for the first call only.
    pub fn stop(&self) -> bool {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.stopped.cancel();
        tracing::debug!(period = ?self.inner.period, "rate limiter stopped");
        true
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_rejected() {
        assert!(matches!(RateLimiter::per_second(0), Err(Error::InvalidRate)));
    }

    #[test]
    fn test_rate_above_nanosecond_resolution_rejected() {
        let fastest = RateLimiter::per_second(MAX_RATE_PER_SECOND).unwrap();
        assert_eq!(fastest.period(), Duration::from_nanos(1));

        assert!(matches!(
            RateLimiter::per_second(MAX_RATE_PER_SECOND + 1),
            Err(Error::InvalidRate)
        ));
        assert!(matches!(
            RateLimiter::per_second(u32::MAX),
            Err(Error::InvalidRate)
        ));
    }

    #[test]
    fn test_concurrent_stop_reports_one_winner() {
        let limiter = RateLimiter::per_second(10).unwrap();
        let winners = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if limiter.stop() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(limiter.is_stopped());
        assert!(!limiter.stop());
    }

    #[test]
    fn test_period_from_rate() {
        let limiter = RateLimiter::per_second(4).unwrap();
        assert_eq!(limiter.period(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_spaced_by_period() {
        let limiter = RateLimiter::per_second(10).unwrap();
        let start = tokio::time::Instant::now();

        for _ in 0..5 {
            limiter.tick().await.unwrap();
        }

        // First permit is immediate, the rest follow the period.
        assert_eq!(start.elapsed(), Duration::from_millis(400));
        assert_eq!(limiter.ticks(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_one_tick_source() {
        let limiter = RateLimiter::per_second(100).unwrap();
        let start = tokio::time::Instant::now();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    for _ in 0..5 {
                        limiter.tick().await.unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(limiter.ticks(), 20);
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_period_does_not_burst() {
        let limiter = RateLimiter::per_second(10).unwrap();
        limiter.tick().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let resumed = tokio::time::Instant::now();
        limiter.tick().await.unwrap();
        limiter.tick().await.unwrap();

        assert!(resumed.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stop_releases_waiters() {
        let limiter = RateLimiter::per_second(1).unwrap();
        limiter.tick().await.unwrap();

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.tick().await }
        });
        tokio::task::yield_now().await;

        assert!(limiter.stop());
        assert!(!limiter.stop());
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(limiter.tick().await, None);
    }

    #[tokio::test]
    async fn test_admit_prefers_cancellation() {
        let limiter = RateLimiter::per_second(1000).unwrap();
        let cancel = CancellationToken::new();
        assert!(limiter.admit(&cancel).await);

        cancel.cancel();
        assert!(!limiter.admit(&cancel).await);
    }
}
