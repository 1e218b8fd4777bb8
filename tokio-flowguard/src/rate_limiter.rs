//! Shared bandwidth governor.
//!
//! [`RateLimiter`] keeps a running average of bytes moved over a rolling measurement period and
//! turns it into a pause: how long the caller should wait so the long-run average settles at the
//! configured cap. It performs no I/O and never sleeps while holding its lock, so a single
//! instance can be shared by any number of streams to enforce an **aggregate** cap.
//!
//! ```
//! use std::time::Duration;
//! use tokio_flowguard::rate_limiter::RateLimiter;
//!
//! let limiter = RateLimiter::new(0); // unthrottled
//! assert_eq!(limiter.account(1 << 20), Duration::ZERO);
//!
//! limiter.set_limit(64 * 1024); // 64 KiB/s, takes effect on the next transfer
//! assert_eq!(limiter.limit(), 64 * 1024);
//! ```
//!
//! ## Under the hood
//! - This is an average-rate governor, not a token bucket: short bursts are tolerated and the
//!   following pause is sized to pull the average back down to the cap.
//! - The period re-baselines once it is older than [`WINDOW`], so rounding error cannot build up
//!   over very long transfers. When that happens together with a pause, the new period starts
//!   where the pause ends.
//! - Elapsed times below [`MIN_INTERVAL`] and pauses below [`MIN_WAIT`] are ignored.
use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Length of a measurement period before it is re-baselined.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Elapsed time below which no rate is computed.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Pauses shorter than this are skipped.
pub const MIN_WAIT: Duration = Duration::from_millis(1);

/// Time source for [`RateLimiter`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads [`tokio::time::Instant::now`], so a paused test runtime drives it too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Period {
    limit: u64,
    start: Instant,
    bytes: u64,
}

impl Period {
    fn reset(&mut self, start: Instant) {
        self.start = start;
        self.bytes = 0;
    }
}

/// A thread-safe, shareable bytes-per-second cap.
pub struct RateLimiter {
    period: Mutex<Period>,
    clock: Box<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter capped at `bytes_per_second`; `0` disables throttling.
    pub fn new(bytes_per_second: u64) -> Arc<Self> {
        Self::with_clock(bytes_per_second, TokioClock)
    }

    /// Same as [`new`](Self::new) with a custom time source.
    pub fn with_clock(bytes_per_second: u64, clock: impl Clock + 'static) -> Arc<Self> {
        let start = clock.now();
        Arc::new(Self {
            period: Mutex::new(Period {
                limit: bytes_per_second,
                start,
                bytes: 0,
            }),
            clock: Box::new(clock),
        })
    }

    /// Current cap in bytes per second, `0` = unthrottled.
    pub fn limit(&self) -> u64 {
        self.period.lock().limit
    }

    /// Changes the cap and starts a fresh measurement period.
    ///
    /// Safe to call concurrently with transfers; the new cap applies to the next accounted one.
    pub fn set_limit(&self, bytes_per_second: u64) {
        let now = self.clock.now();
        let mut period = self.period.lock();
        debug!(
            from = period.limit,
            to = bytes_per_second,
            "rate limit changed"
        );
        period.limit = bytes_per_second;
        period.reset(now);
    }

    /// Records `size` transferred bytes and returns how long the caller should pause.
    ///
    /// Never sleeps.
    pub fn account(&self, size: usize) -> Duration {
        if size == 0 {
            return Duration::ZERO;
        }

        let now = self.clock.now();
        let mut period = self.period.lock();
        if period.limit == 0 {
            return Duration::ZERO;
        }

        period.bytes = period.bytes.saturating_add(size as u64);

        let elapsed = now.saturating_duration_since(period.start);
        if elapsed < MIN_INTERVAL {
            return Duration::ZERO;
        }

        let bytes = period.bytes as f64;
        let limit = period.limit as f64;
        let elapsed_secs = elapsed.as_secs_f64();

        if bytes / elapsed_secs > limit {
            let ideal_secs = bytes / limit;
            let delay = Duration::from_secs_f64(ideal_secs - elapsed_secs);
            if delay > MIN_WAIT {
                if elapsed > WINDOW {
                    period.reset(now + delay);
                }
                trace!(?delay, bytes = period.bytes, ?elapsed, "throttling");
                return delay;
            }
        } else if elapsed > WINDOW {
            period.reset(now);
        }

        Duration::ZERO
    }

    /// Blocking form: accounts `size` bytes and puts the current thread to sleep if needed.
    ///
    /// Must not be called from within an async task.
    pub fn sleep_for(&self, size: usize) {
        let delay = self.account(size);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// Async form: accounts `size` bytes and suspends for the resulting pause.
    ///
    /// Dropping the future abandons the pause; the bytes stay accounted.
    pub async fn delay(&self, size: usize) {
        let delay = self.account(size);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Like [`delay`](Self::delay) but returns [`Error::Cancelled`] as soon as `cancel` fires.
    pub async fn wait_for(&self, size: usize, cancel: &CancellationToken) -> Result<()> {
        let delay = self.account(size);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let period = self.period.lock();
        f.debug_struct("RateLimiter")
            .field("limit", &period.limit)
            .field("period_start", &period.start)
            .field("period_bytes", &period.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Manually advanced clock for deterministic bookkeeping tests.
    #[derive(Clone)]
    struct ManualClock {
        now: Arc<Mutex<Instant>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Arc::new(Mutex::new(Instant::now())),
            }
        }

        fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    /// Tokio timers have millisecond granularity.
    fn roughly(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(
            diff <= Duration::from_millis(1),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    fn approx(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(
            diff < Duration::from_micros(10),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn zero_limit_or_zero_size_never_delays() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(0, clock.clone());
        clock.advance(Duration::from_millis(10));
        assert_eq!(limiter.account(10 << 20), Duration::ZERO);

        limiter.set_limit(100);
        clock.advance(Duration::from_millis(10));
        assert_eq!(limiter.account(0), Duration::ZERO);
    }

    #[test]
    fn no_rate_below_min_interval() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(1_000, clock.clone());
        // Far over the cap, but no measurable time has passed yet.
        assert_eq!(limiter.account(1_000_000), Duration::ZERO);
        clock.advance(Duration::from_micros(500));
        assert_eq!(limiter.account(1_000_000), Duration::ZERO);
    }

    #[test]
    fn over_cap_returns_catch_up_delay() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(1_000, clock.clone());
        clock.advance(Duration::from_millis(100));

        // 500 bytes at 1000 B/s should take 500ms; 100ms have passed.
        approx(limiter.account(500), Duration::from_millis(400));

        // The period is younger than the window, so it keeps accumulating.
        clock.advance(Duration::from_millis(400));
        approx(limiter.account(500), Duration::from_millis(500));
    }

    #[test]
    fn under_cap_returns_zero() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(1_000, clock.clone());
        clock.advance(Duration::from_millis(500));
        assert_eq!(limiter.account(400), Duration::ZERO);
    }

    #[test]
    fn tiny_overshoot_is_not_worth_waiting_for() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(10_000, clock.clone());
        clock.advance(Duration::from_millis(100));
        // ideal 100.4ms vs 100ms elapsed: 0.4ms is below MIN_WAIT.
        assert_eq!(limiter.account(1_004), Duration::ZERO);
    }

    #[test]
    fn long_period_with_delay_rebaselines_past_the_pause() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(1_000, clock.clone());
        clock.advance(Duration::from_millis(1_500));

        // 2000 bytes should take 2s, 1.5s elapsed -> 500ms pause, period restarts after it.
        approx(limiter.account(2_000), Duration::from_millis(500));

        // Still inside the pause: nothing measurable yet.
        clock.advance(Duration::from_millis(500));
        assert_eq!(limiter.account(10), Duration::ZERO);

        // 10 + 500 bytes over 500ms = 1020 B/s -> 10ms catch-up.
        clock.advance(Duration::from_millis(500));
        approx(limiter.account(500), Duration::from_millis(10));
    }

    #[test]
    fn long_period_under_cap_rebaselines() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(1_000, clock.clone());
        clock.advance(Duration::from_secs(5));
        // 100 B over 5s: well under the cap, period resets.
        assert_eq!(limiter.account(100), Duration::ZERO);

        // A fresh period means a burst is judged against 100ms, not 5s.
        clock.advance(Duration::from_millis(100));
        approx(limiter.account(1_000), Duration::from_millis(900));
    }

    #[test]
    fn set_limit_resets_period() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(1_000, clock.clone());
        clock.advance(Duration::from_millis(100));
        approx(limiter.account(1_000), Duration::from_millis(900));

        limiter.set_limit(10_000);
        assert_eq!(limiter.limit(), 10_000);
        clock.advance(Duration::from_millis(100));
        // Old bytes are forgotten: 900 B over 100ms is under a 10 KB/s cap.
        assert_eq!(limiter.account(900), Duration::ZERO);
    }

    #[test]
    fn shared_across_threads() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(1_000, clock.clone());
        clock.advance(Duration::from_millis(100));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        limiter.account(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // 800 accounted bytes; one more makes 801 B over 100ms -> 701ms.
        approx(limiter.account(1), Duration::from_millis(701));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_suspends_for_computed_pause() {
        let limiter = RateLimiter::new(1_000);
        tokio::time::advance(Duration::from_millis(100)).await;

        let start = Instant::now();
        limiter.delay(1_000).await;
        roughly(start.elapsed(), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_honours_cancellation() {
        let limiter = RateLimiter::new(1_000);
        tokio::time::advance(Duration::from_millis(100)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = limiter.wait_for(1_000, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_completes_without_cancellation() {
        let limiter = RateLimiter::new(1_000);
        tokio::time::advance(Duration::from_millis(500)).await;

        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.wait_for(1_000, &cancel).await.unwrap();
        roughly(start.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn sleep_for_blocks_current_thread() {
        let start = std::time::Instant::now();
        let limiter = RateLimiter::new(100_000);
        thread::sleep(Duration::from_millis(2));
        // 2000 B at 100 KB/s: the call returns no earlier than 20ms after creation.
        limiter.sleep_for(2_000);
        assert!(start.elapsed() >= Duration::from_millis(19));
    }
}
