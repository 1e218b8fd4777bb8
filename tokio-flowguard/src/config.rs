//! Configuration values recognised by the flowguard adapters.
//!
//! - [`Timeout`]: a strictly positive inactivity timeout, or [`Timeout::Infinite`].
//! - [`TransferOptions`]: read/write/start timeouts plus a rate limit, ready to be applied to a
//!   stream in one call via [`TransferOptions::build`].
//!
//! Invalid values are rejected when they are constructed, never clamped:
//!
//! ```
//! use std::time::Duration;
//! use tokio_flowguard::config::Timeout;
//!
//! assert_eq!("infinite".parse::<Timeout>().unwrap(), Timeout::Infinite);
//! assert_eq!(
//!     "1500".parse::<Timeout>().unwrap(),
//!     Timeout::After(Duration::from_millis(1500))
//! );
//! assert!("0".parse::<Timeout>().is_err());
//! assert!(Timeout::from_millis(-7).is_err());
//! ```
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use crate::{
    error::{Error, Result},
    meter::ThroughputMeter,
    rate_limiter::RateLimiter,
    throttled::ThrottledStream,
    timeout::TimeoutStream,
};

/// Millisecond sentinel accepted by [`Timeout::from_millis`] for "no timeout".
pub const INFINITE_MILLIS: i64 = -1;

/// An inactivity timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeout {
    #[default]
    Infinite,
    After(Duration),
}

impl Timeout {
    /// Converts integer milliseconds, treating [`INFINITE_MILLIS`] as infinite.
    ///
    /// Any other value `<= 0` is rejected.
    pub fn from_millis(millis: i64) -> Result<Self> {
        match millis {
            INFINITE_MILLIS => Ok(Timeout::Infinite),
            ..=0 => Err(Error::InvalidTimeout {
                value: millis.to_string(),
            }),
            _ => Ok(Timeout::After(Duration::from_millis(millis as u64))),
        }
    }

    #[inline]
    pub fn is_infinite(&self) -> bool {
        matches!(self, Timeout::Infinite)
    }

    /// The finite duration, or `None` for [`Timeout::Infinite`].
    #[inline]
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(d) => Some(*d),
        }
    }
}

impl TryFrom<Option<Duration>> for Timeout {
    type Error = Error;

    /// `None` means infinite; `Some(Duration::ZERO)` is rejected.
    fn try_from(value: Option<Duration>) -> Result<Self> {
        match value {
            None => Ok(Timeout::Infinite),
            Some(d) if d.is_zero() => Err(Error::InvalidTimeout {
                value: format!("{d:?}"),
            }),
            Some(d) => Ok(Timeout::After(d)),
        }
    }
}

impl TryFrom<Duration> for Timeout {
    type Error = Error;

    fn try_from(value: Duration) -> Result<Self> {
        Timeout::try_from(Some(value))
    }
}

impl FromStr for Timeout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("infinite") || s.eq_ignore_ascii_case("inf") {
            return Ok(Timeout::Infinite);
        }

        let millis = s.parse::<i64>().map_err(|_| Error::InvalidTimeout {
            value: s.to_owned(),
        })?;
        Timeout::from_millis(millis)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Infinite => f.write_str("infinite"),
            Timeout::After(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

/// Parses a rate limit in bytes per second. `0` disables throttling; negative values are rejected.
pub fn parse_rate_limit(s: &str) -> Result<u64> {
    let s = s.trim();
    s.parse::<u64>().map_err(|_| Error::InvalidRateLimit {
        value: s.to_owned(),
    })
}

/// The full set of per-stream transfer options.
///
/// Defaults to no timeouts and no throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOptions {
    pub read_timeout: Timeout,
    pub write_timeout: Timeout,
    /// One-shot grace period before the first completed read or write.
    pub start_timeout: Timeout,
    /// Bytes per second, `0` = unthrottled.
    pub rate_limit: u64,
}

impl TransferOptions {
    /// Same timeout for reads and writes.
    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Timeout) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, bytes_per_second: u64) -> Self {
        self.rate_limit = bytes_per_second;
        self
    }

    /// Builds `TimeoutStream(ThroughputMeter(ThrottledStream(inner)))` with a private limiter.
    pub fn build<T>(&self, inner: T) -> TimeoutStream<ThroughputMeter<ThrottledStream<T>>> {
        self.build_shared(inner, RateLimiter::new(self.rate_limit))
    }

    /// Same as [`build`](Self::build) but throttles through an existing, possibly shared, limiter.
    ///
    /// `rate_limit` is ignored; the limiter's own limit applies.
    pub fn build_shared<T>(
        &self,
        inner: T,
        limiter: Arc<RateLimiter>,
    ) -> TimeoutStream<ThroughputMeter<ThrottledStream<T>>> {
        let throttled = ThrottledStream::new(inner, limiter);
        TimeoutStream::with_options(ThroughputMeter::new(throttled), self)
    }
}
