//! Flowguard extension trait.
//!
//! This blanket impl lets you bolt the crate's throttling, metering and timeout adapters straight
//! onto any Tokio stream via ergonomic extension methods, and compose them in a single chain.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_flowguard::{config::Timeout, io::FlowGuardExt, rate_limiter::RateLimiter};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let limiter = RateLimiter::new(512 * 1024);
//! let mut stream = TcpStream::connect("127.0.0.1:12345")
//!     .await?
//!     .throttle(limiter.clone())
//!     .meter()
//!     .observe_timeouts(Timeout::After(Duration::from_secs(5)));
//!
//! stream.write_all(b"ping").await?;
//! let mut buf = [0u8; 4];
//! stream.read_exact(&mut buf).await?;
//! println!("{:.0} B/s", stream.get_ref().total_bytes_per_second());
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - [`FlowGuardExt`] is implemented for every `Sized` type; each method only wraps and never
//!   touches the stream, so the chain order is the wrapping order (innermost first).
//! - The adapters forward whatever I/O traits the inner stream implements, so the same chain
//!   works for read-only, write-only and duplex streams.
use std::sync::Arc;

use crate::{
    config::{Timeout, TransferOptions},
    meter::ThroughputMeter,
    rate_limiter::RateLimiter,
    throttled::ThrottledStream,
    timeout::TimeoutStream,
};

/// Wrapping helpers for flowguard adapters.
///
/// # Examples
/// ```
/// use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
/// use tokio_flowguard::{io::FlowGuardExt, rate_limiter::RateLimiter};
///
/// # async fn example() {
/// let (mut w, r) = duplex(64);
/// let mut r = r.throttle(RateLimiter::new(0)).meter();
/// w.write_all(b"hello").await.unwrap();
/// let mut buf = vec![0; 5];
/// r.read_exact(&mut buf).await.unwrap();
/// assert_eq!(r.bytes_processed(), 5);
/// # }
/// ```
pub trait FlowGuardExt: Sized {
    /// Throttle reads and writes through `limiter`.
    ///
    /// Share one limiter between streams to cap their combined rate.
    #[must_use]
    fn throttle(self, limiter: Arc<RateLimiter>) -> ThrottledStream<Self> {
        ThrottledStream::new(self, limiter)
    }

    /// Throttle reads and writes through separate limiters.
    #[must_use]
    fn throttle_split(
        self,
        read_limiter: Arc<RateLimiter>,
        write_limiter: Arc<RateLimiter>,
    ) -> ThrottledStream<Self> {
        ThrottledStream::with_limiters(self, read_limiter, write_limiter)
    }

    /// Count the bytes passing through and report throughput.
    #[must_use]
    fn meter(self) -> ThroughputMeter<Self> {
        ThroughputMeter::new(self)
    }

    /// Fail reads and writes that stall for longer than `timeout`.
    #[must_use]
    fn observe_timeouts(self, timeout: Timeout) -> TimeoutStream<Self> {
        let options = TransferOptions::default().with_timeout(timeout);
        TimeoutStream::with_options(self, &options)
    }

    /// Same as [`observe_timeouts`](Self::observe_timeouts) with the timeouts of `options`,
    /// including the start grace period.
    #[must_use]
    fn observe_timeouts_with(self, options: &TransferOptions) -> TimeoutStream<Self> {
        TimeoutStream::with_options(self, options)
    }
}

impl<T> FlowGuardExt for T {}
