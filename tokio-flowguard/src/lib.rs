//! Flow control adapters for Tokio I/O streams.
//!
//! Each adapter wraps one stream and implements the same I/O traits as the stream it wraps, so
//! they compose freely:
//!
//! - [`throttled::ThrottledStream`] caps bandwidth through a shareable
//!   [`rate_limiter::RateLimiter`], pausing after each read or write;
//! - [`meter::ThroughputMeter`] counts bytes and reports all-time and recent throughput;
//! - [`timeout::TimeoutStream`] fails reads and writes that stall, with an optional one-shot
//!   grace period before the first byte, and exposes a token that fires on timeout.
//!
//! The usual stack is built in one call with [`config::TransferOptions::build`] or chained with
//! the [`io::FlowGuardExt`] helpers:
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncReadExt};
//! use tokio::net::TcpStream;
//! use tokio_flowguard::config::{Timeout, TransferOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let options = TransferOptions::default()
//!     .with_timeout(Timeout::After(Duration::from_secs(10)))
//!     .with_start_timeout(Timeout::After(Duration::from_secs(60)))
//!     .with_rate_limit(10 * 1024 * 1024);
//!
//! let mut stream = options.build(TcpStream::connect("127.0.0.1:8080").await?);
//! let mut body = Vec::new();
//! stream.read_to_end(&mut body).await?;
//! println!("{:?}", stream.get_ref().snapshot());
//! # Ok(()) }
//! ```
pub mod config;
pub mod error;
pub mod io;
pub mod meter;
pub mod rate_limiter;
pub mod throttled;
pub mod timeout;

pub use config::{Timeout, TransferOptions};
pub use error::{Direction, Error, Result};
pub use meter::ThroughputMeter;
pub use rate_limiter::RateLimiter;
pub use throttled::ThrottledStream;
pub use timeout::TimeoutStream;
