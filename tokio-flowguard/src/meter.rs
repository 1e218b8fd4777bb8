//! Throughput measurement for I/O streams.
//!
//! [`ThroughputMeter`] wraps any `AsyncRead`/`AsyncWrite` (or blocking `Read`/`Write`) and records
//! every byte passing through it, in either direction. It reports two figures:
//!
//! - [`total_bytes_per_second`](ThroughputMeter::total_bytes_per_second): the average since the
//!   first measured transfer (zero during the first half second, to avoid start-up spikes);
//! - [`recent_bytes_per_second`](ThroughputMeter::recent_bytes_per_second): a sliding average over
//!   the last complete one-second buckets, excluding the bucket still being filled.
//!
//! ```no_run
//! use tokio::io::{self, AsyncReadExt, AsyncWriteExt, duplex};
//! use tokio_flowguard::meter::ThroughputMeter;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let (mut writer, reader) = duplex(64);
//! let mut reader = ThroughputMeter::new(reader);
//!
//! tokio::spawn(async move {
//!     let _ = writer.write_all(b"hello world").await;
//! });
//!
//! let mut buf = vec![0u8; 11];
//! reader.read_exact(&mut buf).await?;
//! assert_eq!(reader.bytes_processed(), 11);
//! # Ok(()) }
//! ```
//!
//! The meter is owned by the task driving the stream and is not synchronised; share a
//! [`ThroughputSnapshot`] if other tasks need the figures.
use std::{
    fmt,
    io::{self, IoSlice},
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Instant,
};

/// Number of buckets kept in the sliding window.
pub const BUCKETS: usize = 10;

/// Width of one bucket.
pub const BUCKET_WIDTH: Duration = Duration::from_secs(1);

/// `total_bytes_per_second` reports zero until this much time has passed.
pub const WARMUP: Duration = Duration::from_millis(500);

/// Bucket gaps above this reset the window instead of back-filling it.
const MAX_BACKFILL: u64 = (BUCKETS / 2) as u64;

/// Point-in-time copy of a meter's figures.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThroughputSnapshot {
    pub bytes: u64,
    pub total_bytes_per_second: f64,
    pub recent_bytes_per_second: f64,
}

/// Bucketed throughput bookkeeping, independent of any stream.
///
/// All `*_at` methods take the current time explicitly; the stream wrapper passes
/// [`Instant::now`].
#[derive(Debug, Clone, Default)]
pub struct Throughput {
    total_bytes: u64,
    first_measurement: Option<Instant>,
    // bucket 0 starts here; moved forward after a long idle gap
    window_origin: Option<Instant>,
    samples: [u64; BUCKETS],
    // absolute bucket number since `window_origin`
    current_bucket: u64,
    filled: usize,
}

impl Throughput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes recorded so far.
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.total_bytes
    }

    #[inline]
    pub fn first_measurement(&self) -> Option<Instant> {
        self.first_measurement
    }

    /// Records `bytes` transferred at `now`.
    pub fn record_at(&mut self, now: Instant, bytes: u64) {
        self.total_bytes = self.total_bytes.saturating_add(bytes);

        let Some(origin) = self.window_origin else {
            self.first_measurement = Some(now);
            self.restart_window(now, bytes);
            return;
        };

        let bucket = bucket_index(now.saturating_duration_since(origin));
        let gap = bucket.saturating_sub(self.current_bucket);

        match gap {
            0 => self.samples[slot(self.current_bucket)] += bytes,
            1..=MAX_BACKFILL => {
                for skipped in self.current_bucket + 1..bucket {
                    self.samples[slot(skipped)] = 0;
                    self.filled = (self.filled + 1).min(BUCKETS);
                }
                self.samples[slot(bucket)] = bytes;
                self.filled = (self.filled + 1).min(BUCKETS);
                self.current_bucket = bucket;
            }
            _ => self.restart_window(now, bytes),
        }
    }

    fn restart_window(&mut self, now: Instant, bytes: u64) {
        self.window_origin = Some(now);
        self.samples = [0; BUCKETS];
        self.samples[0] = bytes;
        self.current_bucket = 0;
        self.filled = 1;
    }

    /// Average since the first measurement, or `0.0` during the warm-up period.
    pub fn total_bytes_per_second_at(&self, now: Instant) -> f64 {
        let Some(first) = self.first_measurement else {
            return 0.0;
        };

        let elapsed = now.saturating_duration_since(first);
        if elapsed < WARMUP {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Average over the complete buckets preceding the current one.
    pub fn recent_bytes_per_second(&self) -> f64 {
        let complete = self.filled.saturating_sub(1) as u64;
        if complete == 0 || complete > self.current_bucket {
            return 0.0;
        }

        let oldest = self.current_bucket - complete;
        let sum: u64 = (oldest..self.current_bucket)
            .map(|b| self.samples[slot(b)])
            .sum();
        sum as f64 / (complete as f64 * BUCKET_WIDTH.as_secs_f64())
    }

    pub fn snapshot_at(&self, now: Instant) -> ThroughputSnapshot {
        ThroughputSnapshot {
            bytes: self.total_bytes,
            total_bytes_per_second: self.total_bytes_per_second_at(now),
            recent_bytes_per_second: self.recent_bytes_per_second(),
        }
    }
}

#[inline]
fn bucket_index(since_origin: Duration) -> u64 {
    (since_origin.as_nanos() / BUCKET_WIDTH.as_nanos()) as u64
}

#[inline]
fn slot(bucket: u64) -> usize {
    (bucket % BUCKETS as u64) as usize
}

/// Counts bytes flowing through a stream in both directions.
///
/// - Zero-byte transfers (EOF, empty writes) are not recorded.
/// - `reset()` forgets everything measured so far.
#[pin_project]
pub struct ThroughputMeter<T> {
    #[pin]
    inner: T,
    throughput: Throughput,
}

impl<T> ThroughputMeter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            throughput: Throughput::new(),
        }
    }

    /// Total bytes read plus written.
    #[inline]
    pub fn bytes_processed(&self) -> u64 {
        self.throughput.bytes()
    }

    pub fn total_bytes_per_second(&self) -> f64 {
        self.throughput.total_bytes_per_second_at(Instant::now())
    }

    pub fn recent_bytes_per_second(&self) -> f64 {
        self.throughput.recent_bytes_per_second()
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        self.throughput.snapshot_at(Instant::now())
    }

    #[inline]
    pub fn throughput(&self) -> &Throughput {
        &self.throughput
    }

    #[inline]
    pub fn reset(&mut self) {
        self.throughput = Throughput::new();
    }

    #[inline]
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn record(throughput: &mut Throughput, n: usize) {
    if n > 0 {
        throughput.record_at(Instant::now(), n as u64);
    }
}

impl<T: fmt::Debug> fmt::Debug for ThroughputMeter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThroughputMeter")
            .field("inner", &self.inner)
            .field("throughput", &self.throughput)
            .finish()
    }
}

impl<T: AsyncRead> AsyncRead for ThroughputMeter<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        ready!(this.inner.poll_read(cx, buf))?;
        record(this.throughput, buf.filled().len() - before);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite> AsyncWrite for ThroughputMeter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        record(this.throughput, n);
        Poll::Ready(Ok(n))
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write_vectored(cx, bufs))?;
        record(this.throughput, n);
        Poll::Ready(Ok(n))
    }
}

impl<T: io::Read> io::Read for ThroughputMeter<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        record(&mut self.throughput, n);
        Ok(n)
    }
}

impl<T: io::Write> io::Write for ThroughputMeter<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        record(&mut self.throughput, n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
