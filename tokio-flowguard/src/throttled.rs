//! Bandwidth throttling for Tokio I/O streams.
//!
//! [`ThrottledStream`] wraps any `AsyncRead`/`AsyncWrite` (or blocking `Read`/`Write`) and, after
//! each completed read or write, asks a [`RateLimiter`] how long to pause. A read waits out its
//! pause before returning; a write returns at once and its pause delays the next write, flush or
//! shutdown, so `write_all` followed by `flush` takes as long as the cap demands. Reads and writes
//! may use different limiters, and a limiter may be shared across many streams to enforce one
//! aggregate cap.
//!
//! ## Shared cap
//! ```no_run
//! use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_flowguard::{rate_limiter::RateLimiter, throttled::ThrottledStream};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let limiter = RateLimiter::new(10 * 1024 * 1024); // 10 MiB/s across both connections
//! let mut a = ThrottledStream::new(TcpStream::connect("127.0.0.1:9000").await?, limiter.clone());
//! let mut b = ThrottledStream::new(TcpStream::connect("127.0.0.1:9001").await?, limiter.clone());
//!
//! a.write_all(&[0u8; 4096]).await?;
//! let mut buf = [0u8; 4096];
//! b.read_exact(&mut buf).await?;
//!
//! limiter.set_limit(1024 * 1024); // tighten later, no rewiring needed
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - The pause is always applied **after** the inner I/O completes, never before, so a slow
//!   inner stream is not delayed twice.
//! - Bytes read before a pause are parked in an internal buffer and delivered once it ends, so
//!   a caller re-polling with a fresh `ReadBuf` loses nothing.
//! - A write returns as soon as the inner stream accepts its bytes; the pause it earned holds
//!   back the next write, flush or shutdown. Giving up on a write while it waits out that pause
//!   therefore never leaves bytes half-reported: nothing new has moved yet.
//! - Pauses reuse one lazily created `Sleep` per direction; the blocking impls use
//!   [`RateLimiter::sleep_for`] instead and never touch the Tokio timer.
use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Duration,
};

use bytes::{Buf, BytesMut};
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep_until, Instant, Sleep},
};

use crate::rate_limiter::RateLimiter;

/// A reusable pause timer.
#[derive(Default)]
struct Pause {
    sleep: Option<Pin<Box<Sleep>>>,
    active: bool,
}

impl Pause {
    fn start(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep_until(deadline))),
        }
        self.active = true;
    }

    fn poll_elapsed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.active {
            return Poll::Ready(());
        }
        if let Some(sleep) = self.sleep.as_mut() {
            ready!(sleep.as_mut().poll(cx));
        }
        self.active = false;
        Poll::Ready(())
    }
}

/// A stream whose reads and writes are paced by [`RateLimiter`]s.
#[pin_project]
pub struct ThrottledStream<T> {
    #[pin]
    inner: T,
    read_limiter: Arc<RateLimiter>,
    write_limiter: Arc<RateLimiter>,
    read_pause: Pause,
    write_pause: Pause,
    // read bytes held back until `read_pause` ends
    parked: BytesMut,
}

impl<T> ThrottledStream<T> {
    /// Throttles both directions through the same limiter.
    pub fn new(inner: T, limiter: Arc<RateLimiter>) -> Self {
        Self::with_limiters(inner, limiter.clone(), limiter)
    }

    /// Throttles reads and writes through separate limiters.
    pub fn with_limiters(
        inner: T,
        read_limiter: Arc<RateLimiter>,
        write_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            inner,
            read_limiter,
            write_limiter,
            read_pause: Pause::default(),
            write_pause: Pause::default(),
            parked: BytesMut::new(),
        }
    }

    pub fn read_limiter(&self) -> &Arc<RateLimiter> {
        &self.read_limiter
    }

    pub fn write_limiter(&self) -> &Arc<RateLimiter> {
        &self.write_limiter
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consumes the wrapper. Bytes still parked behind a pause are discarded.
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn poll_throttled_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        f: impl FnOnce(&mut Context<'_>, Pin<&mut T>) -> Poll<io::Result<usize>>,
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        ready!(this.write_pause.poll_elapsed(cx));

        let n = ready!(f(cx, this.inner))?;
        let delay = this.write_limiter.account(n);
        if !delay.is_zero() {
            this.write_pause.start(delay);
        }
        Poll::Ready(Ok(n))
    }
}

fn deliver_parked(parked: &mut BytesMut, buf: &mut ReadBuf<'_>) {
    let n = parked.len().min(buf.remaining());
    buf.put_slice(&parked[..n]);
    parked.advance(n);
}

impl<T: AsyncRead> AsyncRead for ThrottledStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        if this.read_pause.active || !this.parked.is_empty() {
            ready!(this.read_pause.poll_elapsed(cx));
            deliver_parked(this.parked, buf);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let n = buf.filled().len() - before;

        let delay = this.read_limiter.account(n);
        if delay.is_zero() {
            return Poll::Ready(Ok(()));
        }

        // hide the bytes from the caller until the pause is over
        this.parked.extend_from_slice(&buf.filled()[before..]);
        buf.set_filled(before);
        this.read_pause.start(delay);

        ready!(this.read_pause.poll_elapsed(cx));
        deliver_parked(this.parked, buf);
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite> AsyncWrite for ThrottledStream<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_throttled_write(cx, |cx, inner| inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(this.write_pause.poll_elapsed(cx));
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(this.write_pause.poll_elapsed(cx));
        this.inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.poll_throttled_write(cx, |cx, inner| inner.poll_write_vectored(cx, bufs))
    }
}

impl<T: io::Read> io::Read for ThrottledStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read_limiter.sleep_for(n);
        Ok(n)
    }
}

impl<T: io::Write> io::Write for ThrottledStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.write_limiter.sleep_for(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T: fmt::Debug> fmt::Debug for ThrottledStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledStream")
            .field("inner", &self.inner)
            .field("read_limiter", &self.read_limiter)
            .field("write_limiter", &self.write_limiter)
            .finish()
    }
}
