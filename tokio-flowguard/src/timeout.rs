//! Inactivity timeouts for Tokio I/O streams.
//!
//! [`TimeoutStream`] wraps any `AsyncRead`/`AsyncWrite` and fails a read or write that makes no
//! progress within its configured timeout. The timeout bounds each individual inner operation,
//! not the transfer as a whole: a slow transfer made of many small successful reads never times
//! out.
//!
//! Three timers are available:
//! - a **read** timer and a **write** timer, re-armed at the start of every call in that
//!   direction;
//! - a one-shot **start** grace period, armed only until the first read or write ever completes,
//!   so a slow-to-begin inner stream (connection setup, a server thinking before its first byte)
//!   is not mistaken for a stalled one.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncReadExt};
//! use tokio::net::TcpStream;
//! use tokio_flowguard::{error, timeout::TimeoutStream};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let mut stream = TimeoutStream::new(TcpStream::connect("127.0.0.1:12345").await?);
//! stream.set_read_timeout(Some(Duration::from_secs(5)))?;
//! stream.set_start_timeout(Some(Duration::from_secs(30)))?;
//!
//! let mut buf = vec![0u8; 64 * 1024];
//! match stream.read(&mut buf).await {
//!     Err(err) if error::is_timeout(&err) => eprintln!("peer stalled: {err}"),
//!     other => { other?; }
//! }
//! # Ok(()) }
//! ```
//!
//! ## Cancellation
//! Dropping a pending future is Tokio's native way to give up on an operation.
//! [`read_cancellable`](TimeoutStream::read_cancellable) and
//! [`write_cancellable`](TimeoutStream::write_cancellable) additionally accept a
//! [`CancellationToken`] and report its firing as [`Error::Cancelled`], which callers can tell
//! apart from a timeout.
//!
//! ## Under the hood
//! - Every poll resolves the race in a fixed order: inner completion, then caller cancellation,
//!   then the direction timer, then the start timer. A completed operation is therefore never
//!   reported as a timeout, and a caller that cancelled is never told the stream stalled.
//! - Timers are re-armed only when a new call begins and are polled only while that call is in
//!   flight, so an old deadline cannot fire into a later call.
//! - When any timer fires, the stream's [`timeout_token`](TimeoutStream::timeout_token) is
//!   cancelled, every operation in flight on the stream fails, and the stream stays failed.
//! - Timer changes apply to calls that start after the change.
use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use futures::future::poll_fn;
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep_until, Instant, Sleep},
};
use tokio_util::sync::{
    CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned,
};
use tracing::debug;

use crate::{
    config::{Timeout, TransferOptions},
    error::{Direction, Error, Result},
};

/// A re-armable deadline.
#[derive(Default)]
struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
    // the timeout captured when the timer was armed
    armed: Option<Duration>,
}

impl Timer {
    fn arm(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep_until(deadline))),
        }
        self.armed = Some(timeout);
    }

    #[inline]
    fn disarm(&mut self) {
        self.armed = None;
    }

    #[inline]
    fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Resolves with the armed timeout once the deadline passes. Never resolves while disarmed.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Duration> {
        let (Some(timeout), Some(sleep)) = (self.armed, self.sleep.as_mut()) else {
            return Poll::Pending;
        };
        ready!(sleep.as_mut().poll(cx));
        self.armed = None;
        Poll::Ready(timeout)
    }
}

/// Per-direction call state.
#[derive(Default)]
struct Call {
    in_flight: bool,
    timer: Timer,
    // fires when a timer elsewhere on the stream expires
    expiry: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

/// Everything except the inner stream; `Unpin`.
struct Guard {
    read_timeout: Timeout,
    write_timeout: Timeout,
    start_timeout: Timeout,
    completed: bool,
    read: Call,
    write: Call,
    start: Timer,
    expired: Option<(Direction, Duration)>,
    token: CancellationToken,
}

impl Guard {
    fn new(options: &TransferOptions) -> Self {
        Self {
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            start_timeout: options.start_timeout,
            completed: false,
            read: Call::default(),
            write: Call::default(),
            start: Timer::default(),
            expired: None,
            token: CancellationToken::new(),
        }
    }

    fn calls(&mut self, direction: Direction) -> (&mut Call, &Call) {
        match direction {
            Direction::Read => (&mut self.read, &self.write),
            _ => (&mut self.write, &self.read),
        }
    }

    fn expired_error(&self) -> Option<Error> {
        self.expired
            .map(|(direction, timeout)| Error::TimedOut { direction, timeout })
    }

    /// Whether any timer on the stream could still fire.
    fn can_expire(&self) -> bool {
        !self.read_timeout.is_infinite()
            || !self.write_timeout.is_infinite()
            || (!self.completed && !self.start_timeout.is_infinite())
            || self.start.is_armed()
    }

    /// Arms this call's timers unless the call is already in flight.
    fn begin(&mut self, direction: Direction) {
        let timeout = match direction {
            Direction::Read => self.read_timeout,
            _ => self.write_timeout,
        };
        let (call, _) = self.calls(direction);
        if call.in_flight {
            return;
        }

        call.in_flight = true;
        if let Some(timeout) = timeout.duration() {
            call.timer.arm(timeout);
        }
        if !self.completed
            && let Some(timeout) = self.start_timeout.duration()
        {
            self.start.arm(timeout);
        }
    }

    /// Ends the call and disarms what it armed. `completed` latches the first success.
    fn finish(&mut self, direction: Direction, completed: bool) {
        let (call, other) = self.calls(direction);
        call.in_flight = false;
        call.timer.disarm();
        let other_in_flight = other.in_flight;

        if completed {
            self.completed = true;
            self.start.disarm();
        } else if !other_in_flight {
            self.start.disarm();
        }
    }

    fn expire(&mut self, direction: Direction, timer: Direction, timeout: Duration) -> Error {
        let (call, _) = self.calls(direction);
        call.in_flight = false;
        call.timer.disarm();
        self.start.disarm();

        debug!(%timer, ?timeout, "stream timed out");
        self.expired = Some((timer, timeout));
        self.token.cancel();
        Error::TimedOut {
            direction: timer,
            timeout,
        }
    }

    /// Polls everything that can interrupt a pending call, in priority order.
    fn poll_interrupt(
        &mut self,
        cx: &mut Context<'_>,
        direction: Direction,
        caller: Option<Pin<&mut WaitForCancellationFuture<'_>>>,
    ) -> Poll<Error> {
        if let Some(caller) = caller
            && caller.poll(cx).is_ready()
        {
            self.finish(direction, false);
            return Poll::Ready(Error::Cancelled);
        }

        let (call, _) = self.calls(direction);
        if let Poll::Ready(timeout) = call.timer.poll_expired(cx) {
            return Poll::Ready(self.expire(direction, direction, timeout));
        }

        if let Poll::Ready(timeout) = self.start.poll_expired(cx) {
            return Poll::Ready(self.expire(direction, Direction::Start, timeout));
        }

        let token = self.token.clone();
        let (call, _) = self.calls(direction);
        let expiry = call
            .expiry
            .get_or_insert_with(|| Box::pin(token.cancelled_owned()));
        if expiry.as_mut().poll(cx).is_ready() {
            call.in_flight = false;
            call.timer.disarm();
            if let Some(err) = self.expired_error() {
                return Poll::Ready(err);
            }
        }

        Poll::Pending
    }
}

/// A stream that fails reads and writes which stall for longer than their timeout.
///
/// Created with all timeouts infinite; see the [module docs](self) for semantics.
#[pin_project]
pub struct TimeoutStream<T> {
    #[pin]
    inner: T,
    guard: Guard,
}

impl<T> TimeoutStream<T> {
    /// Wraps `inner` with every timeout disabled.
    pub fn new(inner: T) -> Self {
        Self::with_options(inner, &TransferOptions::default())
    }

    /// Wraps `inner` using the timeouts in `options`; its rate limit is ignored here.
    pub fn with_options(inner: T, options: &TransferOptions) -> Self {
        Self {
            inner,
            guard: Guard::new(options),
        }
    }

    pub fn read_timeout(&self) -> Timeout {
        self.guard.read_timeout
    }

    pub fn write_timeout(&self) -> Timeout {
        self.guard.write_timeout
    }

    pub fn start_timeout(&self) -> Timeout {
        self.guard.start_timeout
    }

    /// Sets the read inactivity timeout; `None` disables it, zero is rejected.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.guard.read_timeout = Timeout::try_from(timeout)?;
        Ok(())
    }

    /// Sets the write inactivity timeout; `None` disables it, zero is rejected.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.guard.write_timeout = Timeout::try_from(timeout)?;
        Ok(())
    }

    /// Sets the start grace period; `None` disables it, zero is rejected.
    ///
    /// Has no effect once an operation has completed.
    pub fn set_start_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.guard.start_timeout = Timeout::try_from(timeout)?;
        Ok(())
    }

    /// Disables the read, write and start timeouts in one step.
    pub fn disable_timeouts(&mut self) {
        self.guard.read_timeout = Timeout::Infinite;
        self.guard.write_timeout = Timeout::Infinite;
        self.guard.start_timeout = Timeout::Infinite;
    }

    /// Always `true`.
    pub fn can_timeout(&self) -> bool {
        true
    }

    /// Whether any read or write has completed successfully.
    pub fn has_completed_operation(&self) -> bool {
        self.guard.completed
    }

    /// Ends the start grace period as if an operation had completed.
    ///
    /// Useful once a higher-level exchange is known to be under way.
    pub fn mark_completed(&mut self) {
        self.guard.completed = true;
        self.guard.start.disarm();
    }

    /// The timer that fired, if the stream has timed out.
    pub fn timed_out(&self) -> Option<Direction> {
        self.guard.expired.map(|(direction, _)| direction)
    }

    /// A token cancelled when any timer on this stream fires.
    ///
    /// Pass it to work beyond this stream (e.g. an HTTP request) so a stall aborts that too.
    /// Cancelling the returned token does not affect the stream.
    pub fn timeout_token(&self) -> CancellationToken {
        self.guard.token.child_token()
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn poll_guarded<R>(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        direction: Direction,
        caller: Option<Pin<&mut WaitForCancellationFuture<'_>>>,
        latch: bool,
        op: impl FnOnce(&mut Context<'_>, Pin<&mut T>) -> Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        let this = self.project();
        let guard = this.guard;

        if let Some(err) = guard.expired_error() {
            return Poll::Ready(Err(err.into()));
        }

        guard.begin(direction);

        // nothing can interrupt this call
        if caller.is_none() && !guard.can_expire() {
            let res = ready!(op(cx, this.inner));
            guard.finish(direction, latch && res.is_ok());
            return Poll::Ready(res);
        }

        if let Poll::Ready(res) = op(cx, this.inner) {
            guard.finish(direction, latch && res.is_ok());
            return Poll::Ready(res);
        }

        let err = ready!(guard.poll_interrupt(cx, direction, caller));
        Poll::Ready(Err(err.into()))
    }
}

/// Abandons the call if its future is dropped before completing.
struct CallGuard<'a, T> {
    stream: &'a mut TimeoutStream<T>,
    direction: Direction,
}

impl<T> Drop for CallGuard<'_, T> {
    fn drop(&mut self) {
        let (call, _) = self.stream.guard.calls(self.direction);
        if call.in_flight {
            self.stream.guard.finish(self.direction, false);
        }
    }
}

impl<T: AsyncRead + Unpin> TimeoutStream<T> {
    /// Reads into `buf`, failing with [`Error::Cancelled`] if `cancel` fires first.
    pub async fn read_cancellable(
        &mut self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> io::Result<usize> {
        let cancelled = cancel.cancelled();
        tokio::pin!(cancelled);

        let call = CallGuard {
            stream: self,
            direction: Direction::Read,
        };
        poll_fn(|cx| {
            let mut rb = ReadBuf::new(&mut *buf);
            Pin::new(&mut *call.stream)
                .poll_guarded(
                    cx,
                    Direction::Read,
                    Some(cancelled.as_mut()),
                    true,
                    |cx, inner| inner.poll_read(cx, &mut rb),
                )
                .map_ok(|()| rb.filled().len())
        })
        .await
    }
}

impl<T: AsyncWrite + Unpin> TimeoutStream<T> {
    /// Writes from `buf`, failing with [`Error::Cancelled`] if `cancel` fires first.
    pub async fn write_cancellable(
        &mut self,
        buf: &[u8],
        cancel: &CancellationToken,
    ) -> io::Result<usize> {
        let cancelled = cancel.cancelled();
        tokio::pin!(cancelled);

        let call = CallGuard {
            stream: self,
            direction: Direction::Write,
        };
        poll_fn(|cx| {
            Pin::new(&mut *call.stream).poll_guarded(
                cx,
                Direction::Write,
                Some(cancelled.as_mut()),
                true,
                |cx, inner| inner.poll_write(cx, buf),
            )
        })
        .await
    }
}

impl<T: AsyncRead> AsyncRead for TimeoutStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_guarded(cx, Direction::Read, None, true, |cx, inner| {
            inner.poll_read(cx, buf)
        })
    }
}

impl<T: AsyncWrite> AsyncWrite for TimeoutStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_guarded(cx, Direction::Write, None, true, |cx, inner| {
            inner.poll_write(cx, buf)
        })
    }

    /// Guarded by the write timer, but does not end the start grace period.
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_guarded(cx, Direction::Write, None, false, |cx, inner| {
            inner.poll_flush(cx)
        })
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.poll_guarded(cx, Direction::Write, None, true, |cx, inner| {
            inner.poll_write_vectored(cx, bufs)
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for TimeoutStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutStream")
            .field("inner", &self.inner)
            .field("read_timeout", &self.guard.read_timeout)
            .field("write_timeout", &self.guard.write_timeout)
            .field("start_timeout", &self.guard.start_timeout)
            .field("completed", &self.guard.completed)
            .field("timed_out", &self.guard.expired)
            .finish()
    }
}
