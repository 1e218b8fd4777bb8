//! Wall-clock rate checks.
//!
//! The limiter ignores intervals under 1 ms, so these run against the real clock, give every
//! fresh or re-limited limiter a few milliseconds to age before data flows, and move enough data
//! (100 MiB at 10 MiB/s) that no transfer fits inside a single unmeasured interval.
use std::{sync::Arc, time::Duration};

use tokio::{
    io::{duplex, AsyncWrite, AsyncWriteExt, DuplexStream},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_flowguard::{
    meter::ThroughputMeter, rate_limiter::RateLimiter, throttled::ThrottledStream,
};

const MIB: usize = 1024 * 1024;
const CHUNK: usize = 64 * 1024;
const RATE: u64 = 10 * MIB as u64;
const AGE: Duration = Duration::from_millis(5);

fn drain(mut r: DuplexStream) -> JoinHandle<u64> {
    tokio::spawn(async move { tokio::io::copy(&mut r, &mut tokio::io::sink()).await.unwrap() })
}

async fn aged(bytes_per_second: u64) -> Arc<RateLimiter> {
    let limiter = RateLimiter::new(bytes_per_second);
    time::sleep(AGE).await;
    limiter
}

/// Writes `len` bytes and flushes, which waits out the last pause.
async fn send<W: AsyncWrite + Unpin>(w: &mut W, len: usize) {
    let chunk = vec![0x5a; CHUNK];
    let mut left = len;
    while left > 0 {
        let n = left.min(CHUNK);
        w.write_all(&chunk[..n]).await.unwrap();
        left -= n;
    }
    w.flush().await.unwrap();
}

fn assert_close(actual: f64, expected: f64, tolerance: f64, what: &str) {
    let error = (actual - expected).abs() / expected;
    assert!(
        error <= tolerance,
        "{what}: got {actual:.3}, expected {expected:.3} (off by {:.1}%)",
        error * 100.0
    );
}

#[tokio::test]
async fn transfer_takes_size_over_rate() {
    let (w, r) = duplex(CHUNK);
    let reader = drain(r);

    let start = Instant::now();
    let mut w = ThrottledStream::new(w, aged(RATE).await);
    send(&mut w, 100 * MIB).await;
    let elapsed = start.elapsed().as_secs_f64();
    drop(w);

    assert_close(elapsed, 10.0, 0.02, "elapsed seconds");
    assert_eq!(reader.await.unwrap(), 100 * MIB as u64);
}

#[tokio::test]
async fn limit_change_applies_mid_transfer() {
    let (w, r) = duplex(CHUNK);
    let reader = drain(r);

    let start = Instant::now();
    let limiter = aged(RATE).await;
    let mut w = ThrottledStream::new(w, Arc::clone(&limiter));
    send(&mut w, 50 * MIB).await;

    limiter.set_limit(2 * RATE);
    time::sleep(AGE).await;
    send(&mut w, 50 * MIB).await;
    let elapsed = start.elapsed().as_secs_f64();
    drop(w);

    // 50 MiB at 10 MiB/s, then 50 MiB at 20 MiB/s
    assert_close(elapsed, 7.5, 0.02, "elapsed seconds");
    assert_eq!(reader.await.unwrap(), 100 * MIB as u64);
}

#[tokio::test]
async fn shared_limiter_caps_combined_rate() {
    let start = Instant::now();
    let limiter = aged(RATE).await;

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let (w, r) = duplex(CHUNK);
        let reader = drain(r);
        let limiter = Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move {
            let mut w = ThrottledStream::new(w, limiter);
            send(&mut w, 50 * MIB).await;
            drop(w);
            reader.await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 50 * MIB as u64);
    }

    assert_close(start.elapsed().as_secs_f64(), 10.0, 0.03, "elapsed seconds");
}

#[tokio::test]
async fn meter_tracks_throttled_rate() {
    let rate = RATE as f64;
    let (w, r) = duplex(CHUNK);
    let reader = drain(r);
    let mut w = ThroughputMeter::new(ThrottledStream::new(w, aged(RATE).await));

    let chunk = vec![0u8; CHUNK];
    let start = Instant::now();
    let mut quarter = None;
    while (w.bytes_processed() as usize) < 100 * MIB {
        w.write_all(&chunk).await.unwrap();
        // two complete one-second buckets by now
        if quarter.is_none() && start.elapsed() >= Duration::from_millis(2_500) {
            quarter = Some(w.snapshot());
        }
    }
    w.flush().await.unwrap();
    let end = w.snapshot();
    drop(w);
    reader.await.unwrap();

    let Some(quarter) = quarter else {
        panic!("transfer finished in {:?}, before the 25% sample", start.elapsed());
    };
    assert_close(quarter.total_bytes_per_second, rate, 0.02, "total at 25%");
    assert_close(quarter.recent_bytes_per_second, rate, 0.25, "recent at 25%");
    assert_close(end.total_bytes_per_second, rate, 0.02, "total at 100%");
    assert_close(end.recent_bytes_per_second, rate, 0.25, "recent at 100%");
}
