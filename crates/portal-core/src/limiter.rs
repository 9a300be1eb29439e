//! Token-bucket rate limiting and metered copying.
//!
//! One bucket per lease, shared by every connection relayed for that
//! lease. [`copy`] takes tokens *before* the corresponding write, so
//! throttling delays the writes, which is what fairly shares a bucket
//! across concurrent copies.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pool::BufferPool;

/// Staging buffer size for [`copy`].
pub const COPY_BUF_SIZE: usize = 64 * 1024;

const COPY_POOL_MAX: usize = 64;

fn copy_pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool::new(COPY_BUF_SIZE, COPY_POOL_MAX))
}

/// Usage counters, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    /// Total bytes granted.
    pub total_bytes: u64,
    /// Number of takes that had to wait.
    pub throttle_hits: u64,
    /// Cumulative time spent waiting.
    pub total_waited_ns: u64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Byte-rate token bucket. The bucket starts full.
///
/// `new` returns `None` for a non-positive rate, meaning "unlimited";
/// callers carry `Option<Arc<TokenBucket>>` and skip metering on `None`.
pub struct TokenBucket {
    rate: f64,
    max_tokens: f64,
    state: Mutex<BucketState>,
    total_bytes: AtomicU64,
    throttle_hits: AtomicU64,
    total_waited_ns: AtomicU64,
}

impl TokenBucket {
    /// Create a bucket limited to `rate_bps` bytes per second with the
    /// given burst. A burst of zero or less defaults to `rate_bps`.
    pub fn new(rate_bps: i64, burst: i64) -> Option<Arc<Self>> {
        if rate_bps <= 0 {
            return None;
        }
        let burst = if burst <= 0 { rate_bps } else { burst };
        Some(Arc::new(Self {
            rate: rate_bps as f64,
            max_tokens: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            total_bytes: AtomicU64::new(0),
            throttle_hits: AtomicU64::new(0),
            total_waited_ns: AtomicU64::new(0),
        }))
    }

    pub fn rate_bps(&self) -> i64 {
        self.rate as i64
    }

    pub fn stats(&self) -> BucketStats {
        BucketStats {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            throttle_hits: self.throttle_hits.load(Ordering::Relaxed),
            total_waited_ns: self.total_waited_ns.load(Ordering::Relaxed),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.max_tokens);
        state.last_refill = now;
    }

    /// Block until `n` tokens are consumed. Requests are never split: the
    /// call returns only after exactly `n` tokens have been taken. A
    /// request larger than the burst is granted after a proportional wait
    /// (the bucket goes into debt) so oversized reads cannot deadlock.
    pub async fn take(&self, n: usize) {
        let need = n as f64;

        let wait = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            self.refill(&mut state);
            if state.tokens >= need {
                state.tokens -= need;
                None
            } else {
                Some(Duration::from_secs_f64((need - state.tokens) / self.rate))
            }
        };

        if let Some(wait) = wait {
            self.throttle_hits.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
            self.total_waited_ns
                .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);

            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            self.refill(&mut state);
            // The wait covered the deficit at the configured rate; under
            // contention this may dip negative, which later refills repay.
            state.tokens -= need;
        }

        self.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Like [`take`], but refuses up front when the earliest satisfaction
    /// time exceeds `max_wait`. Returns `false` without consuming.
    pub async fn take_with_timeout(&self, n: usize, max_wait: Duration) -> bool {
        let need = n as f64;

        let wait = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            self.refill(&mut state);
            if state.tokens >= need {
                state.tokens -= need;
                None
            } else {
                let wait = Duration::from_secs_f64((need - state.tokens) / self.rate);
                if wait > max_wait {
                    return false;
                }
                Some(wait)
            }
        };

        if let Some(wait) = wait {
            self.throttle_hits.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
            self.total_waited_ns
                .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);

            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            self.refill(&mut state);
            state.tokens -= need;
        }

        self.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
        true
    }
}

/// Copy `src` to EOF into `dst`, metering through `bucket` when present.
/// Tokens are taken before each write. Returns the bytes copied.
pub async fn copy<R, W>(
    dst: &mut W,
    src: &mut R,
    bucket: Option<&TokenBucket>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let pool = copy_pool();
    let mut buf = pool.acquire();
    let result = copy_buf(dst, src, bucket, &mut buf).await;
    pool.release(buf);
    result
}

async fn copy_buf<R, W>(
    dst: &mut W,
    src: &mut R,
    bucket: Option<&TokenBucket>,
    buf: &mut [u8],
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        let n = match src.read(buf).await {
            Ok(0) => {
                dst.flush().await?;
                return Ok(total);
            }
            Ok(n) => n,
            Err(e) => return Err(e),
        };

        if let Some(bucket) = bucket {
            bucket.take(n).await;
        }

        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_rate_yields_no_bucket() {
        assert!(TokenBucket::new(0, 100).is_none());
        assert!(TokenBucket::new(-5, 100).is_none());
        assert!(TokenBucket::new(1024, 0).is_some());
    }

    #[tokio::test]
    async fn take_accounts_exact_totals() {
        let bucket = TokenBucket::new(1_000_000, 1_000_000).unwrap();
        bucket.take(1000).await;
        bucket.take(2000).await;
        bucket.take(3000).await;
        assert_eq!(bucket.stats().total_bytes, 6000);
    }

    #[tokio::test]
    async fn zero_wait_take_fails_when_starved() {
        let bucket = TokenBucket::new(1000, 100).unwrap();
        // Drain the initial burst.
        assert!(bucket.take_with_timeout(100, Duration::ZERO).await);
        // Nothing left and no budget to wait.
        assert!(!bucket.take_with_timeout(50, Duration::ZERO).await);
        // Generous budget succeeds.
        assert!(bucket.take_with_timeout(50, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn refused_take_consumes_nothing() {
        let bucket = TokenBucket::new(1000, 100).unwrap();
        assert!(bucket.take_with_timeout(100, Duration::ZERO).await);
        let before = bucket.stats().total_bytes;
        assert!(!bucket.take_with_timeout(1000, Duration::from_millis(1)).await);
        assert_eq!(bucket.stats().total_bytes, before);
    }

    #[tokio::test(start_paused = true)]
    async fn take_blocks_until_refill() {
        let bucket = TokenBucket::new(1000, 1000).unwrap();
        bucket.take(1000).await;

        let start = tokio::time::Instant::now();
        // 500 tokens at 1000/s: roughly half a second of simulated time.
        bucket.take(500).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(400), "waited {waited:?}");
        assert!(bucket.stats().throttle_hits >= 1);
    }

    #[tokio::test]
    async fn copy_moves_exact_bytes() {
        let blob: Vec<u8> = (0..1_048_576usize).map(|i| (i % 256) as u8).collect();
        let bucket = TokenBucket::new(1_048_576, 1_048_576).unwrap();

        let mut src = io::Cursor::new(blob.clone());
        let mut dst = io::Cursor::new(Vec::new());
        let copied = copy(&mut dst, &mut src, Some(&bucket)).await.unwrap();

        assert_eq!(copied, 1_048_576);
        assert_eq!(dst.into_inner(), blob);
        assert_eq!(bucket.stats().total_bytes, 1_048_576);
    }

    #[tokio::test]
    async fn unmetered_copy_works() {
        let mut src = io::Cursor::new(b"plain".to_vec());
        let mut dst = io::Cursor::new(Vec::new());
        let copied = copy(&mut dst, &mut src, None).await.unwrap();
        assert_eq!(copied, 5);
        assert_eq!(dst.into_inner(), b"plain");
    }
}
