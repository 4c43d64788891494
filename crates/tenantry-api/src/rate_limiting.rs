//! Fixed-window rate limiting for provisioning work.
//!
//! The provisioning queue starts at most `limit` jobs per `window`, so a burst
//! of signups does not turn into a burst of `CREATE DATABASE` statements
//! against the control-plane server.
//!
//! ## Example
//!
//! ```rust,ignore
//! let limiter = WindowRateLimiter::new(100, Duration::from_secs(5));
//!
//! limiter.acquire().await; // waits for the next window if this one is used up
//! run_job().await;
//! ```

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Counter for the current window
#[derive(Debug, Clone)]
struct WindowBucket {
    count: u32,
    window_start: Instant,
}

/// Admits at most `limit` permits per `window`.
#[derive(Debug)]
pub struct WindowRateLimiter {
    limit: u32,
    window: Duration,
    bucket: Mutex<WindowBucket>,
}

impl WindowRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            bucket: Mutex::new(WindowBucket {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Take a permit if the current window has one left.
    ///
    /// Returns the time until the next window otherwise.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= self.limit {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(bucket.window_start));
            return Err(retry_after);
        }

        bucket.count += 1;
        Ok(())
    }

    /// Wait until a permit is available and take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(retry_after) => {
                    debug!(
                        limit = self.limit,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Rate limit reached, waiting for next window"
                    );
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }
}
