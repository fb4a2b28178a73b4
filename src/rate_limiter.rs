//! Token-bucket pacing for merge writes.
//!
//! Permits are bytes. Stored permits accumulate while the bucket is idle,
//! capped at `max_permits`; a request first drains stored permits and then
//! charges the remainder as wait time appended to `next_free`. Only merge
//! threads go through the bucket — user operations are never throttled here.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const MICROS_PER_SEC: f64 = 1_000_000.0;

pub struct RateLimiter {
    epoch: Instant,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    /// Microseconds per permit.
    interval: f64,
    max_permits: f64,
    stored_permits: f64,
    /// Microseconds since `epoch` at which the next permit is free.
    next_free: u64,
}

impl RateLimiter {
    /// Bucket issuing `rate` permits per second, storing up to `max_permits`
    /// while idle.
    pub fn new(rate: f64, max_permits: f64) -> Result<Self> {
        if rate <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "rate must be greater than 0, got {rate}"
            )));
        }
        if max_permits <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "max_permits must be greater than 0, got {max_permits}"
            )));
        }
        Ok(Self {
            epoch: Instant::now(),
            bucket: Mutex::new(Bucket {
                interval: MICROS_PER_SEC / rate,
                max_permits,
                stored_permits: 0.0,
                next_free: 0,
            }),
        })
    }

    /// Default merge pacing: 100 MiB/s with a 100 MiB burst.
    pub fn default_for_merges() -> Self {
        let bytes = (100 * 1024 * 1024) as f64;
        Self::new(bytes, bytes).expect("default rate is positive")
    }

    /// Blocks until `permits` permits are available. Returns how long the
    /// caller waited.
    pub fn acquire(&self, permits: u64) -> Result<Duration> {
        let wait = self.claim_next(permits)?;
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        Ok(wait)
    }

    /// Returns `false` without blocking iff the permits cannot be issued
    /// within `timeout`; otherwise blocks in [`RateLimiter::acquire`].
    pub fn try_acquire(&self, permits: u64, timeout: Duration) -> Result<bool> {
        {
            let bucket = self.bucket.lock();
            let now = self.now_micros();
            let deadline = now.saturating_add(timeout.as_micros() as u64);
            if bucket.next_free > deadline {
                return Ok(false);
            }
        }
        self.acquire(permits)?;
        Ok(true)
    }

    pub fn set_rate(&self, rate: f64) -> Result<()> {
        if rate <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "rate must be greater than 0, got {rate}"
            )));
        }
        self.bucket.lock().interval = MICROS_PER_SEC / rate;
        Ok(())
    }

    pub fn rate(&self) -> f64 {
        MICROS_PER_SEC / self.bucket.lock().interval
    }

    fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn claim_next(&self, permits: u64) -> Result<Duration> {
        if permits == 0 {
            return Err(Error::InvalidArgument(
                "must request a positive amount of permits".to_string(),
            ));
        }

        let mut bucket = self.bucket.lock();
        let now = self.now_micros();

        // Idle time refills stored permits.
        if now > bucket.next_free {
            let refill = (now - bucket.next_free) as f64 / bucket.interval;
            bucket.stored_permits = bucket.max_permits.min(bucket.stored_permits + refill);
            bucket.next_free = now;
        }

        // Synced above, so this is >= 0.
        let wait = bucket.next_free - now;

        let permits = permits as f64;
        let stored = permits.min(bucket.stored_permits);
        let fresh = permits - stored;

        // Stored permits cost nothing; fresh permits push out next_free.
        bucket.next_free += (fresh * bucket.interval) as u64;
        bucket.stored_permits -= stored;

        Ok(Duration::from_micros(wait))
    }
}
