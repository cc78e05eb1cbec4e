//! Token buckets for the global upload and download caps.
//!
//! Upload is throttled by delaying each PIECE slice until the bucket has
//! enough tokens. Download is throttled by delaying reads from the socket,
//! which delays our TCP ACKs; every read also debits the upload bucket by
//! `tcp_ack_fudge` to account for the ACK traffic it causes.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::{sleep, Instant};
use tracing::debug;

/// Lowest rate the automatic mode will settle on, bytes/s.
const AUTO_MIN_RATE: f64 = 5.0 * 1024.0;
/// Highest rate the automatic mode will climb to, bytes/s.
const AUTO_MAX_RATE: f64 = 10.0 * 1024.0 * 1024.0;
/// Samples kept for the RTT average.
const PING_SAMPLES: usize = 8;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// 0 is unlimited.
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }

    fn unlimited(&self) -> bool {
        self.tokens_per_sec <= 0.0
    }
}

#[derive(Debug)]
struct Auto {
    target: Duration,
    pings: VecDeque<Duration>,
}

/// A token bucket shared by every connection of the process.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    auto: Mutex<Option<Auto>>,
}

impl RateLimiter {
    /// Rate in bytes per second, 0 is unlimited. The bucket holds two
    /// seconds worth of tokens for bursts.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        let rate = bytes_per_sec as f64;
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: rate * 2.0,
                max_tokens: rate * 2.0,
                tokens_per_sec: rate,
                last_update: Instant::now(),
            }),
            auto: Mutex::new(None),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(0)
    }

    /// Let [`RateLimiter::ping`] drive the rate so RTTs stay under `target`.
    pub fn with_auto(self: Arc<Self>, target: Duration) -> Arc<Self> {
        {
            let mut bucket = self.lock_bucket();
            if bucket.unlimited() {
                bucket.tokens_per_sec = AUTO_MAX_RATE;
                bucket.max_tokens = AUTO_MAX_RATE * 2.0;
            }
        }
        *self.lock_auto() = Some(Auto { target, pings: VecDeque::new() });
        self
    }

    fn lock_bucket(&self) -> MutexGuard<'_, TokenBucket> {
        // the bucket is plain numbers, a poisoned lock still holds sane data
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_auto(&self) -> MutexGuard<'_, Option<Auto>> {
        self.auto.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.lock_bucket();
        let rate = bytes_per_sec as f64;
        bucket.tokens_per_sec = rate;
        bucket.max_tokens = rate * 2.0;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    /// Bytes per second, 0 when unlimited.
    pub fn rate(&self) -> u64 {
        let bucket = self.lock_bucket();
        bucket.tokens_per_sec as u64
    }

    /// Take `bytes` tokens, returning how long the caller must wait before
    /// using them.
    pub fn reserve(&self, bytes: usize) -> Duration {
        let mut bucket = self.lock_bucket();
        if bucket.unlimited() {
            return Duration::ZERO;
        }
        bucket.refill();
        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bucket.tokens_per_sec)
        }
    }

    /// Wait until `bytes` may be transferred.
    pub async fn acquire(&self, bytes: usize) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    /// Debit tokens without waiting, the debt is paid by later callers.
    pub fn charge(&self, bytes: f64) {
        let mut bucket = self.lock_bucket();
        if bucket.unlimited() {
            return;
        }
        bucket.refill();
        bucket.tokens -= bytes;
    }

    /// Feed an RTT sample to the automatic mode. Above target the rate is
    /// cut by a fifth, below it creeps up by a twentieth.
    pub fn ping(&self, rtt: Duration) {
        let mut auto = self.lock_auto();
        let Some(auto) = auto.as_mut() else { return };

        auto.pings.push_back(rtt);
        if auto.pings.len() > PING_SAMPLES {
            auto.pings.pop_front();
        }
        let avg = auto.pings.iter().sum::<Duration>() / auto.pings.len() as u32;

        let mut bucket = self.lock_bucket();
        let rate = if avg > auto.target {
            (bucket.tokens_per_sec * 0.8).max(AUTO_MIN_RATE)
        } else {
            (bucket.tokens_per_sec * 1.05).min(AUTO_MAX_RATE)
        };
        if rate != bucket.tokens_per_sec {
            debug!("auto upload rate {:.0} -> {rate:.0} (avg rtt {avg:?})", bucket.tokens_per_sec);
        }
        bucket.tokens_per_sec = rate;
        bucket.max_tokens = rate * 2.0;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }
}
