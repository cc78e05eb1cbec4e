//! Rate meters.
//!
//! [`Measure`] is the per-connection meter the choker and the request
//! pipeline read, a running average over a sliding window. [`Counter`] is
//! the torrent-wide total with an EMA-smoothed rate, refreshed once per
//! second for state snapshots.
use std::time::Duration;

use tokio::time::Instant;

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

/// Average rate over the last `max_rate_period` seconds.
#[derive(Debug, Clone)]
pub struct Measure {
    max_rate_period: Duration,
    rate_since: Instant,
    last: Instant,
    rate: f64,
    total: u64,
}

impl Measure {
    pub fn new(max_rate_period: f64) -> Self {
        let now = Instant::now();
        let max_rate_period = Duration::from_secs_f64(max_rate_period.max(1.0));
        Self {
            max_rate_period,
            // pretend one second already passed so the first sample does not
            // explode into an absurd rate
            rate_since: now.checked_sub(Duration::from_secs(1)).unwrap_or(now),
            last: now,
            rate: 0.0,
            total: 0,
        }
    }

    pub fn update(&mut self, amount: u64) {
        self.total += amount;
        let now = Instant::now();
        let span = now.duration_since(self.rate_since).as_secs_f64();
        let held = self.last.duration_since(self.rate_since).as_secs_f64();
        if span > 0.0 {
            self.rate = (self.rate * held + amount as f64) / span;
        }
        self.last = now;
        if now.duration_since(self.rate_since) > self.max_rate_period {
            self.rate_since = now - self.max_rate_period;
        }
    }

    /// Bytes per second. Decays while nothing arrives.
    pub fn rate(&mut self) -> f64 {
        self.update(0);
        self.rate
    }

    /// Rate as of the last update, without decaying it.
    pub fn rate_noupdate(&self) -> f64 {
        self.rate
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Seconds until `new_amount` more bytes fit under `target` bytes/s.
    pub fn time_until_rate(&self, new_amount: u64, target: f64) -> f64 {
        if target <= 0.0 {
            return 0.0;
        }
        let now = Instant::now();
        let held = self.last.duration_since(self.rate_since).as_secs_f64();
        let t = (self.rate * held + new_amount as f64) / target;
        let elapsed = now.duration_since(self.rate_since).as_secs_f64();
        (t - elapsed).max(0.0)
    }
}

/// Torrent-wide transfer totals.
#[derive(Debug)]
pub struct Counter {
    pub total_downloaded: u64,
    pub total_uploaded: u64,

    window_downloaded: u64,
    window_uploaded: u64,
    last_update: Instant,
    ema_download: f64,
    ema_upload: f64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: 0,
            total_uploaded: 0,
            window_downloaded: 0,
            window_uploaded: 0,
            last_update: Instant::now(),
            ema_download: 0.0,
            ema_upload: 0.0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record downloaded bytes
    pub fn record_download(&mut self, bytes: u64) {
        self.total_downloaded += bytes;
        self.window_downloaded += bytes;
    }

    /// Record uploaded bytes
    pub fn record_upload(&mut self, bytes: u64) {
        self.total_uploaded += bytes;
        self.window_uploaded += bytes;
    }

    /// Update rates with EMA smoothing
    pub fn update_rates(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        if elapsed < 0.001 {
            return;
        }

        let dl_rate = std::mem::take(&mut self.window_downloaded) as f64 / elapsed;
        let ul_rate = std::mem::take(&mut self.window_uploaded) as f64 / elapsed;

        self.ema_download = if self.ema_download == 0.0 {
            dl_rate
        } else {
            EMA_ALPHA * dl_rate + (1.0 - EMA_ALPHA) * self.ema_download
        };

        self.ema_upload = if self.ema_upload == 0.0 {
            ul_rate
        } else {
            EMA_ALPHA * ul_rate + (1.0 - EMA_ALPHA) * self.ema_upload
        };

        self.last_update = now;
    }

    pub fn download_rate(&self) -> f64 {
        self.ema_download
    }

    pub fn upload_rate(&self) -> f64 {
        self.ema_upload
    }
}
