//! Request quota accounting
//!
//! Tracks usage against the three quota dimensions the platform enforces:
//! a sliding request window, a calendar-month request cap, and a
//! calendar-month cap on retrieved items. Also enforces a minimum spacing
//! between consecutive requests so the engine never bursts even when under
//! quota.
//!
//! The tracker is an explicit instance owned by the sync engine; counters
//! survive restarts only through [`QuotaTracker::usage`] /
//! [`QuotaTracker::restore`]. Monthly counters reset lazily: every accounting
//! call checks whether the wall-clock month has advanced, so an idle process
//! picks up the rollover on its next call.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default sliding window length in seconds (15 minutes)
pub const DEFAULT_WINDOW_SECS: u64 = 15 * 60;

/// Default request cap within the sliding window
pub const DEFAULT_WINDOW_LIMIT: usize = 15;

/// Default calendar-month request cap
pub const DEFAULT_MONTHLY_REQUEST_LIMIT: u64 = 50_000;

/// Default calendar-month cap on retrieved items
pub const DEFAULT_MONTHLY_ITEM_LIMIT: u64 = 15_000;

/// Default minimum spacing between consecutive requests in milliseconds
pub const DEFAULT_MIN_SPACING_MS: u64 = 1_000;

/// Quota limits. Zero or negative limits are a configuration error and are
/// not handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub window_secs: u64,
    pub window_limit: usize,
    pub monthly_request_limit: u64,
    pub monthly_item_limit: u64,
    pub min_spacing_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            window_limit: DEFAULT_WINDOW_LIMIT,
            monthly_request_limit: DEFAULT_MONTHLY_REQUEST_LIMIT,
            monthly_item_limit: DEFAULT_MONTHLY_ITEM_LIMIT,
            min_spacing_ms: DEFAULT_MIN_SPACING_MS,
        }
    }
}

/// Serializable counter state for persistence across restarts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub window: Vec<DateTime<Utc>>,
    pub month_start: NaiveDate,
    pub month_requests: u64,
    pub month_items: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Current usage for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub window_used: usize,
    pub window_limit: usize,
    pub window_percent: f64,
    pub monthly_requests_used: u64,
    pub monthly_request_limit: u64,
    pub monthly_request_percent: f64,
    pub monthly_items_used: u64,
    pub monthly_item_limit: u64,
    pub monthly_item_percent: f64,
    /// When the oldest sliding-window slot frees up; `None` with an empty window
    pub next_window_slot_at: Option<DateTime<Utc>>,
}

/// Multi-dimension request quota tracker
#[derive(Debug)]
pub struct QuotaTracker {
    config: QuotaConfig,
    window: VecDeque<DateTime<Utc>>,
    month_start: NaiveDate,
    month_requests: u64,
    month_items: u64,
    last_request_at: Option<DateTime<Utc>>,
}

impl QuotaTracker {
    /// Create a tracker with fresh counters
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            month_start: month_floor(Utc::now()),
            month_requests: 0,
            month_items: 0,
            last_request_at: None,
        }
    }

    /// Restore a tracker from persisted counters
    pub fn restore(config: QuotaConfig, usage: QuotaUsage) -> Self {
        Self {
            config,
            window: usage.window.into(),
            month_start: usage.month_start,
            month_requests: usage.month_requests,
            month_items: usage.month_items,
            last_request_at: usage.last_request_at,
        }
    }

    /// Snapshot counters for persistence
    pub fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            window: self.window.iter().copied().collect(),
            month_start: self.month_start,
            month_requests: self.month_requests,
            month_items: self.month_items,
            last_request_at: self.last_request_at,
        }
    }

    /// Whether a request may be issued right now
    pub fn can_proceed(&mut self) -> bool {
        self.can_proceed_at(Utc::now())
    }

    pub fn can_proceed_at(&mut self, now: DateTime<Utc>) -> bool {
        self.rollover(now);
        self.prune(now);

        if self.window.len() >= self.config.window_limit {
            return false;
        }
        if self.month_requests >= self.config.monthly_request_limit {
            return false;
        }
        if self.month_items >= self.config.monthly_item_limit {
            return false;
        }
        if let Some(last) = self.last_request_at {
            let spacing = chrono::Duration::milliseconds(self.config.min_spacing_ms as i64);
            if now - last < spacing {
                return false;
            }
        }
        true
    }

    /// Wait until a request may be issued.
    ///
    /// Sleeps out sliding-window saturation and min-spacing gaps. A monthly
    /// cap is a hard stop: it will not reset before the next calendar month,
    /// so this returns a quota-exhausted error instead of waiting it out.
    pub async fn await_proceed(&mut self) -> Result<()> {
        loop {
            let now = Utc::now();
            match self.next_delay_at(now)? {
                None => return Ok(()),
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// How long until a request may be issued, or `None` if it may be issued
    /// now. Errors when a monthly cap is reached.
    pub fn next_delay_at(&mut self, now: DateTime<Utc>) -> Result<Option<Duration>> {
        self.rollover(now);

        if self.month_requests >= self.config.monthly_request_limit {
            return Err(Error::QuotaExhausted(format!(
                "monthly request cap of {} reached; resets {}",
                self.config.monthly_request_limit,
                next_month(self.month_start)
            )));
        }
        if self.month_items >= self.config.monthly_item_limit {
            return Err(Error::QuotaExhausted(format!(
                "monthly item cap of {} reached; resets {}",
                self.config.monthly_item_limit,
                next_month(self.month_start)
            )));
        }

        self.prune(now);

        if self.window.len() >= self.config.window_limit {
            if let Some(oldest) = self.window.front() {
                let frees_at = *oldest + chrono::Duration::seconds(self.config.window_secs as i64);
                let wait = frees_at - now;
                if wait > chrono::Duration::zero() {
                    return Ok(Some(wait.to_std().unwrap_or(Duration::ZERO)));
                }
            }
        }

        if let Some(last) = self.last_request_at {
            let spacing = chrono::Duration::milliseconds(self.config.min_spacing_ms as i64);
            let elapsed = now - last;
            if elapsed < spacing {
                let wait = spacing - elapsed;
                return Ok(Some(wait.to_std().unwrap_or(Duration::ZERO)));
            }
        }

        Ok(None)
    }

    /// Record one issued request. Call exactly once per actual external call.
    pub fn record_request(&mut self) {
        self.record_request_at(Utc::now());
    }

    pub fn record_request_at(&mut self, now: DateTime<Utc>) {
        self.rollover(now);
        self.window.push_back(now);
        self.month_requests += 1;
        self.last_request_at = Some(now);
    }

    /// Record `n` items retrieved toward the monthly item cap
    pub fn record_items(&mut self, n: u64) {
        self.record_items_at(n, Utc::now());
    }

    pub fn record_items_at(&mut self, n: u64, now: DateTime<Utc>) {
        self.rollover(now);
        self.month_items += n;
    }

    /// Current usage fractions for monitoring
    pub fn status(&mut self) -> QuotaStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&mut self, now: DateTime<Utc>) -> QuotaStatus {
        self.rollover(now);
        self.prune(now);

        let next_window_slot_at = self
            .window
            .front()
            .map(|oldest| *oldest + chrono::Duration::seconds(self.config.window_secs as i64));

        QuotaStatus {
            window_used: self.window.len(),
            window_limit: self.config.window_limit,
            window_percent: percent(self.window.len() as u64, self.config.window_limit as u64),
            monthly_requests_used: self.month_requests,
            monthly_request_limit: self.config.monthly_request_limit,
            monthly_request_percent: percent(self.month_requests, self.config.monthly_request_limit),
            monthly_items_used: self.month_items,
            monthly_item_limit: self.config.monthly_item_limit,
            monthly_item_percent: percent(self.month_items, self.config.monthly_item_limit),
            next_window_slot_at,
        }
    }

    /// Reset monthly counters when the wall-clock month has advanced past the
    /// tracked month start. Checked lazily on every accounting call.
    fn rollover(&mut self, now: DateTime<Utc>) {
        let current = month_floor(now);
        if current > self.month_start {
            log::info!(
                "Quota month rollover: {} -> {}, resetting monthly counters",
                self.month_start,
                current
            );
            self.month_start = current;
            self.month_requests = 0;
            self.month_items = 0;
        }
    }

    /// Drop sliding-window entries older than the window length
    fn prune(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::seconds(self.config.window_secs as i64);
        while let Some(oldest) = self.window.front() {
            if now - *oldest >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

fn month_floor(at: DateTime<Utc>) -> NaiveDate {
    let date = at.date_naive();
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

fn next_month(month_start: NaiveDate) -> NaiveDate {
    month_start
        .checked_add_months(chrono::Months::new(1))
        .unwrap_or(month_start)
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    used as f64 / limit as f64 * 100.0
}
