//! Rate limiting algorithms behind one contract.
//!
//! Three interchangeable implementations: token bucket (smooth bursts),
//! sliding window (precise counting), and fixed window (cheap counters).
//! All run purely in memory within a single process; distributed deployments
//! key them on the connection affinity established by the gateway.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Result of a rate limit check, with enough metadata for response headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    pub decision: RateLimitDecision,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    pub fn allowed(&self) -> bool {
        self.decision == RateLimitDecision::Allowed
    }
}

/// Counters every limiter exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterStats {
    pub kind: &'static str,
    pub active_keys: usize,
    pub total_checks: u64,
    pub total_allowed: u64,
    pub total_limited: u64,
}

/// The common contract: check-and-consume for one key.
pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str) -> RateLimitInfo;
    fn reset(&self, key: &str);
    fn stats(&self) -> LimiterStats;
}

fn utc_after(duration: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[derive(Default)]
struct CheckCounters {
    checks: AtomicU64,
    allowed: AtomicU64,
    limited: AtomicU64,
}

impl CheckCounters {
    fn record(&self, allowed: bool) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.limited.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ── Token bucket ─────────────────────────────────────────────────────

/// Token bucket: refills at `rate` tokens/second up to `capacity`, consumes
/// one token per check. Allows bursts up to the bucket capacity.
pub struct TokenBucketLimiter {
    rate: f64,
    capacity: f64,
    buckets: DashMap<String, (f64, Instant)>,
    counters: CheckCounters,
}

impl TokenBucketLimiter {
    pub fn new(rate: f64, capacity: u64) -> Self {
        Self {
            rate,
            capacity: capacity as f64,
            buckets: DashMap::new(),
            counters: CheckCounters::default(),
        }
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn check(&self, key: &str) -> RateLimitInfo {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert((self.capacity, now));
        let (tokens, last) = *entry;
        let refilled = (tokens + now.duration_since(last).as_secs_f64() * self.rate)
            .min(self.capacity);

        if refilled >= 1.0 {
            let remaining = refilled - 1.0;
            *entry = (remaining, now);
            self.counters.record(true);
            let refill_secs = (self.capacity - remaining) / self.rate;
            RateLimitInfo {
                decision: RateLimitDecision::Allowed,
                limit: self.capacity as u64,
                remaining: remaining as u64,
                reset_at: utc_after(Duration::from_secs_f64(refill_secs)),
                retry_after: None,
            }
        } else {
            *entry = (refilled, now);
            self.counters.record(false);
            let retry = Duration::from_secs_f64((1.0 - refilled) / self.rate);
            RateLimitInfo {
                decision: RateLimitDecision::Limited,
                limit: self.capacity as u64,
                remaining: 0,
                reset_at: utc_after(retry),
                retry_after: Some(retry),
            }
        }
    }

    fn reset(&self, key: &str) {
        self.buckets
            .insert(key.to_string(), (self.capacity, Instant::now()));
    }

    fn stats(&self) -> LimiterStats {
        LimiterStats {
            kind: "token_bucket",
            active_keys: self.buckets.len(),
            total_checks: self.counters.checks.load(Ordering::Relaxed),
            total_allowed: self.counters.allowed.load(Ordering::Relaxed),
            total_limited: self.counters.limited.load(Ordering::Relaxed),
        }
    }
}

// ── Sliding window ───────────────────────────────────────────────────

/// Sliding window: admits while fewer than `limit` requests landed in the
/// trailing `window`. Exact, at the cost of one timestamp per admitted
/// request.
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    windows: DashMap<String, Vec<Instant>>,
    counters: CheckCounters,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
            counters: CheckCounters::default(),
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, key: &str) -> RateLimitInfo {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() < self.limit {
            entry.push(now);
            self.counters.record(true);
            let reset = entry
                .first()
                .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                .unwrap_or(self.window);
            RateLimitInfo {
                decision: RateLimitDecision::Allowed,
                limit: self.limit as u64,
                remaining: (self.limit - entry.len()) as u64,
                reset_at: utc_after(reset),
                retry_after: None,
            }
        } else {
            self.counters.record(false);
            // The oldest timestamp leaving the window frees a slot.
            let retry = entry
                .first()
                .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                .unwrap_or(self.window);
            RateLimitInfo {
                decision: RateLimitDecision::Limited,
                limit: self.limit as u64,
                remaining: 0,
                reset_at: utc_after(retry),
                retry_after: Some(retry),
            }
        }
    }

    fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    fn stats(&self) -> LimiterStats {
        LimiterStats {
            kind: "sliding_window",
            active_keys: self.windows.len(),
            total_checks: self.counters.checks.load(Ordering::Relaxed),
            total_allowed: self.counters.allowed.load(Ordering::Relaxed),
            total_limited: self.counters.limited.load(Ordering::Relaxed),
        }
    }
}

// ── Fixed window ─────────────────────────────────────────────────────

/// Fixed window: maps time onto window buckets and counts per bucket.
/// Cheapest of the three; admits up to 2x the limit across a boundary.
pub struct FixedWindowLimiter {
    limit: u64,
    window: Duration,
    epoch: Instant,
    counts: DashMap<String, (u64, u64)>,
    counters: CheckCounters,
}

impl FixedWindowLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            epoch: Instant::now(),
            counts: DashMap::new(),
            counters: CheckCounters::default(),
        }
    }

    fn current_bucket(&self) -> u64 {
        (self.epoch.elapsed().as_nanos() / self.window.as_nanos().max(1)) as u64
    }

    fn window_remaining(&self) -> Duration {
        let elapsed = self.epoch.elapsed();
        let into = Duration::from_nanos((elapsed.as_nanos() % self.window.as_nanos().max(1)) as u64);
        self.window.saturating_sub(into)
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str) -> RateLimitInfo {
        let bucket = self.current_bucket();
        let mut entry = self.counts.entry(key.to_string()).or_insert((bucket, 0));
        if entry.0 != bucket {
            *entry = (bucket, 0);
        }

        let reset = self.window_remaining();
        if entry.1 < self.limit {
            entry.1 += 1;
            self.counters.record(true);
            RateLimitInfo {
                decision: RateLimitDecision::Allowed,
                limit: self.limit,
                remaining: self.limit - entry.1,
                reset_at: utc_after(reset),
                retry_after: None,
            }
        } else {
            self.counters.record(false);
            RateLimitInfo {
                decision: RateLimitDecision::Limited,
                limit: self.limit,
                remaining: 0,
                reset_at: utc_after(reset),
                retry_after: Some(reset),
            }
        }
    }

    fn reset(&self, key: &str) {
        self.counts.remove(key);
    }

    fn stats(&self) -> LimiterStats {
        LimiterStats {
            kind: "fixed_window",
            active_keys: self.counts.len(),
            total_checks: self.counters.checks.load(Ordering::Relaxed),
            total_allowed: self.counters.allowed.load(Ordering::Relaxed),
            total_limited: self.counters.limited.load(Ordering::Relaxed),
        }
    }
}
