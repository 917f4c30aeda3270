//! The backpressure scalar.
//!
//! A calibrated summary of local load in [0, 1]: the weighted max of
//! normalized send-queue depth, connection-count ratio, and error rate over
//! the trailing minute. Weighted max rather than a sum so a single saturated
//! signal can trip the breaker while mild pressure on all three cannot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const ERROR_WINDOW: Duration = Duration::from_secs(60);
const QUEUE_WEIGHT: f64 = 1.0;
const CONNECTION_WEIGHT: f64 = 0.9;
const ERROR_WEIGHT: f64 = 0.8;

/// Tracks the load signals and derives the scalar.
pub struct BackpressureGauge {
    queue_depth: AtomicUsize,
    queue_capacity: usize,
    connections: AtomicUsize,
    max_connections: usize,
    /// (timestamp, was_error) events in the trailing window.
    events: Mutex<VecDeque<(Instant, bool)>>,
}

impl BackpressureGauge {
    pub fn new(queue_capacity: usize, max_connections: usize) -> Self {
        Self {
            queue_depth: AtomicUsize::new(0),
            queue_capacity: queue_capacity.max(1),
            connections: AtomicUsize::new(0),
            max_connections: max_connections.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn record_request(&self, failed: bool) {
        if let Ok(mut events) = self.events.lock() {
            let now = Instant::now();
            while let Some((t, _)) = events.front() {
                if now.duration_since(*t) > ERROR_WINDOW {
                    events.pop_front();
                } else {
                    break;
                }
            }
            events.push_back((now, failed));
        }
    }

    fn error_rate(&self) -> f64 {
        let Ok(events) = self.events.lock() else {
            return 0.0;
        };
        let now = Instant::now();
        let mut total = 0usize;
        let mut failed = 0usize;
        for (t, was_error) in events.iter() {
            if now.duration_since(*t) <= ERROR_WINDOW {
                total += 1;
                if *was_error {
                    failed += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    /// The scalar in [0, 1].
    pub fn value(&self) -> f64 {
        let queue = self.queue_depth.load(Ordering::Relaxed) as f64 / self.queue_capacity as f64;
        let connections =
            self.connections.load(Ordering::Relaxed) as f64 / self.max_connections as f64;
        let errors = self.error_rate();

        (QUEUE_WEIGHT * queue)
            .max(CONNECTION_WEIGHT * connections)
            .max(ERROR_WEIGHT * errors)
            .clamp(0.0, 1.0)
    }
}
