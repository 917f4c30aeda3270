//! The admission circuit breaker.
//!
//! A three-state machine sampled on a timer:
//!
//! * `Closed`: admit everything; trip to `Open` when backpressure reaches
//!   the activation threshold.
//! * `Open`: reject admission; after `open_duration`, move to `HalfOpen`.
//! * `HalfOpen`: admit up to `half_open_max_requests` trials; any failure
//!   or still-high backpressure reopens, otherwise close.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Open when backpressure reaches this.
    pub activation_threshold: f64,
    /// A half-open circuit closes only below this.
    pub deactivation_threshold: f64,
    pub open_duration: Duration,
    pub half_open_max_requests: u32,
    /// Deadline for deciding a half-open trial round.
    pub half_open_timeout: Duration,
    pub sample_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.95,
            deactivation_threshold: 0.85,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 5,
            half_open_timeout: Duration::from_secs(10),
            sample_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub backpressure: f64,
    pub total_requests: u64,
    pub accepted_requests: u64,
    pub rejected_requests: u64,
    pub open_count: u64,
    pub half_open_successes: u32,
    pub half_open_failures: u32,
}

struct BreakerInner {
    state: CircuitState,
    entered_at: Instant,
    backpressure: f64,
    total_requests: u64,
    accepted_requests: u64,
    rejected_requests: u64,
    open_count: u64,
    half_open_requests: u32,
    half_open_successes: u32,
    half_open_failures: u32,
}

type StateChangeCallback = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    config: BreakerConfig,
    backpressure: Arc<dyn Fn() -> f64 + Send + Sync>,
    inner: Mutex<BreakerInner>,
    on_state_change: Mutex<Option<StateChangeCallback>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, backpressure: Arc<dyn Fn() -> f64 + Send + Sync>) -> Self {
        Self {
            config,
            backpressure,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                entered_at: Instant::now(),
                backpressure: 0.0,
                total_requests: 0,
                accepted_requests: 0,
                rejected_requests: 0,
                open_count: 0,
                half_open_requests: 0,
                half_open_successes: 0,
                half_open_failures: 0,
            }),
            on_state_change: Mutex::new(None),
        }
    }

    /// Install the callback invoked on every state change (used by the alert
    /// manager).
    pub fn set_on_state_change(
        &self,
        callback: impl Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    ) {
        if let Ok(mut slot) = self.on_state_change.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().map(|i| i.state).unwrap_or(CircuitState::Open)
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        inner.state = next;
        inner.entered_at = Instant::now();
        match next {
            CircuitState::Open => {
                inner.open_count += 1;
                inner.half_open_requests = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_requests = 0;
                inner.half_open_successes = 0;
                inner.half_open_failures = 0;
            }
            CircuitState::Closed => {}
        }
        tracing::info!(from = %previous, to = %next, "Circuit breaker state change");

        if let Ok(slot) = self.on_state_change.lock() {
            if let Some(callback) = slot.as_ref() {
                callback(previous, next);
            }
        }
    }

    /// One monitoring tick: refresh backpressure and apply the transition
    /// rules. Called by [`CircuitBreaker::run_monitor`] every
    /// `sample_interval`, or directly in tests.
    pub fn sample(&self) {
        let backpressure = (self.backpressure)();
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.backpressure = backpressure;
        let time_in_state = inner.entered_at.elapsed();

        match inner.state {
            CircuitState::Closed => {
                if backpressure >= self.config.activation_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {
                if time_in_state >= self.config.open_duration {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                }
            }
            CircuitState::HalfOpen => {
                let round_over = time_in_state >= self.config.half_open_timeout
                    || inner.half_open_requests >= self.config.half_open_max_requests;
                if round_over {
                    if inner.half_open_failures > 0
                        || backpressure >= self.config.deactivation_threshold
                    {
                        self.transition(&mut inner, CircuitState::Open);
                    } else {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
        }
    }

    /// Admission check.
    pub fn allow_request(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.total_requests += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.accepted_requests += 1;
                true
            }
            CircuitState::Open => {
                inner.rejected_requests += 1;
                false
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    inner.accepted_requests += 1;
                    true
                } else {
                    inner.rejected_requests += 1;
                    false
                }
            }
        }
    }

    /// Record the outcome of a half-open trial.
    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == CircuitState::HalfOpen {
                inner.half_open_successes += 1;
            }
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == CircuitState::HalfOpen {
                inner.half_open_failures += 1;
            }
        }
    }

    pub fn force_open(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    pub fn force_close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().expect("breaker lock");
        BreakerStats {
            state: inner.state,
            backpressure: inner.backpressure,
            total_requests: inner.total_requests,
            accepted_requests: inner.accepted_requests,
            rejected_requests: inner.rejected_requests,
            open_count: inner.open_count,
            half_open_successes: inner.half_open_successes,
            half_open_failures: inner.half_open_failures,
        }
    }

    /// Background sampling loop; exits on cancellation.
    pub async fn run_monitor(self: Arc<Self>, ctx: atelier_types::Ctx) {
        let mut interval = tokio::time::interval(self.config.sample_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sample(),
                _ = ctx.cancelled() => return,
            }
        }
    }
}
