//! The real-time collaboration core.
//!
//! An OT server with per-document convergence, presence with
//! leave-grace, cross-pod fan-out, reconnection with missed-op replay, and a
//! backpressure-driven circuit breaker gating admission. The gateway here is
//! transport-agnostic: the WebSocket edge implements [`Broadcaster`] and maps
//! [`ServerEvent`]s onto wire frames.

#![deny(unsafe_code)]

pub mod backpressure;
pub mod breaker;
pub mod fanout;
pub mod gateway;
pub mod presence;
pub mod reconnect;
pub mod server;

pub use backpressure::BackpressureGauge;
pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use fanout::{FanOut, InMemoryFanOut};
pub use gateway::{CollabGateway, GatewayLimits, ReconnectOutcome};
pub use presence::{PresenceInfo, PresenceSink, PresenceTracker};
pub use reconnect::{ReconnectionConfig, ReconnectionManager, ReconnectionToken, RecoveryRecord};
pub use server::{AckResult, Broadcaster, OtServer, RegisterResult, ServerEvent, SyncResult};
