//! The collaboration gateway: connection lifecycle, admission control, rate
//! limits, presence wiring, and reconnection.
//!
//! Transport-agnostic: the WebSocket edge implements [`Broadcaster`] and
//! [`PresenceSink`] and calls into this type for every inbound frame.

use crate::backpressure::BackpressureGauge;
use crate::breaker::CircuitBreaker;
use crate::presence::{PresenceInfo, PresenceTracker};
use crate::reconnect::{ReconnectionManager, ReconnectionToken, RecoveryRecord};
use crate::server::{AckResult, OtServer, RegisterResult, ServerEvent, SyncResult};
use atelier_ot::{Cursor, OperationBatch};
use atelier_types::{CoreError, CoreResult, Ctx};
use atelier_ratelimit::{RateLimiter, SlidingWindowLimiter, TokenBucketLimiter};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GatewayLimits {
    /// Per-user operation rate (token bucket).
    pub ops_per_second: f64,
    pub ops_burst: u64,
    /// Per-user connection rate (sliding window per minute).
    pub connections_per_minute: usize,
    /// Concurrent cursors per document.
    pub max_cursors_per_document: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            ops_per_second: 10.0,
            ops_burst: 50,
            connections_per_minute: 10,
            max_cursors_per_document: 50,
        }
    }
}

/// Result of redeeming a reconnection token.
#[derive(Debug, Clone)]
pub struct ReconnectOutcome {
    pub session_id: String,
    pub user_id: String,
    pub client_id: String,
    /// Per document: missed operations or a full snapshot.
    pub syncs: HashMap<String, SyncResult>,
    pub cursors: HashMap<String, Cursor>,
    /// Operations the old session never saw acked. On a snapshot sync the
    /// client must discard these.
    pub pending_operations: Vec<OperationBatch>,
}

pub struct CollabGateway {
    server: Arc<OtServer>,
    presence: Arc<PresenceTracker>,
    breaker: Arc<CircuitBreaker>,
    gauge: Arc<BackpressureGauge>,
    reconnect: ReconnectionManager,
    ops_limiter: TokenBucketLimiter,
    conn_limiter: SlidingWindowLimiter,
    limits: GatewayLimits,
    /// Documents whose fan-out listener is already running.
    fanout_listeners: Mutex<HashSet<String>>,
    ctx: Ctx,
}

impl CollabGateway {
    pub fn new(
        server: Arc<OtServer>,
        presence: Arc<PresenceTracker>,
        breaker: Arc<CircuitBreaker>,
        gauge: Arc<BackpressureGauge>,
        reconnect: ReconnectionManager,
        limits: GatewayLimits,
        ctx: Ctx,
    ) -> Self {
        let ops_limiter = TokenBucketLimiter::new(limits.ops_per_second, limits.ops_burst);
        let conn_limiter =
            SlidingWindowLimiter::new(limits.connections_per_minute, Duration::from_secs(60));
        Self {
            server,
            presence,
            breaker,
            gauge,
            reconnect,
            ops_limiter,
            conn_limiter,
            limits,
            fanout_listeners: Mutex::new(HashSet::new()),
            ctx,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn gauge(&self) -> &Arc<BackpressureGauge> {
        &self.gauge
    }

    pub fn server(&self) -> &Arc<OtServer> {
        &self.server
    }

    /// Admit a new connection. Gated by the circuit breaker first, then the
    /// per-user connection rate.
    pub fn connect(&self, user_id: &str) -> CoreResult<String> {
        if !self.breaker.allow_request() {
            self.gauge.record_request(true);
            return Err(CoreError::RateLimited {
                scope: "gateway admission (circuit open)".to_string(),
                retry_after: Duration::from_secs(30),
            });
        }

        let info = self.conn_limiter.check(user_id);
        if !info.allowed() {
            return Err(CoreError::RateLimited {
                scope: "connections per minute".to_string(),
                retry_after: info.retry_after.unwrap_or(Duration::from_secs(60)),
            });
        }

        self.gauge.connection_opened();
        self.gauge.record_request(false);
        Ok(Uuid::new_v4().to_string())
    }

    fn ensure_fanout_listener(&self, document_id: &str) {
        if self.server.fanout().is_none() {
            return;
        }
        let mut listeners = self.fanout_listeners.lock().unwrap();
        if listeners.insert(document_id.to_string()) {
            let server = Arc::clone(&self.server);
            let ctx = self.ctx.clone();
            let document_id = document_id.to_string();
            tokio::spawn(server.run_fanout_listener(document_id, ctx));
        }
    }

    /// Join a document: cursor-cap check, OT registration, presence join.
    pub async fn register(
        &self,
        client_id: &str,
        user_id: &str,
        document_id: &str,
    ) -> CoreResult<(RegisterResult, Vec<PresenceInfo>)> {
        if self.presence.user_count(document_id) >= self.limits.max_cursors_per_document {
            return Err(CoreError::RateLimited {
                scope: format!("document {document_id} cursor limit"),
                retry_after: Duration::from_secs(30),
            });
        }

        let result = self
            .server
            .register_client(client_id, user_id, document_id)
            .await?;
        let presence = self.presence.presence_for(document_id);
        self.presence.join(client_id, user_id, document_id);
        self.ensure_fanout_listener(document_id);
        Ok((result, presence))
    }

    /// Apply an operation batch from a client.
    pub async fn submit_operation(
        &self,
        client_id: &str,
        user_id: &str,
        batch: OperationBatch,
    ) -> CoreResult<AckResult> {
        let info = self.ops_limiter.check(user_id);
        if !info.allowed() {
            return Err(CoreError::RateLimited {
                scope: "operations per second".to_string(),
                retry_after: info.retry_after.unwrap_or(Duration::from_secs(1)),
            });
        }

        let document_id = batch.document_id.clone();
        let result = self.server.handle_operation(client_id, batch).await;
        self.gauge.record_request(result.is_err());
        match &result {
            Ok(ack) => {
                self.breaker.record_success();
                self.presence.touch(client_id);
                for op in &ack.applied {
                    self.presence.transform_cursors(&document_id, op, client_id);
                }
            }
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    /// Update and broadcast a client's cursor.
    pub async fn cursor_update(&self, client_id: &str, document_id: &str, cursor: Cursor) {
        self.presence.update_cursor(client_id, cursor.clone());
        self.server
            .broadcast_to_document(
                document_id,
                ServerEvent::Cursor {
                    document_id: document_id.to_string(),
                    cursor,
                },
                Some(client_id),
            )
            .await;
    }

    /// Catch a client up from its version.
    pub async fn sync(&self, document_id: &str, client_version: u64) -> CoreResult<SyncResult> {
        self.server.sync_client(document_id, client_version).await
    }

    /// Tear down a connection, storing a recovery record and issuing a
    /// reconnection token.
    pub async fn disconnect(
        &self,
        client_id: &str,
        pending_operations: Vec<OperationBatch>,
    ) -> Option<ReconnectionToken> {
        let snapshot = self.server.client_document(client_id).await;
        let cursors: HashMap<String, Cursor> = match &snapshot {
            Some((document_id, user_id, _)) => self
                .presence
                .presence_for(document_id)
                .into_iter()
                .filter(|p| &p.user_id == user_id)
                .filter_map(|p| p.cursor.map(|c| (document_id.clone(), c)))
                .collect(),
            None => HashMap::new(),
        };
        let unregistered = self.server.unregister_client(client_id).await;
        self.presence.disconnect(client_id);
        self.gauge.connection_closed();

        let (document_id, user_id, last_acked) = snapshot?;
        unregistered?;

        let mut documents = HashMap::new();
        documents.insert(document_id.clone(), last_acked);

        self.reconnect.save_recovery(RecoveryRecord {
            session_id: client_id.to_string(),
            documents,
            cursors,
            pending_operations,
            saved_at: Utc::now(),
        });
        Some(self.reconnect.create_token(client_id, &user_id))
    }

    /// Redeem a reconnection token: one attempt through the backoff gate,
    /// then registration plus missed-operation replay (or a snapshot when
    /// the client fell out of the history window).
    pub async fn reconnect(&self, token: &str) -> CoreResult<ReconnectOutcome> {
        let token = self
            .reconnect
            .validate_token(token)
            .ok_or_else(|| CoreError::Validation("invalid or expired reconnection token".into()))?;

        if let Err(wait) = self.reconnect.gate_attempt(&token.session_id) {
            return Err(CoreError::RateLimited {
                scope: "reconnection attempts".to_string(),
                retry_after: wait,
            });
        }

        let recovery = self
            .reconnect
            .recovery_for(&token.session_id)
            .ok_or_else(|| CoreError::Validation("no recovery state for session".into()))?;

        let client_id = Uuid::new_v4().to_string();
        let mut syncs = HashMap::new();
        for (document_id, version) in &recovery.documents {
            self.server
                .register_client(&client_id, &token.user_id, document_id)
                .await?;
            self.presence.join(&client_id, &token.user_id, document_id);
            self.ensure_fanout_listener(document_id);
            let sync = self.server.sync_client(document_id, *version).await?;
            syncs.insert(document_id.clone(), sync);
        }

        self.gauge.connection_opened();
        self.reconnect.attempt_succeeded(&token.session_id);
        self.reconnect.revoke_session(&token.session_id);

        tracing::info!(
            session_id = %token.session_id,
            user_id = %token.user_id,
            "Session reconnected"
        );

        Ok(ReconnectOutcome {
            session_id: token.session_id,
            user_id: token.user_id,
            client_id,
            syncs,
            cursors: recovery.cursors,
            pending_operations: recovery.pending_operations,
        })
    }

}
