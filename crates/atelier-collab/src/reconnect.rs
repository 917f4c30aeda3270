//! Reconnection: tokens, recovery records, and the backoff gate.

use atelier_ot::{Cursor, OperationBatch};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub token_ttl: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(3600),
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            backoff_multiplier: 2,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// A short-lived credential granting one reconnection attempt stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionToken {
    pub token: String,
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ReconnectionToken {
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Everything needed to resume a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub session_id: String,
    /// Per document: the last version the client acknowledged.
    pub documents: HashMap<String, u64>,
    pub cursors: HashMap<String, Cursor>,
    /// Operations the client had sent but never saw acked.
    pub pending_operations: Vec<OperationBatch>,
    pub saved_at: DateTime<Utc>,
}

struct BackoffState {
    attempts: u32,
    last_attempt: Instant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconnectionStats {
    pub tokens_issued: u64,
    pub attempted: u64,
    pub successful: u64,
    pub failed: u64,
}

#[derive(Default)]
struct ManagerState {
    tokens: HashMap<String, ReconnectionToken>,
    session_tokens: HashMap<String, String>,
    recovery: HashMap<String, RecoveryRecord>,
    backoff: HashMap<String, BackoffState>,
    stats: ReconnectionStats,
}

pub struct ReconnectionManager {
    config: ReconnectionConfig,
    state: Mutex<ManagerState>,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn random_token() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(43)
            .map(char::from)
            .collect()
    }

    /// Issue a token for a session; any previous token for it is revoked.
    pub fn create_token(&self, session_id: &str, user_id: &str) -> ReconnectionToken {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.config.token_ttl)
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        let token = ReconnectionToken {
            token: Self::random_token(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };

        let mut state = self.state.lock().unwrap();
        if let Some(old) = state.session_tokens.remove(session_id) {
            state.tokens.remove(&old);
        }
        state
            .session_tokens
            .insert(session_id.to_string(), token.token.clone());
        state.tokens.insert(token.token.clone(), token.clone());
        state.stats.tokens_issued += 1;
        token
    }

    pub fn validate_token(&self, token: &str) -> Option<ReconnectionToken> {
        let state = self.state.lock().unwrap();
        state.tokens.get(token).filter(|t| t.is_valid()).cloned()
    }

    pub fn revoke_session(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(token) = state.session_tokens.remove(session_id) {
            state.tokens.remove(&token);
        }
        state.recovery.remove(session_id);
        state.backoff.remove(session_id);
    }

    pub fn save_recovery(&self, record: RecoveryRecord) {
        let mut state = self.state.lock().unwrap();
        state.recovery.insert(record.session_id.clone(), record);
    }

    pub fn recovery_for(&self, session_id: &str) -> Option<RecoveryRecord> {
        self.state.lock().unwrap().recovery.get(session_id).cloned()
    }

    fn delay_for(&self, attempts: u32) -> Duration {
        let factor = self
            .config
            .backoff_multiplier
            .saturating_pow(attempts.saturating_sub(1).min(16));
        (self.config.base_backoff * factor).min(self.config.max_backoff)
    }

    /// The exponential-backoff admission gate. `Ok` marks an attempt as
    /// consumed; `Err` carries the wait the caller must observe.
    pub fn gate_attempt(&self, session_id: &str) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();
        state.stats.attempted += 1;

        let now = Instant::now();
        match state.backoff.get_mut(session_id) {
            None => {
                state.backoff.insert(
                    session_id.to_string(),
                    BackoffState {
                        attempts: 1,
                        last_attempt: now,
                    },
                );
                Ok(())
            }
            Some(backoff) => {
                if backoff.attempts >= self.config.max_attempts {
                    state.stats.failed += 1;
                    return Err(self.config.max_backoff);
                }
                let required = self.delay_for(backoff.attempts);
                let since_last = now.duration_since(backoff.last_attempt);
                if since_last < required {
                    state.stats.failed += 1;
                    return Err(required - since_last);
                }
                backoff.attempts += 1;
                backoff.last_attempt = now;
                Ok(())
            }
        }
    }

    /// Reset backoff after a successful reconnection.
    pub fn attempt_succeeded(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.backoff.remove(session_id);
        state.stats.successful += 1;
    }

    /// Drop expired tokens and stale recovery records. Returns how many
    /// entries were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;

        let expired: Vec<String> = state
            .tokens
            .iter()
            .filter(|(_, t)| !t.is_valid())
            .map(|(k, _)| k.clone())
            .collect();
        for token in expired {
            if let Some(t) = state.tokens.remove(&token) {
                state.session_tokens.remove(&t.session_id);
            }
            removed += 1;
        }

        // Recovery records live twice the token TTL.
        let ttl = ChronoDuration::from_std(self.config.token_ttl * 2)
            .unwrap_or_else(|_| ChronoDuration::hours(2));
        let cutoff = Utc::now() - ttl;
        let stale: Vec<String> = state
            .recovery
            .iter()
            .filter(|(_, r)| r.saved_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for session in stale {
            state.recovery.remove(&session);
            removed += 1;
        }

        removed
    }

    pub fn stats(&self) -> ReconnectionStats {
        self.state.lock().unwrap().stats.clone()
    }
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self::new(ReconnectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ReconnectionConfig {
        ReconnectionConfig {
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn token_round_trip() {
        let manager = ReconnectionManager::default();
        let token = manager.create_token("sess-1", "alice");
        assert!(manager.validate_token(&token.token).is_some());
        assert!(manager.validate_token("bogus").is_none());
    }

    #[test]
    fn new_token_revokes_the_old_one() {
        let manager = ReconnectionManager::default();
        let first = manager.create_token("sess-1", "alice");
        let second = manager.create_token("sess-1", "alice");
        assert!(manager.validate_token(&first.token).is_none());
        assert!(manager.validate_token(&second.token).is_some());
    }

    #[test]
    fn revoke_clears_everything() {
        let manager = ReconnectionManager::default();
        let token = manager.create_token("sess-1", "alice");
        manager.save_recovery(RecoveryRecord {
            session_id: "sess-1".to_string(),
            documents: HashMap::new(),
            cursors: HashMap::new(),
            pending_operations: vec![],
            saved_at: Utc::now(),
        });

        manager.revoke_session("sess-1");
        assert!(manager.validate_token(&token.token).is_none());
        assert!(manager.recovery_for("sess-1").is_none());
    }

    #[test]
    fn backoff_gate_enforces_delay_and_cap() {
        let manager = ReconnectionManager::new(fast_config());

        // First attempt passes immediately.
        assert!(manager.gate_attempt("sess").is_ok());
        // Second attempt within the backoff window is rejected with a wait.
        let wait = manager.gate_attempt("sess").unwrap_err();
        assert!(wait <= Duration::from_millis(5));

        // After waiting, attempts pass until the cap.
        for _ in 1..5 {
            std::thread::sleep(Duration::from_millis(55));
            assert!(manager.gate_attempt("sess").is_ok());
        }
        std::thread::sleep(Duration::from_millis(55));
        assert!(manager.gate_attempt("sess").is_err());
    }

    #[test]
    fn success_resets_backoff() {
        let manager = ReconnectionManager::new(fast_config());
        assert!(manager.gate_attempt("sess").is_ok());
        manager.attempt_succeeded("sess");
        assert!(manager.gate_attempt("sess").is_ok());
    }

    #[test]
    fn cleanup_drops_expired_tokens() {
        let manager = ReconnectionManager::new(ReconnectionConfig {
            token_ttl: Duration::from_millis(0),
            ..fast_config()
        });
        manager.create_token("sess-1", "alice");
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(manager.cleanup_expired(), 1);
    }

    #[test]
    fn stats_count_attempts() {
        let manager = ReconnectionManager::new(fast_config());
        manager.gate_attempt("sess").unwrap();
        let _ = manager.gate_attempt("sess");
        manager.attempt_succeeded("sess");

        let stats = manager.stats();
        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
    }
}
