//! Outbound webhooks with HMAC signatures.
//!
//! Each delivery POSTs `{event, timestamp, data}` with headers
//! `X-Webhook-ID`, `X-Webhook-Timestamp` (unix seconds) and
//! `X-Webhook-Signature: sha256=<hex>`, where the signature is
//! `HMAC_SHA256(secret, "{timestamp}.{payload_json}")`. Receivers must
//! reject timestamps older than five minutes.

use crate::alerting::{Alert, AlertSink};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a delivery on the receiving side.
pub const MAX_TIMESTAMP_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: secret.into(),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Signs and delivers alerts to one webhook endpoint.
pub struct WebhookSink {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

/// `sha256=<hex>` over `"{timestamp}.{payload}"`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Receiver-side verification: checks the signature and the timestamp age
/// against `MAX_TIMESTAMP_AGE`.
pub fn verify_signature(secret: &str, timestamp: i64, payload: &str, signature: &str) -> bool {
    let age = chrono::Utc::now().timestamp() - timestamp;
    if age < 0 || age as u64 > MAX_TIMESTAMP_AGE.as_secs() {
        return false;
    }
    let expected = sign_payload(secret, timestamp, payload);
    // Length check first keeps the comparison constant-time in practice.
    expected.len() == signature.len()
        && expected
            .bytes()
            .zip(signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, alert: &Alert) {
        let payload = json!({
            "event": alert.event,
            "timestamp": alert.timestamp.to_rfc3339(),
            "data": {
                "severity": alert.severity,
                "message": alert.message,
                "details": alert.data,
            },
        });
        let body = payload.to_string();
        let webhook_id = Uuid::new_v4().to_string();

        let mut backoff = self.config.base_backoff;
        for attempt in 0..=self.config.max_retries {
            let timestamp = chrono::Utc::now().timestamp();
            let signature = sign_payload(&self.config.secret, timestamp, &body);

            let result = self
                .client
                .post(&self.config.url)
                .header("content-type", "application/json")
                .header("X-Webhook-ID", &webhook_id)
                .header("X-Webhook-Timestamp", timestamp.to_string())
                .header("X-Webhook-Signature", &signature)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => {
                    tracing::warn!(
                        event = %alert.event,
                        status = %response.status(),
                        attempt,
                        "Webhook delivery rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(event = %alert.event, %err, attempt, "Webhook delivery failed");
                }
            }

            if attempt < self.config.max_retries {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
        }
        tracing::error!(
            event = %alert.event,
            retries = self.config.max_retries,
            "Webhook delivery gave up"
        );
    }
}
