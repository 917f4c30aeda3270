//! The server-side OT engine.
//!
//! Per document the server holds (content, version, bounded history). An
//! incoming batch at an older base version is transformed against every
//! historical batch from other users (history wins ties), applied, acked to
//! the origin with the new version and content hash, and broadcast to every
//! other client of the document. When fan-out is configured the applied
//! batch is also published to the cross-pod channel.

use crate::fanout::FanOut;
use atelier_ot::{
    transform_against_history, BatchSource, Cursor, Document, DocumentPersistence, OperationBatch,
};
use atelier_types::{CoreError, CoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Events the transport layer delivers to clients. The gateway's transport
/// implements [`Broadcaster`]; the OT server holds only that capability,
/// never the connection manager itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Operation {
        batch: OperationBatch,
    },
    Cursor {
        document_id: String,
        cursor: Cursor,
    },
    PresenceJoin {
        document_id: String,
        user_id: String,
    },
    PresenceLeave {
        document_id: String,
        user_id: String,
    },
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send_to(&self, client_id: &str, event: ServerEvent);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResult {
    pub document_id: String,
    pub version: u64,
    pub content: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResult {
    pub batch_id: String,
    pub version: u64,
    pub hash: String,
    /// The operations as actually applied, after transformation. The
    /// gateway uses these to shift presence cursors.
    pub applied: Vec<atelier_ot::Operation>,
}

/// What a catching-up client receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncResult {
    /// The client can catch up by applying these in order.
    Operations {
        version: u64,
        operations: Vec<OperationBatch>,
        content: String,
        hash: String,
    },
    /// The client fell out of the history window: full reload, local
    /// pending operations must be discarded.
    Snapshot {
        version: u64,
        content: String,
        hash: String,
    },
}

struct ClientState {
    user_id: String,
    document_id: String,
    last_acked_version: u64,
}

#[derive(Default)]
struct ServerState {
    documents: HashMap<String, Document>,
    clients: HashMap<String, ClientState>,
    document_clients: HashMap<String, HashSet<String>>,
}

pub struct OtServer {
    state: Mutex<ServerState>,
    broadcaster: Arc<dyn Broadcaster>,
    persistence: Option<Arc<dyn DocumentPersistence>>,
    fanout: Option<Arc<dyn FanOut>>,
    document_history: usize,
}

impl OtServer {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            broadcaster,
            persistence: None,
            fanout: None,
            document_history: 500,
        }
    }

    /// Override the per-document retained history window.
    pub fn with_document_history(mut self, window: usize) -> Self {
        self.document_history = window;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn DocumentPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_fanout(mut self, fanout: Arc<dyn FanOut>) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub fn fanout(&self) -> Option<Arc<dyn FanOut>> {
        self.fanout.clone()
    }

    /// Register a client for a document, creating (or loading) the document
    /// on first touch.
    pub async fn register_client(
        &self,
        client_id: &str,
        user_id: &str,
        document_id: &str,
    ) -> CoreResult<RegisterResult> {
        // Load outside the lock; first-registration races just load twice.
        let loaded = if let Some(persistence) = &self.persistence {
            persistence.load_document(document_id).await
        } else {
            None
        };

        let mut state = self.state.lock().await;
        let document = state
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| {
                loaded.unwrap_or_else(|| {
                    Document::new(document_id).with_max_history(self.document_history)
                })
            });
        let result = RegisterResult {
            document_id: document_id.to_string(),
            version: document.version,
            content: document.content.clone(),
            hash: document.compute_hash(),
        };

        state.clients.insert(
            client_id.to_string(),
            ClientState {
                user_id: user_id.to_string(),
                document_id: document_id.to_string(),
                last_acked_version: result.version,
            },
        );
        state
            .document_clients
            .entry(document_id.to_string())
            .or_default()
            .insert(client_id.to_string());

        tracing::info!(client_id, user_id, document_id, "Client registered");
        Ok(result)
    }

    pub async fn unregister_client(&self, client_id: &str) -> Option<(String, String)> {
        let mut state = self.state.lock().await;
        let client = state.clients.remove(client_id)?;
        if let Some(clients) = state.document_clients.get_mut(&client.document_id) {
            clients.remove(client_id);
        }
        tracing::info!(client_id, document_id = %client.document_id, "Client unregistered");
        Some((client.document_id, client.user_id))
    }

    /// Handle an operation batch from a registered client.
    pub async fn handle_operation(
        &self,
        client_id: &str,
        batch: OperationBatch,
    ) -> CoreResult<AckResult> {
        let (ack, transformed, targets, document) = {
            let mut state = self.state.lock().await;

            let user_id = state
                .clients
                .get(client_id)
                .map(|c| c.user_id.clone())
                .ok_or_else(|| CoreError::Validation("client not registered".to_string()))?;

            let document = state
                .documents
                .get_mut(&batch.document_id)
                .ok_or_else(|| CoreError::Validation("document not found".to_string()))?;

            if batch.base_version > document.version {
                return Err(CoreError::Validation(format!(
                    "version ahead: batch base {} > document {}",
                    batch.base_version, document.version
                )));
            }
            let Some(missed) = document.history_since(batch.base_version) else {
                return Err(CoreError::Validation(format!(
                    "base version {} older than retained history; sync required",
                    batch.base_version
                )));
            };

            // History wins ties; the client's own batches are skipped.
            let mut transformed = transform_against_history(&batch, &missed);
            debug_assert_eq!(transformed.user_id, user_id);
            transformed.base_version = document.version;

            document
                .apply_batch(transformed.clone())
                .map_err(|e| CoreError::Validation(e.to_string()))?;

            let ack = AckResult {
                batch_id: batch.id.clone(),
                version: document.version,
                hash: document.compute_hash(),
                applied: transformed.operations.clone(),
            };
            if let Some(client) = state.clients.get_mut(client_id) {
                client.last_acked_version = ack.version;
            }

            let document_snapshot = state.documents.get(&batch.document_id).cloned();
            let targets: Vec<String> = state
                .document_clients
                .get(&batch.document_id)
                .map(|clients| {
                    clients
                        .iter()
                        .filter(|c| c.as_str() != client_id)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            (ack, transformed, targets, document_snapshot)
        };

        if let (Some(persistence), Some(document)) = (&self.persistence, &document) {
            persistence.save_batch(document, &transformed).await;
        }
        if transformed.source != BatchSource::Remote {
            if let Some(fanout) = &self.fanout {
                fanout.publish(&transformed.document_id, &transformed).await;
            }
        }
        for target in &targets {
            self.broadcaster
                .send_to(
                    target,
                    ServerEvent::Operation {
                        batch: transformed.clone(),
                    },
                )
                .await;
        }

        Ok(ack)
    }

    /// Apply a batch delivered by cross-pod fan-out. Returns the locally
    /// transformed batch, or `None` when the batch was a duplicate.
    pub async fn apply_remote(&self, batch: OperationBatch) -> CoreResult<Option<OperationBatch>> {
        let (transformed, targets, document) = {
            let mut state = self.state.lock().await;
            let document = state
                .documents
                .entry(batch.document_id.clone())
                .or_insert_with(|| {
                    Document::new(&batch.document_id).with_max_history(self.document_history)
                });

            if document.history_contains(&batch.id) {
                return Ok(None);
            }

            // Ordered delivery means the remote base is at or behind our
            // version; anything we applied meanwhile gets transformed in.
            let base = batch.base_version.min(document.version);
            let missed = document.history_since(base).unwrap_or_default();
            let mut transformed = transform_against_history(&batch, &missed);
            transformed.base_version = document.version;
            transformed.source = BatchSource::Remote;

            document
                .apply_batch(transformed.clone())
                .map_err(|e| CoreError::Validation(e.to_string()))?;

            let document_snapshot = state.documents.get(&batch.document_id).cloned();
            let targets: Vec<String> = state
                .document_clients
                .get(&batch.document_id)
                .map(|clients| clients.iter().cloned().collect())
                .unwrap_or_default();
            (transformed, targets, document_snapshot)
        };

        if let (Some(persistence), Some(document)) = (&self.persistence, &document) {
            persistence.save_batch(document, &transformed).await;
        }
        for target in &targets {
            self.broadcaster
                .send_to(
                    target,
                    ServerEvent::Operation {
                        batch: transformed.clone(),
                    },
                )
                .await;
        }

        Ok(Some(transformed))
    }

    /// Catch a client up from `client_version`.
    pub async fn sync_client(
        &self,
        document_id: &str,
        client_version: u64,
    ) -> CoreResult<SyncResult> {
        let state = self.state.lock().await;
        let document = state
            .documents
            .get(document_id)
            .ok_or_else(|| CoreError::Validation("document not found".to_string()))?;

        if client_version > document.version {
            return Err(CoreError::Validation(format!(
                "version ahead: client {} > document {}",
                client_version, document.version
            )));
        }

        match document.history_since(client_version) {
            Some(operations) => Ok(SyncResult::Operations {
                version: document.version,
                operations,
                content: document.content.clone(),
                hash: document.compute_hash(),
            }),
            None => Ok(SyncResult::Snapshot {
                version: document.version,
                content: document.content.clone(),
                hash: document.compute_hash(),
            }),
        }
    }

    pub async fn document_snapshot(&self, document_id: &str) -> Option<Document> {
        self.state.lock().await.documents.get(document_id).cloned()
    }

    pub async fn clients_for(&self, document_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .document_clients
            .get(document_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn client_document(&self, client_id: &str) -> Option<(String, String, u64)> {
        let state = self.state.lock().await;
        state.clients.get(client_id).map(|c| {
            (
                c.document_id.clone(),
                c.user_id.clone(),
                c.last_acked_version,
            )
        })
    }

    /// Broadcast an event to every client of a document except one.
    pub async fn broadcast_to_document(
        &self,
        document_id: &str,
        event: ServerEvent,
        exclude_client: Option<&str>,
    ) {
        let targets: Vec<String> = {
            let state = self.state.lock().await;
            state
                .document_clients
                .get(document_id)
                .map(|clients| {
                    clients
                        .iter()
                        .filter(|c| Some(c.as_str()) != exclude_client)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        for target in &targets {
            self.broadcaster.send_to(target, event.clone()).await;
        }
    }

    /// Pump one fan-out subscription into the local engine. Spawned per
    /// document; exits on cancellation.
    pub async fn run_fanout_listener(
        self: Arc<Self>,
        document_id: String,
        ctx: atelier_types::Ctx,
    ) {
        let Some(fanout) = self.fanout.clone() else {
            return;
        };
        let mut receiver = fanout.subscribe(&document_id);
        loop {
            tokio::select! {
                result = receiver.recv() => match result {
                    Ok(batch) => {
                        // Skip what this pod itself published.
                        if batch.source == BatchSource::Remote {
                            continue;
                        }
                        if let Err(err) = self.apply_remote(batch).await {
                            tracing::warn!(%err, %document_id, "Remote batch rejected");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%document_id, skipped, "Fan-out receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = ctx.cancelled() => return,
            }
        }
    }
}
