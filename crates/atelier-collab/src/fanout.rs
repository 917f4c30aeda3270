//! Cross-pod fan-out.
//!
//! A second process participating in the same document subscribes on a
//! shared channel keyed by document id; every local apply publishes the
//! transformed batch there. Required channel semantics: at-least-once
//! delivery, per-document ordered. Because every apply goes through the OT
//! engine (with batch-id dedup inside the history window), duplicate or late
//! delivery is safe.

use atelier_ot::OperationBatch;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait FanOut: Send + Sync {
    async fn publish(&self, document_id: &str, batch: &OperationBatch);
    fn subscribe(&self, document_id: &str) -> broadcast::Receiver<OperationBatch>;
}

/// Single-process fan-out on tokio broadcast channels. Stands in for the
/// shared bus in tests and single-node deployments; the semantics match
/// what a remote bus must provide.
#[derive(Default)]
pub struct InMemoryFanOut {
    channels: DashMap<String, broadcast::Sender<OperationBatch>>,
}

impl InMemoryFanOut {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, document_id: &str) -> broadcast::Sender<OperationBatch> {
        self.channels
            .entry(document_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl FanOut for InMemoryFanOut {
    async fn publish(&self, document_id: &str, batch: &OperationBatch) {
        // No subscribers is fine; the send result only signals that.
        let _ = self.sender(document_id).send(batch.clone());
    }

    fn subscribe(&self, document_id: &str) -> broadcast::Receiver<OperationBatch> {
        self.sender(document_id).subscribe()
    }
}
