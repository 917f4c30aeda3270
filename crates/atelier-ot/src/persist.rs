//! Optional durable persistence for documents.
//!
//! The OT server owns documents in memory; a persistence backend, when
//! configured, is written through on every apply and read on first load.
//! Failures are logged and do not block the editing path.

use crate::document::Document;
use crate::types::OperationBatch;
use async_trait::async_trait;

#[async_trait]
pub trait DocumentPersistence: Send + Sync {
    /// Load a document and its retained history, if one was saved.
    async fn load_document(&self, document_id: &str) -> Option<Document>;

    /// Record an applied batch together with the document's new state.
    async fn save_batch(&self, document: &Document, batch: &OperationBatch);
}
