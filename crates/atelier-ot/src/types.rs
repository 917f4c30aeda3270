//! Primitive operations and the batch wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A primitive edit. Positions are character offsets into the document at the
/// batch's base version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Insert { position: usize, text: String },
    Delete { position: usize, count: usize },
    /// Identity under transformation; participates in composition only.
    Retain { count: usize },
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Operation::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, count: usize) -> Self {
        Operation::Delete { position, count }
    }

    pub fn retain(count: usize) -> Self {
        Operation::Retain { count }
    }
}

/// Where a batch entered this pod from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSource {
    /// A directly connected client.
    User,
    /// Cross-pod fan-out.
    Remote,
    /// The agent writing its own artifacts.
    System,
}

/// The unit of atomicity: all operations in a batch apply (after
/// transformation) or none do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub id: String,
    pub user_id: String,
    pub document_id: String,
    /// The document version the client observed when composing the batch.
    #[serde(rename = "version")]
    pub base_version: u64,
    pub operations: Vec<Operation>,
    pub timestamp: DateTime<Utc>,
    pub source: BatchSource,
}

impl OperationBatch {
    pub fn new(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        base_version: u64,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            document_id: document_id.into(),
            base_version,
            operations,
            timestamp: Utc::now(),
            source: BatchSource::User,
        }
    }

    pub fn with_source(mut self, source: BatchSource) -> Self {
        self.source = source;
        self
    }

    /// A copy carrying the same identity but different operations, used by
    /// the transformer.
    pub fn with_operations(&self, operations: Vec<Operation>) -> Self {
        Self {
            operations,
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_wire_format() {
        let op = Operation::insert(5, " World");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["position"], 5);
        assert_eq!(json["text"], " World");

        let del = Operation::delete(2, 3);
        let json = serde_json::to_value(&del).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["count"], 3);
    }

    #[test]
    fn unknown_operation_type_is_rejected() {
        let result: Result<Operation, _> =
            serde_json::from_str(r#"{"type":"replace","position":0,"text":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn batch_serializes_base_version_as_version() {
        let batch = OperationBatch::new("u1", "d1", 7, vec![Operation::retain(3)]);
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["version"], 7);
        assert_eq!(json["source"], "user");
    }
}
