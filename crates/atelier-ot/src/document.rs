//! Server-side document state.
//!
//! A document holds its content, a strictly increasing version counter, and a
//! bounded window of recently applied batches. The window lets clients within
//! `max_history` versions catch up by transformation; older clients get a
//! full snapshot instead.

use crate::types::{Operation, OperationBatch};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

const DEFAULT_MAX_HISTORY: usize = 500;

#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("Operation position {position} out of bounds (length {length})")]
    OutOfBounds { position: usize, length: usize },

    #[error("Batch base version {base} is ahead of document version {current}")]
    VersionAhead { base: u64, current: u64 },
}

/// A collaborative document with bounded operation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    /// Strictly increasing; equals the number of batches ever applied.
    pub version: u64,
    /// The version of the oldest batch still retained in `history`.
    first_version: u64,
    history: VecDeque<OperationBatch>,
    max_history: usize,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_content(id, "")
    }

    pub fn with_content(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            version: 0,
            first_version: 0,
            history: VecDeque::new(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    /// Rebuild a document from persisted state. `history` holds the batches
    /// for the trailing versions, oldest first.
    pub fn restore(
        id: impl Into<String>,
        content: impl Into<String>,
        version: u64,
        history: Vec<OperationBatch>,
    ) -> Self {
        let first_version = version - history.len() as u64;
        Self {
            id: id.into(),
            content: content.into(),
            version,
            first_version,
            history: history.into(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Validate that every operation in the batch stays in bounds when
    /// applied sequentially. Runs before any mutation so a bad batch cannot
    /// leave the document half-applied.
    fn validate(&self, operations: &[Operation]) -> Result<(), DocumentError> {
        let mut length = self.char_len();
        for op in operations {
            match op {
                Operation::Insert { position, text } => {
                    if *position > length {
                        return Err(DocumentError::OutOfBounds {
                            position: *position,
                            length,
                        });
                    }
                    length += text.chars().count();
                }
                Operation::Delete { position, count } => {
                    if position + count > length {
                        return Err(DocumentError::OutOfBounds {
                            position: position + count,
                            length,
                        });
                    }
                    length -= count;
                }
                Operation::Retain { .. } => {}
            }
        }
        Ok(())
    }

    fn apply_op(content: &str, op: &Operation) -> String {
        let chars: Vec<char> = content.chars().collect();
        match op {
            Operation::Insert { position, text } => {
                let mut out: String = chars[..*position].iter().collect();
                out.push_str(text);
                out.extend(&chars[*position..]);
                out
            }
            Operation::Delete { position, count } => {
                let mut out: String = chars[..*position].iter().collect();
                out.extend(&chars[*position + *count..]);
                out
            }
            Operation::Retain { .. } => content.to_string(),
        }
    }

    /// Apply a batch whose operations are already composed against the
    /// current version. Bumps the version by exactly one and appends to
    /// history, trimming the window.
    pub fn apply_batch(&mut self, batch: OperationBatch) -> Result<(), DocumentError> {
        self.validate(&batch.operations)?;

        for op in &batch.operations {
            self.content = Self::apply_op(&self.content, op);
        }
        self.version += 1;
        self.history.push_back(batch);
        while self.history.len() > self.max_history {
            self.history.pop_front();
            self.first_version += 1;
        }
        Ok(())
    }

    /// The batches applied since `version`, oldest first, or `None` when the
    /// caller has fallen out of the retained window and needs a snapshot.
    pub fn history_since(&self, version: u64) -> Option<Vec<OperationBatch>> {
        if version > self.version {
            return None;
        }
        if version < self.first_version {
            return None;
        }
        let skip = (version - self.first_version) as usize;
        Some(self.history.iter().skip(skip).cloned().collect())
    }

    /// Whether a client at `version` can catch up by transformation.
    pub fn within_history(&self, version: u64) -> bool {
        version >= self.first_version && version <= self.version
    }

    pub fn oldest_retained_version(&self) -> u64 {
        self.first_version
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Whether a batch id is still in the retained window. Used to drop
    /// duplicate fan-out deliveries.
    pub fn history_contains(&self, batch_id: &str) -> bool {
        self.history.iter().any(|b| b.id == batch_id)
    }

    /// Content hash clients use to verify convergence.
    pub fn compute_hash(&self) -> String {
        blake3::hash(self.content.as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationBatch;

    fn batch(ops: Vec<Operation>) -> OperationBatch {
        OperationBatch::new("u1", "d1", 0, ops)
    }

    #[test]
    fn apply_increments_version_once_per_batch() {
        let mut doc = Document::new("d1");
        doc.apply_batch(batch(vec![
            Operation::insert(0, "Hello"),
            Operation::insert(5, " World"),
        ]))
        .unwrap();

        assert_eq!(doc.content, "Hello World");
        assert_eq!(doc.version, 1);
        assert_eq!(doc.history_len(), 1);
    }

    #[test]
    fn version_equals_batches_applied_and_replay_matches() {
        let mut doc = Document::new("d1");
        doc.apply_batch(batch(vec![Operation::insert(0, "abc")])).unwrap();
        doc.apply_batch(batch(vec![Operation::delete(1, 1)])).unwrap();
        doc.apply_batch(batch(vec![Operation::insert(2, "z")])).unwrap();

        assert_eq!(doc.version, 3);

        // Replaying history over the empty string reproduces the content.
        let mut replay = Document::new("replay");
        for b in doc.history_since(0).unwrap() {
            replay.apply_batch(b).unwrap();
        }
        assert_eq!(replay.content, doc.content);
    }

    #[test]
    fn invalid_batch_leaves_document_untouched() {
        let mut doc = Document::with_content("d1", "ab");
        let err = doc
            .apply_batch(batch(vec![
                Operation::insert(0, "x"),
                Operation::delete(1, 9),
            ]))
            .unwrap_err();
        assert!(matches!(err, DocumentError::OutOfBounds { .. }));
        assert_eq!(doc.content, "ab");
        assert_eq!(doc.version, 0);
    }

    #[test]
    fn history_window_trims_and_reports_snapshot_need() {
        let mut doc = Document::new("d1").with_max_history(2);
        for i in 0..5 {
            doc.apply_batch(batch(vec![Operation::insert(0, format!("{i}"))]))
                .unwrap();
        }

        assert_eq!(doc.version, 5);
        assert_eq!(doc.history_len(), 2);
        assert_eq!(doc.oldest_retained_version(), 3);

        assert!(doc.history_since(2).is_none());
        assert!(!doc.within_history(2));
        assert_eq!(doc.history_since(3).unwrap().len(), 2);
        assert_eq!(doc.history_since(5).unwrap().len(), 0);
    }

    #[test]
    fn hash_tracks_content() {
        let mut a = Document::with_content("a", "same");
        let b = Document::with_content("b", "same");
        assert_eq!(a.compute_hash(), b.compute_hash());

        a.apply_batch(batch(vec![Operation::insert(0, "!")])).unwrap();
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn multibyte_content_uses_char_offsets() {
        let mut doc = Document::with_content("d1", "héllo");
        doc.apply_batch(batch(vec![Operation::delete(1, 1)])).unwrap();
        assert_eq!(doc.content, "hllo");
    }
}
