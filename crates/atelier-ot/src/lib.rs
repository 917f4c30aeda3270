//! Operational transformation for collaborative text documents.
//!
//! The engine guarantees per-document convergence (TP1): for two batches A
//! and B composed against the same base version,
//! `apply(apply(doc, A), transform(B, A)) == apply(apply(doc, B), transform(A, B))`.
//! No ordering is promised across documents.

#![deny(unsafe_code)]

pub mod cursor;
pub mod document;
pub mod persist;
pub mod transform;
pub mod types;

pub use cursor::{transform_cursor, Cursor};
pub use document::{Document, DocumentError};
pub use persist::DocumentPersistence;
pub use transform::{transform, transform_against_history, transform_batch, Priority};
pub use types::{BatchSource, Operation, OperationBatch};
