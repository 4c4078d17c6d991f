//! Persistence collaborators for the synchronization core.
//!
//! ```text
//! ┌─────────────┐  append(doc, delta)   ┌──────────────────────────────┐
//! │  Session    │ ────────────────────► │ ChangeLog                    │
//! │             │ ◄──────────────────── │  DocumentStore (RocksDB)     │
//! └─────────────┘  load_snapshot(doc)   │  MemoryStore   (in-process)  │
//!                                       └──────────────────────────────┘
//! ```
//!
//! The core only depends on the [`ChangeLog`] contract. Document management
//! (create/update/list) lives on the concrete stores and is used by tooling.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::DocumentId;

pub use memory::MemoryStore;
pub use rocks::{DocumentStore, StoreConfig};

/// Append-only record of one edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Store-wide sequence number, increasing in append completion order
    pub id: u64,
    pub document_id: DocumentId,
    /// Opaque edit payload exactly as the client sent it
    pub delta: Value,
    /// Milliseconds since the Unix epoch, never decreasing within a store
    pub created_at: u64,
}

/// Full stored document. `content` is serialized JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// The state sent to a client when its session becomes active.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub title: String,
    /// `None` when the stored content is not valid JSON
    pub content: Option<Value>,
}

impl DocumentSnapshot {
    pub fn from_document(document: &Document) -> Self {
        let content = match serde_json::from_str(&document.content) {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("Stored content of doc {} is not JSON: {e}", document.id);
                None
            }
        };
        Self {
            title: document.title.clone(),
            content,
        }
    }
}

/// Contract the session uses to record edits and fetch initial state.
pub trait ChangeLog: Send + Sync {
    /// Durably record one edit for an existing document.
    fn append(&self, document_id: DocumentId, delta: &Value) -> Result<Change, StoreError>;

    /// Latest full state of a document.
    fn load_snapshot(&self, document_id: DocumentId) -> Result<DocumentSnapshot, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
