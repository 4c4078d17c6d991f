//! In-process store with the same semantics as the RocksDB store.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use serde_json::Value;

use super::{now_millis, Change, ChangeLog, Document, DocumentSnapshot, StoreError};
use crate::protocol::DocumentId;

#[derive(Default)]
struct ChangeTable {
    records: Vec<Change>,
    last_created_at: u64,
}

/// Volatile document and change storage.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<BTreeMap<DocumentId, Document>>,
    changes: Mutex<ChangeTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document with the next free id.
    pub fn create_document(&self, title: &str, content: &str) -> Document {
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let next = documents.keys().next_back().map_or(1, |id| id.0 + 1);
        let now = now_millis();
        let document = Document {
            id: DocumentId(next),
            title: title.to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        };
        documents.insert(document.id, document.clone());
        document
    }

    /// Insert or replace a document under a caller-chosen id.
    pub fn put_document(&self, id: DocumentId, title: &str, content: &str) -> Document {
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let now = now_millis();
        let created_at = documents.get(&id).map_or(now, |d| d.created_at);
        let document = Document {
            id,
            title: title.to_string(),
            content: content.to_string(),
            created_at,
            updated_at: now,
        };
        documents.insert(id, document.clone());
        document
    }

    pub fn update_document(
        &self,
        id: DocumentId,
        title: &str,
        content: &str,
    ) -> Result<Document, StoreError> {
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let document = documents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        document.title = title.to_string();
        document.content = content.to_string();
        document.updated_at = now_millis();
        Ok(document.clone())
    }

    pub fn get_document(&self, id: DocumentId) -> Result<Document, StoreError> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    pub fn list_documents(&self) -> Vec<Document> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// All changes of a document in append order.
    pub fn changes(&self, document_id: DocumentId) -> Vec<Change> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .iter()
            .filter(|change| change.document_id == document_id)
            .cloned()
            .collect()
    }

    pub fn change_count(&self, document_id: DocumentId) -> usize {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .iter()
            .filter(|change| change.document_id == document_id)
            .count()
    }

    fn document_exists(&self, id: DocumentId) -> bool {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

impl ChangeLog for MemoryStore {
    fn append(&self, document_id: DocumentId, delta: &Value) -> Result<Change, StoreError> {
        if !self.document_exists(document_id) {
            return Err(StoreError::NotFound(document_id));
        }

        let mut table = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
        let created_at = now_millis().max(table.last_created_at);
        let change = Change {
            id: table.records.len() as u64 + 1,
            document_id,
            delta: delta.clone(),
            created_at,
        };
        table.last_created_at = created_at;
        table.records.push(change.clone());
        Ok(change)
    }

    fn load_snapshot(&self, document_id: DocumentId) -> Result<DocumentSnapshot, StoreError> {
        self.get_document(document_id)
            .map(|document| DocumentSnapshot::from_document(&document))
    }
}
