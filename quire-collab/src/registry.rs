//! Per-document membership index.
//!
//! Maps a document id to the sessions currently viewing it. The registry
//! tracks presence only; sessions own their own lifetime.
//!
//! Invariants:
//! - a document entry exists only while its member set is non-empty
//! - registering the same session twice has no additional effect
//! - unregistering an absent session is a no-op

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use crate::protocol::DocumentId;
use crate::transport::Transport;

/// Server-side identity of one connected client.
pub type SessionId = Uuid;

/// A registered session: its id and the write half of its connection.
#[derive(Clone)]
pub struct Member {
    pub session_id: SessionId,
    pub transport: Arc<dyn Transport>,
}

impl Member {
    pub fn new(session_id: SessionId, transport: Arc<dyn Transport>) -> Self {
        Self {
            session_id,
            transport,
        }
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("session_id", &self.session_id)
            .field("closed", &self.transport.is_closed())
            .finish()
    }
}

/// Thread-safe document → sessions map.
///
/// A single `RwLock` covers structural mutation; snapshots take the read
/// lock, so fan-out lookups for different documents proceed concurrently.
/// The lock is never held across an await point.
#[derive(Default)]
pub struct Registry {
    documents: RwLock<HashMap<DocumentId, HashMap<SessionId, Member>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a document, creating the entry if absent.
    ///
    /// Returns `false` when the session was already registered.
    pub fn register(&self, document_id: DocumentId, member: Member) -> bool {
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let members = documents.entry(document_id).or_default();
        if members.contains_key(&member.session_id) {
            return false;
        }
        members.insert(member.session_id, member);
        true
    }

    /// Remove a session from a document, dropping the entry once empty.
    ///
    /// Returns `false` when the session was not registered.
    pub fn unregister(&self, document_id: DocumentId, session_id: &SessionId) -> bool {
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(members) = documents.get_mut(&document_id) else {
            return false;
        };
        let removed = members.remove(session_id).is_some();
        if members.is_empty() {
            documents.remove(&document_id);
        }
        removed
    }

    /// Point-in-time copy of a document's members, for fan-out.
    pub fn snapshot_members(&self, document_id: DocumentId) -> Vec<Member> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents
            .get(&document_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, document_id: DocumentId) -> usize {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents.get(&document_id).map_or(0, HashMap::len)
    }

    pub fn contains(&self, document_id: DocumentId, session_id: &SessionId) -> bool {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents
            .get(&document_id)
            .is_some_and(|members| members.contains_key(session_id))
    }

    /// Number of documents with at least one member.
    pub fn document_count(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total sessions across all documents.
    pub fn session_count(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn active_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    fn member() -> Member {
        let (transport, _rx) = ChannelTransport::pair();
        Member::new(Uuid::new_v4(), transport)
    }

    #[test]
    fn test_register_creates_entry() {
        let registry = Registry::new();
        let doc = DocumentId(1);
        let m = member();

        assert!(registry.register(doc, m.clone()));
        assert_eq!(registry.member_count(doc), 1);
        assert!(registry.contains(doc, &m.session_id));
        assert_eq!(registry.active_documents(), vec![doc]);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = Registry::new();
        let doc = DocumentId(1);
        let m = member();

        assert!(registry.register(doc, m.clone()));
        assert!(!registry.register(doc, m.clone()));
        assert_eq!(registry.member_count(doc), 1);
    }

    #[test]
    fn test_unregister_removes_empty_entry() {
        let registry = Registry::new();
        let doc = DocumentId(3);
        let a = member();
        let b = member();
        registry.register(doc, a.clone());
        registry.register(doc, b.clone());

        assert!(registry.unregister(doc, &a.session_id));
        assert_eq!(registry.document_count(), 1);
        assert!(registry.unregister(doc, &b.session_id));
        assert_eq!(registry.document_count(), 0);
        assert_eq!(registry.member_count(doc), 0);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let registry = Registry::new();
        let doc = DocumentId(9);
        assert!(!registry.unregister(doc, &Uuid::new_v4()));

        let m = member();
        registry.register(doc, m.clone());
        assert!(!registry.unregister(doc, &Uuid::new_v4()));
        assert!(!registry.unregister(DocumentId(10), &m.session_id));
        assert_eq!(registry.member_count(doc), 1);
    }

    #[test]
    fn test_snapshot_of_unknown_document_is_empty() {
        let registry = Registry::new();
        assert!(registry.snapshot_members(DocumentId(42)).is_empty());
        assert_eq!(registry.document_count(), 0);
    }

    #[test]
    fn test_snapshot_is_isolated_per_document() {
        let registry = Registry::new();
        let a = member();
        let b = member();
        let c = member();
        registry.register(DocumentId(1), a.clone());
        registry.register(DocumentId(1), b.clone());
        registry.register(DocumentId(2), c.clone());

        let mut ids: Vec<SessionId> = registry
            .snapshot_members(DocumentId(1))
            .iter()
            .map(|m| m.session_id)
            .collect();
        ids.sort();
        let mut expected = vec![a.session_id, b.session_id];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(registry.session_count(), 3);
    }

    #[test]
    fn test_snapshot_is_not_affected_by_later_mutation() {
        let registry = Registry::new();
        let doc = DocumentId(1);
        let a = member();
        registry.register(doc, a.clone());

        let snapshot = registry.snapshot_members(doc);
        registry.unregister(doc, &a.session_id);
        registry.register(doc, member());

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_id, a.session_id);
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let registry = Arc::new(Registry::new());
        let doc = DocumentId(5);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let m = member();
                        registry.register(doc, m.clone());
                        let _ = registry.snapshot_members(doc);
                        registry.unregister(doc, &m.session_id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.member_count(doc), 0);
        assert_eq!(registry.document_count(), 0);
    }
}
