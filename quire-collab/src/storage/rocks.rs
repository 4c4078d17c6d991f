//! RocksDB-backed document and change store.
//!
//! Column families:
//! - `documents`: Document records (bincode), keyed by id (8 bytes BE)
//! - `changes`  : Change records, keyed by `<doc_id:8 BE><change_id:8 BE>`,
//!                 deltas LZ4 compressed
//! - `metadata` : Store-wide counters (change sequence)
//!
//! Appends are serialized behind one lock so that change ids follow append
//! completion order.
//!
//! Reference: Kleppmann DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{now_millis, Change, ChangeLog, Document, DocumentSnapshot, StoreError};
use crate::protocol::DocumentId;

const CF_DOCUMENTS: &str = "documents";
const CF_CHANGES: &str = "changes";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CHANGES, CF_METADATA];

const KEY_CHANGE_SEQUENCE: &[u8] = b"change_sequence";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-supplied directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DocumentRecord {
    title: String,
    content: String,
    created_at: u64,
    updated_at: u64,
}

#[derive(Serialize, Deserialize)]
struct ChangeRecord {
    created_at: u64,
    /// LZ4-compressed JSON text of the delta
    delta: Vec<u8>,
}

#[derive(Default)]
struct ChangeSequence {
    last_id: u64,
    last_created_at: u64,
}

/// RocksDB-backed store.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded CF mode: concurrency via our own locks)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Highest document id handed out
    document_sequence: Mutex<u64>,
    /// Held for the whole of an append
    change_sequence: Mutex<ChangeSequence>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let last_document = Self::recover_document_sequence(&db)?;
        let last_change = Self::recover_change_sequence(&db)?;
        log::debug!(
            "Opened store at {} (last doc {last_document}, last change {last_change})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            document_sequence: Mutex::new(last_document),
            change_sequence: Mutex::new(ChangeSequence {
                last_id: last_change,
                last_created_at: 0,
            }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHANGES => {
                // Appended often, prefix-scanned by document id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(8));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    fn recover_document_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_DOCUMENTS)
            .ok_or_else(|| missing_cf(CF_DOCUMENTS))?;
        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(read_u64(&key).unwrap_or(0))
            }
            None => Ok(0),
        }
    }

    fn recover_change_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| missing_cf(CF_METADATA))?;
        Ok(db
            .get_cf(cf, KEY_CHANGE_SEQUENCE)?
            .as_deref()
            .and_then(read_u64)
            .unwrap_or(0))
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Create a document with the next free id.
    pub fn create_document(&self, title: &str, content: &str) -> Result<Document, StoreError> {
        let mut sequence = self
            .document_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = DocumentId(*sequence + 1);
        let now = now_millis();
        let document = Document {
            id,
            title: title.to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.write_document(&document)?;
        *sequence = id.0;
        Ok(document)
    }

    /// Insert or replace a document under a caller-chosen id.
    pub fn put_document(
        &self,
        id: DocumentId,
        title: &str,
        content: &str,
    ) -> Result<Document, StoreError> {
        let mut sequence = self
            .document_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = now_millis();
        let created_at = match self.get_document(id) {
            Ok(existing) => existing.created_at,
            Err(StoreError::NotFound(_)) => now,
            Err(e) => return Err(e),
        };
        let document = Document {
            id,
            title: title.to_string(),
            content: content.to_string(),
            created_at,
            updated_at: now,
        };
        self.write_document(&document)?;
        *sequence = (*sequence).max(id.0);
        Ok(document)
    }

    /// Replace title and content of an existing document.
    pub fn update_document(
        &self,
        id: DocumentId,
        title: &str,
        content: &str,
    ) -> Result<Document, StoreError> {
        let _sequence = self
            .document_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut document = self.get_document(id)?;
        document.title = title.to_string();
        document.content = content.to_string();
        document.updated_at = now_millis();
        self.write_document(&document)?;
        Ok(document)
    }

    pub fn get_document(&self, id: DocumentId) -> Result<Document, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.to_be_bytes())? {
            Some(bytes) => decode_document(id, &bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    pub fn list_documents(&self) -> Result<Vec<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut documents = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let Some(id) = read_u64(&key) else {
                continue;
            };
            documents.push(decode_document(DocumentId(id), &value)?);
        }
        Ok(documents)
    }

    fn write_document(&self, document: &Document) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let record = DocumentRecord {
            title: document.title.clone(),
            content: document.content.clone(),
            created_at: document.created_at,
            updated_at: document.updated_at,
        };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db
            .put_cf_opt(cf, document.id.to_be_bytes(), bytes, &self.write_options())?;
        Ok(())
    }

    // ─── Changes ──────────────────────────────────────────────────────

    /// All changes of a document in append order.
    pub fn changes(&self, document_id: DocumentId) -> Result<Vec<Change>, StoreError> {
        let cf = self.cf(CF_CHANGES)?;
        let prefix = document_id.to_be_bytes();
        let start = change_key(document_id, 0);

        let mut changes = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != 16 || key[..8] != prefix {
                break;
            }
            let id = read_u64(&key[8..]).unwrap_or(0);
            changes.push(decode_change(id, document_id, &value)?);
        }
        Ok(changes)
    }

    pub fn change_count(&self, document_id: DocumentId) -> Result<usize, StoreError> {
        Ok(self.changes(document_id)?.len())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or_else(|| missing_cf(name))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl ChangeLog for DocumentStore {
    fn append(&self, document_id: DocumentId, delta: &Value) -> Result<Change, StoreError> {
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut sequence = self
            .change_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Changes may only reference stored documents.
        self.get_document(document_id)?;

        let json = serde_json::to_vec(delta).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let id = sequence.last_id + 1;
        let created_at = now_millis().max(sequence.last_created_at);
        let record = ChangeRecord {
            created_at,
            delta: lz4_flex::compress_prepend_size(&json),
        };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_changes, change_key(document_id, id), bytes);
        batch.put_cf(cf_meta, KEY_CHANGE_SEQUENCE, id.to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        sequence.last_id = id;
        sequence.last_created_at = created_at;

        Ok(Change {
            id,
            document_id,
            delta: delta.clone(),
            created_at,
        })
    }

    fn load_snapshot(&self, document_id: DocumentId) -> Result<DocumentSnapshot, StoreError> {
        let document = self.get_document(document_id)?;
        Ok(DocumentSnapshot::from_document(&document))
    }
}

fn decode_document(id: DocumentId, bytes: &[u8]) -> Result<Document, StoreError> {
    let (record, _): (DocumentRecord, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(Document {
        id,
        title: record.title,
        content: record.content,
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}

fn decode_change(id: u64, document_id: DocumentId, bytes: &[u8]) -> Result<Change, StoreError> {
    let (record, _): (ChangeRecord, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    let json = lz4_flex::decompress_size_prepended(&record.delta)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let delta =
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(Change {
        id,
        document_id,
        delta,
        created_at: record.created_at,
    })
}

/// `<doc_id:8 BE><change_id:8 BE>`
fn change_key(document_id: DocumentId, change_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&document_id.to_be_bytes());
    key[8..].copy_from_slice(&change_id.to_be_bytes());
    key
}

fn read_u64(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

fn missing_cf(name: &str) -> StoreError {
    StoreError::Database(format!("Column family '{name}' not found"))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open(path: &Path) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(path)).unwrap()
    }

    #[test]
    fn test_create_and_get_document() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let doc = store.create_document("Roadmap", r#"{"ops":[]}"#).unwrap();
        assert_eq!(doc.id, DocumentId(1));

        let loaded = store.get_document(doc.id).unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(
            store.get_document(DocumentId(2)),
            Err(StoreError::NotFound(DocumentId(2)))
        );
    }

    #[test]
    fn test_put_document_and_list() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.put_document(DocumentId(5), "Five", "{}").unwrap();
        store.put_document(DocumentId(2), "Two", "{}").unwrap();
        let next = store.create_document("Six", "{}").unwrap();
        assert_eq!(next.id, DocumentId(6));

        let ids: Vec<DocumentId> = store
            .list_documents()
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![DocumentId(2), DocumentId(5), DocumentId(6)]);
    }

    #[test]
    fn test_update_document() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let doc = store.create_document("Old", "{}").unwrap();

        let updated = store
            .update_document(doc.id, "New", r#"{"ops":[{"insert":"x"}]}"#)
            .unwrap();
        assert_eq!(updated.title, "New");
        assert_eq!(updated.created_at, doc.created_at);
        assert_eq!(store.get_document(doc.id).unwrap(), updated);
        assert!(store.update_document(DocumentId(40), "t", "{}").is_err());
    }

    #[test]
    fn test_append_changes_in_order() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let doc = store.create_document("Log", "{}").unwrap();

        let deltas = [
            json!({"ops":[{"insert":"a"}]}),
            json!({"ops":[{"retain":1},{"insert":"b"}]}),
            json!({"ops":[{"delete":1}]}),
        ];
        for delta in &deltas {
            store.append(doc.id, delta).unwrap();
        }

        let changes = store.changes(doc.id).unwrap();
        assert_eq!(changes.len(), 3);
        for (change, delta) in changes.iter().zip(&deltas) {
            assert_eq!(&change.delta, delta);
            assert_eq!(change.document_id, doc.id);
        }
        assert!(changes.windows(2).all(|w| w[0].id < w[1].id));
        assert!(changes.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_changes_are_scoped_to_document() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = store.create_document("A", "{}").unwrap();
        let b = store.create_document("B", "{}").unwrap();

        store.append(a.id, &json!(1)).unwrap();
        store.append(b.id, &json!(2)).unwrap();
        store.append(a.id, &json!(3)).unwrap();

        assert_eq!(store.change_count(a.id).unwrap(), 2);
        assert_eq!(store.change_count(b.id).unwrap(), 1);
        assert_eq!(store.changes(b.id).unwrap()[0].delta, json!(2));
    }

    #[test]
    fn test_append_requires_existing_document() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert_eq!(
            store.append(DocumentId(3), &json!({})),
            Err(StoreError::NotFound(DocumentId(3)))
        );
        assert_eq!(store.change_count(DocumentId(3)).unwrap(), 0);
    }

    #[test]
    fn test_sequences_survive_reopen() {
        let dir = tempdir().unwrap();
        let last_change = {
            let store = open(dir.path());
            let doc = store.create_document("Persisted", r#"{"ops":[]}"#).unwrap();
            store.append(doc.id, &json!({"ops":[{"insert":"a"}]})).unwrap();
            let change = store.append(doc.id, &json!({"ops":[{"insert":"b"}]})).unwrap();
            store.sync().unwrap();
            change.id
        };

        let store = open(dir.path());
        assert_eq!(store.change_count(DocumentId(1)).unwrap(), 2);
        let next = store.append(DocumentId(1), &json!({})).unwrap();
        assert_eq!(next.id, last_change + 1);
        assert_eq!(store.create_document("Second", "{}").unwrap().id, DocumentId(2));
    }

    #[test]
    fn test_load_snapshot_with_bad_content() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put_document(DocumentId(5), "Roadmap", "{not json").unwrap();

        let snapshot = store.load_snapshot(DocumentId(5)).unwrap();
        assert_eq!(snapshot.title, "Roadmap");
        assert!(snapshot.content.is_none());
    }

    #[test]
    fn test_change_key_layout() {
        let key = change_key(DocumentId(1), 2);
        assert_eq!(&key[..8], &1u64.to_be_bytes());
        assert_eq!(&key[8..], &2u64.to_be_bytes());
        assert_eq!(read_u64(&key[8..]), Some(2));
        assert_eq!(read_u64(&[1, 2, 3]), None);
    }
}
