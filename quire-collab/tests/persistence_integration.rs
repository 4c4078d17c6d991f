//! RocksDB-backed server tests.
//!
//! Verifies:
//! - Edits made through the server land in the change log on disk
//! - Changes and documents survive a store reopen
//! - Changes stay isolated per document

use quire_collab::client::DocumentClient;
use quire_collab::protocol::DocumentId;
use quire_collab::server::{ServerConfig, SyncServer};
use quire_collab::storage::{ChangeLog, DocumentStore, StoreConfig};

use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(2);

async fn serve(store: Arc<DocumentStore>) -> (String, oneshot::Sender<()>) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config, store);
    let listener = server.bind().await.unwrap();
    let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });
    (endpoint, stop)
}

#[tokio::test]
async fn test_edits_persist_through_server() {
    let dir = tempdir().unwrap();
    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let doc = store
        .create_document("Notes", r#"{"ops":[{"insert":"start"}]}"#)
        .unwrap();
    let (endpoint, _stop) = serve(store.clone()).await;

    let (mut client, initial) = timeout(WAIT, DocumentClient::connect(&endpoint, doc.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(initial.title, "Notes");
    assert_eq!(initial.content, Some(json!({"ops":[{"insert":"start"}]})));

    client.send_edit(&json!({"ops":[{"insert":"a"}]})).await.unwrap();
    client.send_edit(&json!({"ops":[{"insert":"b"}]})).await.unwrap();
    timeout(WAIT, client.next_edit()).await.unwrap().unwrap();
    timeout(WAIT, client.next_edit()).await.unwrap().unwrap();

    let changes = store.changes(doc.id).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].delta, json!({"ops":[{"insert":"a"}]}));
    assert_eq!(changes[1].delta, json!({"ops":[{"insert":"b"}]}));
    assert!(changes[0].id < changes[1].id);
    assert!(changes[0].created_at <= changes[1].created_at);
}

#[test]
fn test_changes_survive_reopen() {
    let dir = tempdir().unwrap();
    let doc_id;
    {
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        doc_id = store.create_document("Durable", "{}").unwrap().id;
        store.append(doc_id, &json!({"ops":[{"insert":"1"}]})).unwrap();
        store.append(doc_id, &json!({"ops":[{"insert":"2"}]})).unwrap();
        store.sync().unwrap();
    }

    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    assert_eq!(store.change_count(doc_id).unwrap(), 2);
    let next = store.append(doc_id, &json!({"ops":[{"insert":"3"}]})).unwrap();
    assert_eq!(next.id, 3);
    assert_eq!(store.load_snapshot(doc_id).unwrap().title, "Durable");
    assert_eq!(store.create_document("Second", "{}").unwrap().id, DocumentId(doc_id.0 + 1));
}

#[test]
fn test_changes_isolated_per_document() {
    let dir = tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let a = store.create_document("A", "{}").unwrap();
    let b = store.create_document("B", "{}").unwrap();

    for i in 0..5 {
        store.append(a.id, &json!({ "a": i })).unwrap();
    }
    store.append(b.id, &json!({ "b": 0 })).unwrap();

    assert_eq!(store.change_count(a.id).unwrap(), 5);
    assert_eq!(store.change_count(b.id).unwrap(), 1);
    assert_eq!(store.changes(b.id).unwrap()[0].delta, json!({ "b": 0 }));
}
