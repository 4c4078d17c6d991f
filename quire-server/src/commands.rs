//! Command implementations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quire_collab::{
    ChangeLog, DispatcherConfig, DocumentId, DocumentStore, MemoryStore, ServerConfig,
    StoreConfig, SyncServer,
};
use serde_json::{json, Value};

use crate::args::{Command, SeedDocument};
use crate::error::{CliError, CliResult};

pub async fn run_command(command: Command, data_dir: &Path) -> CliResult<()> {
    match command {
        Command::Serve {
            bind,
            ws_path,
            in_memory,
            seed_documents,
            delivery_timeout_ms,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                ws_path,
                dispatcher: DispatcherConfig {
                    delivery_timeout: delivery_timeout_ms.map(Duration::from_millis),
                },
                ..ServerConfig::default()
            };
            let changelog: Arc<dyn ChangeLog> = if in_memory {
                log::warn!("Running in memory: documents and changes are lost on exit");
                Arc::new(seeded_memory_store(&seed_documents))
            } else {
                Arc::new(open_store(data_dir)?)
            };
            serve(config, changelog).await
        }
        Command::CreateDocument { title, content } => {
            let store = open_store(data_dir)?;
            create_document(&store, &title, &content)
        }
        Command::ListDocuments => {
            let store = open_store(data_dir)?;
            list_documents(&store)
        }
        Command::History { doc } => {
            let store = open_store(data_dir)?;
            history(&store, DocumentId(doc))
        }
    }
}

fn open_store(data_dir: &Path) -> CliResult<DocumentStore> {
    let config = StoreConfig {
        path: data_dir.to_path_buf(),
        ..StoreConfig::default()
    };
    Ok(DocumentStore::open(config)?)
}

/// In-memory store holding the seed documents, ids from 1.
fn seeded_memory_store(seeds: &[SeedDocument]) -> MemoryStore {
    let store = MemoryStore::new();
    for seed in seeds {
        let document = store.create_document(&seed.title, &seed.content);
        log::info!("Seeded doc {} ({})", document.id, document.title);
    }
    store
}

async fn serve(config: ServerConfig, changelog: Arc<dyn ChangeLog>) -> CliResult<()> {
    let server = SyncServer::new(config, changelog);
    let listener = server.bind().await?;
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = server.stats();
    log::info!(
        "Served {} connections, {} edits, {} persistence failures",
        stats.total_connections,
        stats.sessions.edits_received,
        stats.sessions.persistence_failures
    );
    Ok(())
}

pub fn create_document(store: &DocumentStore, title: &str, content: &str) -> CliResult<()> {
    let parsed: Value =
        serde_json::from_str(content).map_err(|e| CliError::InvalidContent(e.to_string()))?;
    let document = store.create_document(title, &parsed.to_string())?;
    store.sync()?;
    println!("{}", document.id);
    Ok(())
}

pub fn list_documents(store: &DocumentStore) -> CliResult<()> {
    for document in store.list_documents()? {
        let line = json!({
            "id": document.id,
            "title": document.title,
            "updated_at": document.updated_at,
        });
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

pub fn history(store: &DocumentStore, document_id: DocumentId) -> CliResult<()> {
    store.get_document(document_id)?;
    for change in store.changes(document_id)? {
        println!("{}", serde_json::to_string(&change)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Cli;
    use clap::Parser;
    use quire_collab::{DocumentClient, StoreError};
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn store(dir: &Path) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(dir)).unwrap()
    }

    #[test]
    fn test_create_document_rejects_invalid_json() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let result = create_document(&store, "Bad", "{ nope");
        assert!(matches!(result, Err(CliError::InvalidContent(_))));
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_create_document_stores_normalized_content() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        create_document(&store, "Notes", r#"{ "ops" : [] }"#).unwrap();

        let documents = store.list_documents().unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].title, "Notes");
        assert_eq!(documents[0].content, r#"{"ops":[]}"#);
    }

    #[tokio::test]
    async fn test_seeded_in_memory_server_sends_initial() {
        let cli = Cli::try_parse_from([
            "quire-server",
            "serve",
            "--in-memory",
            "--seed-document",
            r#"Welcome={"ops":[{"insert":"hi"}]}"#,
        ])
        .unwrap();
        let Command::Serve { seed_documents, .. } = cli.command else {
            panic!("expected serve");
        };
        let store = Arc::new(seeded_memory_store(&seed_documents));

        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, store);
        let listener = server.bind().await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        tokio::spawn(async move { server.serve(listener, std::future::pending()).await });

        let (_client, initial) = timeout(
            Duration::from_secs(2),
            DocumentClient::connect(&endpoint, DocumentId(1)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(initial.title, "Welcome");
        assert_eq!(initial.content, Some(json!({"ops":[{"insert":"hi"}]})));
    }

    #[test]
    fn test_history_of_unknown_document() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let result = history(&store, DocumentId(9));
        assert!(matches!(
            result,
            Err(CliError::Store(StoreError::NotFound(DocumentId(9))))
        ));
    }
}
