//! Command-line argument definitions.
//!
//! Commands:
//! - quire-server serve [--bind <addr>] [--data-dir <path> | --in-memory [--seed-document <title>=<json>]...]
//! - quire-server create-document --title <title> [--content <json>]
//! - quire-server list-documents
//! - quire-server history --doc <id>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Real-time document synchronization server
#[derive(Parser, Debug)]
#[command(name = "quire-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// RocksDB data directory
    #[arg(long, global = true, env = "QUIRE_DATA_DIR", default_value = "quire_data")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept WebSocket connections and relay edits
    Serve {
        /// Address to listen on
        #[arg(long, env = "QUIRE_BIND", default_value = "127.0.0.1:8081")]
        bind: String,

        /// Path accepted for WebSocket upgrades
        #[arg(long, env = "QUIRE_WS_PATH", default_value = "/ws")]
        ws_path: String,

        /// Keep documents and changes in memory only
        #[arg(long, env = "QUIRE_IN_MEMORY")]
        in_memory: bool,

        /// Document to create in the in-memory store, as `<title>=<json>`.
        /// Repeatable; ids are assigned from 1 in order.
        #[arg(long = "seed-document", requires = "in_memory", value_parser = parse_seed)]
        seed_documents: Vec<SeedDocument>,

        /// Drop a subscriber whose write takes longer than this
        #[arg(long, env = "QUIRE_DELIVERY_TIMEOUT_MS")]
        delivery_timeout_ms: Option<u64>,
    },

    /// Create a document and print its id
    CreateDocument {
        #[arg(long, env = "QUIRE_TITLE")]
        title: String,

        /// Initial content as JSON text
        #[arg(long, env = "QUIRE_CONTENT", default_value = "{}")]
        content: String,
    },

    /// Print every stored document
    ListDocuments,

    /// Print the change records of a document
    History {
        #[arg(long, env = "QUIRE_DOC")]
        doc: u64,
    },
}

/// A document handed to an in-memory server at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedDocument {
    pub title: String,
    /// Normalized JSON text
    pub content: String,
}

fn parse_seed(raw: &str) -> Result<SeedDocument, String> {
    let (title, content) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <title>=<json>, got `{raw}`"))?;
    let content: serde_json::Value =
        serde_json::from_str(content).map_err(|e| format!("content is not valid JSON: {e}"))?;
    Ok(SeedDocument {
        title: title.to_string(),
        content: content.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed() {
        assert_eq!(
            parse_seed(r#"Notes={ "ops": [] }"#),
            Ok(SeedDocument {
                title: "Notes".into(),
                content: r#"{"ops":[]}"#.into(),
            })
        );
        assert!(parse_seed("no separator").is_err());
        assert!(parse_seed("Bad={oops").is_err());
    }

    #[test]
    fn test_seed_requires_in_memory() {
        let result = Cli::try_parse_from(["quire-server", "serve", "--seed-document", "A={}"]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from([
            "quire-server",
            "serve",
            "--in-memory",
            "--seed-document",
            "A={}",
            "--seed-document",
            r#"B={"ops":[]}"#,
        ])
        .unwrap();
        match cli.command {
            Command::Serve { seed_documents, .. } => assert_eq!(seed_documents.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
