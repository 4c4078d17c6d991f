//! # quire-collab: real-time document synchronization core
//!
//! Clients connect over WebSocket to a document, receive its current state,
//! and exchange opaque JSON edits. Every edit is persisted as an append-only
//! change and relayed to every client on the same document, sender included.
//! The server does no merging: edits are forwarded as sent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON)   ┌────────────┐  append   ┌───────────┐
//! │DocumentClient│ ◄──────────────────► │  Session   │ ────────► │ ChangeLog │
//! └──────────────┘                      └─────┬──────┘           └───────────┘
//!                                             │ enqueue
//!                                             ▼
//!                                      ┌────────────┐  members  ┌───────────┐
//!                                      │ Dispatcher │ ────────► │ Registry  │
//!                                      └────────────┘           └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and document ids
//! - [`registry`]: document → connected sessions
//! - [`dispatcher`]: single FIFO fan-out loop
//! - [`session`]: per-connection state machine
//! - [`transport`]: write half of a connection
//! - [`storage`]: change log contract, RocksDB and in-memory stores
//! - [`server`]: WebSocket accept loop
//! - [`client`]: WebSocket client for one document

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use client::DocumentClient;
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherConfig, DrainLoop, Outbound};
pub use error::{ClientError, SyncError, SyncResult};
pub use protocol::{DocumentId, InboundMessage, ProtocolError, ServerMessage};
pub use registry::{Member, Registry, SessionId};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{CloseReason, Session, SessionContext, SessionReport, SessionState, SessionStats};
pub use storage::{
    Change, ChangeLog, Document, DocumentSnapshot, DocumentStore, MemoryStore, StoreConfig,
    StoreError,
};
pub use transport::{ChannelTransport, DeliveryError, Transport, WsTransport};
