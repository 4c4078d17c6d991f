//! WebSocket sync server with per-document fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── ChangeLog (RocksDB / memory)
//!            ├── Session ── append ──┤
//! Client B ──┘      │                └── load_snapshot
//!                   │ enqueue
//!                   ▼
//!              Dispatcher (one FIFO, one drain task)
//!                   │ snapshot_members(doc)
//!                   ▼
//!              Registry ──► every member of the document, sender included
//! ```
//!
//! The document id comes from the upgrade request (`/ws?doc=5`). Requests for
//! another path are answered with 404, a missing or non-numeric id with 400,
//! and no session is created for either.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::dispatcher::{DispatchStats, Dispatcher, DispatcherConfig};
use crate::error::{SyncError, SyncResult};
use crate::protocol::DocumentId;
use crate::registry::Registry;
use crate::session::{Session, SessionContext, SessionReport, SessionStats};
use crate::storage::ChangeLog;
use crate::transport::WsTransport;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path accepted for WebSocket upgrades
    pub ws_path: String,
    /// Query parameter carrying the document id
    pub document_param: String,
    pub dispatcher: DispatcherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8081".to_string(),
            ws_path: "/ws".to_string(),
            document_param: "doc".to_string(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub rejected_handshakes: u64,
    pub active_documents: usize,
    pub sessions: SessionStats,
    pub dispatch: DispatchStats,
}

#[derive(Default)]
struct ConnectionCounters {
    total: AtomicU64,
    rejected: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    context: SessionContext,
    counters: Arc<ConnectionCounters>,
}

impl SyncServer {
    /// Create a server and start its dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig, changelog: Arc<dyn ChangeLog>) -> Self {
        let registry = Arc::new(Registry::new());
        let (dispatcher, _drain) = Dispatcher::spawn(registry.clone(), config.dispatcher.clone());

        Self {
            config: Arc::new(config),
            context: SessionContext::new(registry, dispatcher, changelog),
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.context.registry()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            rejected_handshakes: self.counters.rejected.load(Ordering::Relaxed),
            active_documents: self.context.registry().document_count(),
            sessions: self.context.stats(),
            dispatch: self.context.dispatcher().stats(),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> SyncResult<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and accept connections until the process ends.
    pub async fn run(&self) -> SyncResult<()> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> SyncResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Sync server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Accept failed: {e}");
                        continue;
                    }
                },
            };
            log::debug!("New TCP connection from {addr}");
            self.counters.total.fetch_add(1, Ordering::Relaxed);

            let config = self.config.clone();
            let context = self.context.clone();
            let counters = self.counters.clone();

            tokio::spawn(async move {
                match Self::handle_connection(stream, addr, config, context, counters).await {
                    Ok(report) => log::debug!(
                        "Connection from {addr} finished: {} edits, {:?}",
                        report.edits,
                        report.close_reason
                    ),
                    Err(e) => log::warn!("Connection error from {addr}: {e}"),
                }
            });
        }
    }

    /// Upgrade one TCP connection and run its session.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        context: SessionContext,
        counters: Arc<ConnectionCounters>,
    ) -> SyncResult<SessionReport> {
        let mut document_id = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let uri = request.uri();
            if uri.path() != config.ws_path {
                return Err(reject(StatusCode::NOT_FOUND, "not found".to_string()));
            }
            match DocumentId::from_query(uri.query(), &config.document_param) {
                Ok(id) => {
                    document_id = Some(id);
                    Ok(response)
                }
                Err(e) => Err(reject(StatusCode::BAD_REQUEST, e.to_string())),
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::info!("Rejected connection from {addr}: {e}");
                return Err(SyncError::ConnectionSetup(e.to_string()));
            }
        };
        let document_id = document_id
            .ok_or_else(|| SyncError::ConnectionSetup("document id not resolved".to_string()))?;

        log::info!("WebSocket connection from {addr} for doc {document_id}");
        let (sink, inbound) = ws_stream.split();
        let session = Session::new(document_id, Arc::new(WsTransport::new(sink)), context);
        Ok(session.run(inbound).await)
    }
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}
