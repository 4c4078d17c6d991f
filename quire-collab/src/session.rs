//! Server-side representative of one connected client.
//!
//! Lifecycle:
//! ```text
//! Connecting ──register + initial snapshot──► Active ──read failure / close──► Closed
//!      │                                                                   ▲
//!      └────────────── snapshot or initial write fails ────────────────────┘
//! ```
//!
//! While active the session is the only reader of its connection. Each
//! frame is parsed as a tagged message; `edit` is appended to the change log
//! and then enqueued for fan-out, whatever the append outcome. Anything else
//! is skipped. Teardown always unregisters and releases the connection,
//! exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::protocol::{DocumentId, InboundMessage, ProtocolError, ServerMessage};
use crate::registry::{Member, Registry, SessionId};
use crate::storage::{ChangeLog, StoreError};
use crate::transport::{DeliveryError, Transport};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Close frame or end of stream
    ClientClosed,
    /// Read failed at the transport level
    TransportError(String),
    /// The connection was closed elsewhere, after a failed delivery
    Released,
    /// The document's snapshot could not be loaded
    SnapshotUnavailable(StoreError),
    /// The initial message could not be encoded
    InitialEncodeFailed(ProtocolError),
    /// The initial message could not be written
    InitialSendFailed(DeliveryError),
}

/// Summary returned when a session finishes.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub edits: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub close_reason: CloseReason,
}

/// Counters aggregated over every session sharing a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub sessions_opened: u64,
    pub sessions_active: u64,
    pub edits_received: u64,
    pub changes_persisted: u64,
    pub persistence_failures: u64,
    pub messages_ignored: u64,
    pub messages_malformed: u64,
}

#[derive(Default)]
struct AtomicSessionStats {
    sessions_opened: AtomicU64,
    sessions_active: AtomicU64,
    edits_received: AtomicU64,
    changes_persisted: AtomicU64,
    persistence_failures: AtomicU64,
    messages_ignored: AtomicU64,
    messages_malformed: AtomicU64,
}

impl AtomicSessionStats {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            edits_received: self.edits_received.load(Ordering::Relaxed),
            changes_persisted: self.changes_persisted.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            messages_ignored: self.messages_ignored.load(Ordering::Relaxed),
            messages_malformed: self.messages_malformed.load(Ordering::Relaxed),
        }
    }
}

/// Everything a session shares with its peers.
#[derive(Clone)]
pub struct SessionContext {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    changelog: Arc<dyn ChangeLog>,
    stats: Arc<AtomicSessionStats>,
}

impl SessionContext {
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Dispatcher,
        changelog: Arc<dyn ChangeLog>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            changelog,
            stats: Arc::new(AtomicSessionStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }
}

/// One client tied to one document.
pub struct Session {
    id: SessionId,
    document_id: DocumentId,
    transport: Arc<dyn Transport>,
    context: SessionContext,
    state: SessionState,
    registered: bool,
    edits: u64,
    ignored: u64,
    malformed: u64,
}

impl Session {
    /// A session in `Connecting` state for an already-parsed document id.
    pub fn new(
        document_id: DocumentId,
        transport: Arc<dyn Transport>,
        context: SessionContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            transport,
            context,
            state: SessionState::Connecting,
            registered: false,
            edits: 0,
            ignored: 0,
            malformed: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion over its inbound frame stream.
    pub async fn run<S>(mut self, mut inbound: S) -> SessionReport
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let close_reason = match self.activate().await {
            Ok(()) => self.read_loop(&mut inbound).await,
            Err(reason) => reason,
        };
        self.teardown(&close_reason).await;

        SessionReport {
            session_id: self.id,
            document_id: self.document_id,
            edits: self.edits,
            ignored: self.ignored,
            malformed: self.malformed,
            close_reason,
        }
    }

    /// Register, then send the document's current state.
    async fn activate(&mut self) -> Result<(), CloseReason> {
        let member = Member::new(self.id, self.transport.clone());
        self.context.registry.register(self.document_id, member);
        self.registered = true;
        self.context.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.context.stats.sessions_active.fetch_add(1, Ordering::Relaxed);

        let snapshot = self
            .context
            .changelog
            .load_snapshot(self.document_id)
            .map_err(|e| {
                log::error!("Error loading doc {} for session {}: {e}", self.document_id, self.id);
                CloseReason::SnapshotUnavailable(e)
            })?;

        let initial = ServerMessage::initial(snapshot.title, snapshot.content)
            .encode()
            .map_err(CloseReason::InitialEncodeFailed)?;
        self.transport
            .send(Utf8Bytes::from(initial))
            .await
            .map_err(|e| {
                log::warn!("Error sending initial content to session {}: {e}", self.id);
                CloseReason::InitialSendFailed(e)
            })?;

        self.state = SessionState::Active;
        log::info!("Session {} active on doc {}", self.id, self.document_id);
        Ok(())
    }

    async fn read_loop<S>(&mut self, inbound: &mut S) -> CloseReason
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let mut released = self.transport.released();
        loop {
            let next = tokio::select! {
                next = inbound.next() => next,
                _ = &mut released => return CloseReason::Released,
            };
            match next {
                Some(Ok(Message::Text(frame))) => self.handle_frame(frame),
                Some(Ok(Message::Binary(bytes))) => match Utf8Bytes::try_from(bytes) {
                    Ok(frame) => self.handle_frame(frame),
                    Err(_) => self.skip_malformed(&ProtocolError::NotUtf8),
                },
                Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                // Ping/pong replies are handled by the WebSocket layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Read error on session {}: {e}", self.id);
                    return CloseReason::TransportError(e.to_string());
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Utf8Bytes) {
        match InboundMessage::parse(frame.as_str()) {
            Ok(InboundMessage::Edit { delta }) => {
                self.edits += 1;
                let stats = &self.context.stats;
                stats.edits_received.fetch_add(1, Ordering::Relaxed);

                // A failed append does not hold back the broadcast.
                match self.context.changelog.append(self.document_id, &delta) {
                    Ok(change) => {
                        stats.changes_persisted.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Persisted change {} for doc {}", change.id, self.document_id);
                    }
                    Err(e) => {
                        stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
                        log::error!("Error saving change for doc {}: {e}", self.document_id);
                    }
                }

                if let Err(e) = self.context.dispatcher.enqueue(self.document_id, frame) {
                    log::error!("Edit from session {} not broadcast: {e}", self.id);
                }
            }
            Ok(InboundMessage::Other { kind }) => {
                self.ignored += 1;
                self.context
                    .stats
                    .messages_ignored
                    .fetch_add(1, Ordering::Relaxed);
                log::debug!("Ignoring `{kind}` message from session {}", self.id);
            }
            Err(e) => self.skip_malformed(&e),
        }
    }

    fn skip_malformed(&mut self, error: &ProtocolError) {
        self.malformed += 1;
        self.context
            .stats
            .messages_malformed
            .fetch_add(1, Ordering::Relaxed);
        log::debug!("Skipping frame from session {}: {error}", self.id);
    }

    async fn teardown(&mut self, reason: &CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.registered {
            self.context
                .registry
                .unregister(self.document_id, &self.id);
            self.context
                .stats
                .sessions_active
                .fetch_sub(1, Ordering::Relaxed);
            self.registered = false;
        }
        self.transport.close().await;
        self.state = SessionState::Closed;
        log::info!(
            "Session {} left doc {} ({reason:?})",
            self.id,
            self.document_id
        );
    }
}
