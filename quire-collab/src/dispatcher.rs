//! Single-consumer fan-out of outbound messages.
//!
//! ```text
//! Session A ──┐                                   ┌──► member 1
//! Session B ──┼──► unbounded FIFO ──► DrainLoop ──┼──► member 2
//! Session C ──┘     (enqueue)        (one task)   └──► member N
//!                                        │
//!                                   Registry::snapshot_members(doc)
//! ```
//!
//! Exactly one task drains the queue, so deliveries across every document
//! follow enqueue order. Each message goes to every member of its document,
//! the sender included. A member whose write fails is unregistered and
//! closed; the remaining members still get the message.
//!
//! The drain loop awaits each write in turn: one slow connection delays
//! delivery for all documents unless `DispatcherConfig::delivery_timeout`
//! is set.
//!
//! Closing a dropped member happens in its own task, so a peer that has
//! stopped reading cannot hold up the drain loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::error::SyncError;
use crate::protocol::DocumentId;
use crate::registry::{Member, Registry};
use crate::transport::DeliveryError;

/// Dispatcher tuning.
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Upper bound on a single write. `None` waits indefinitely.
    pub delivery_timeout: Option<Duration>,
}

/// The unit moved from a producing session to a document's members.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub document_id: DocumentId,
    pub payload: Utf8Bytes,
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub messages_enqueued: u64,
    pub messages_dispatched: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
}

#[derive(Default)]
struct AtomicDispatchStats {
    messages_enqueued: AtomicU64,
    messages_dispatched: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
}

impl AtomicDispatchStats {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}

/// Producer handle. Cheap to clone; one per session.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Outbound>,
    stats: Arc<AtomicDispatchStats>,
}

impl Dispatcher {
    /// Create a producer handle and the drain loop that consumes it.
    pub fn channel(registry: Arc<Registry>, config: DispatcherConfig) -> (Self, DrainLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicDispatchStats::default());
        let drain = DrainLoop {
            rx,
            registry,
            config,
            stats: stats.clone(),
        };
        (Self { tx, stats }, drain)
    }

    /// Create a handle and run its drain loop on the current runtime.
    pub fn spawn(registry: Arc<Registry>, config: DispatcherConfig) -> (Self, JoinHandle<()>) {
        let (dispatcher, drain) = Self::channel(registry, config);
        let handle = tokio::spawn(drain.run());
        (dispatcher, handle)
    }

    /// Hand a message to the dispatch pipeline without waiting for delivery.
    pub fn enqueue(&self, document_id: DocumentId, payload: Utf8Bytes) -> Result<(), SyncError> {
        self.tx
            .send(Outbound {
                document_id,
                payload,
            })
            .map_err(|_| SyncError::DispatcherClosed)?;
        self.stats.messages_enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single consumer. Ends once every `Dispatcher` handle is dropped.
pub struct DrainLoop {
    rx: mpsc::UnboundedReceiver<Outbound>,
    registry: Arc<Registry>,
    config: DispatcherConfig,
    stats: Arc<AtomicDispatchStats>,
}

impl DrainLoop {
    pub async fn run(mut self) {
        log::debug!("Dispatcher drain loop started");
        while let Some(outbound) = self.rx.recv().await {
            self.deliver(outbound).await;
        }
        log::debug!("Dispatcher drain loop stopped (all producers gone)");
    }

    /// Fan one message out to the document's current members.
    ///
    /// Returns the number of successful deliveries.
    async fn deliver(&self, outbound: Outbound) -> usize {
        let Outbound {
            document_id,
            payload,
        } = outbound;
        let members = self.registry.snapshot_members(document_id);
        self.stats.messages_dispatched.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for member in members {
            match self.write(&member, payload.clone()).await {
                Ok(()) => {
                    delivered += 1;
                    self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!(
                        "Dropping session {} from doc {document_id}: {e}",
                        member.session_id
                    );
                    self.stats.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                    self.registry.unregister(document_id, &member.session_id);
                    self.release(member);
                }
            }
        }

        log::trace!("Delivered message for doc {document_id} to {delivered} sessions");
        delivered
    }

    /// Close a dropped member off the drain path.
    ///
    /// Closing can wait on the same peer that just failed, so it runs in its
    /// own task, bounded by the delivery timeout when one is set.
    fn release(&self, member: Member) {
        let limit = self.config.delivery_timeout;
        tokio::spawn(async move {
            let closing = member.transport.close();
            match limit {
                Some(limit) => {
                    if tokio::time::timeout(limit, closing).await.is_err() {
                        log::debug!("Gave up closing session {}", member.session_id);
                    }
                }
                None => closing.await,
            }
        });
    }

    async fn write(&self, member: &Member, payload: Utf8Bytes) -> Result<(), DeliveryError> {
        match self.config.delivery_timeout {
            Some(limit) => tokio::time::timeout(limit, member.transport.send(payload))
                .await
                .unwrap_or(Err(DeliveryError::TimedOut(limit))),
            None => member.transport.send(payload).await,
        }
    }
}
