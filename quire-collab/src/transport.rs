//! Write half of a client connection.
//!
//! A `Transport` is what the registry stores and what the dispatcher writes
//! to. Each implementation serializes its own writes, so the dispatcher and a
//! session never interleave frames on one connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

/// Failure to hand a frame to one subscriber.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection already closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
}

/// Outbound side of one client connection.
pub trait Transport: Send + Sync {
    /// Write one text frame.
    fn send(&self, frame: Utf8Bytes) -> BoxFuture<'_, Result<(), DeliveryError>>;

    /// Release the connection. Only the first call has an effect.
    fn close(&self) -> BoxFuture<'_, ()>;

    fn is_closed(&self) -> bool;

    /// Resolves once `close` has been called, by whichever side.
    fn released(&self) -> BoxFuture<'static, ()>;
}

/// Close flag that can also be awaited.
struct ReleaseSignal(watch::Sender<bool>);

impl ReleaseSignal {
    fn new() -> Self {
        Self(watch::Sender::new(false))
    }

    /// Returns `true` for the first caller only.
    fn release(&self) -> bool {
        !self.0.send_replace(true)
    }

    fn is_released(&self) -> bool {
        *self.0.borrow()
    }

    fn wait(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.0.subscribe();
        Box::pin(async move {
            // An error means the transport itself is gone.
            let _ = rx.wait_for(|released| *released).await;
        })
    }
}

/// WebSocket sink guarded by an async mutex.
pub struct WsTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    release: ReleaseSignal,
    /// Set while a write is in flight; stays set if the write was cancelled
    write_in_progress: AtomicBool,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            release: ReleaseSignal::new(),
            write_in_progress: AtomicBool::new(false),
        }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn send(&self, frame: Utf8Bytes) -> BoxFuture<'_, Result<(), DeliveryError>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(DeliveryError::Closed);
            }
            let mut sink = self.sink.lock().await;
            self.write_in_progress.store(true, Ordering::Release);
            let result = sink
                .send(Message::Text(frame))
                .await
                .map_err(|e| DeliveryError::Write(e.to_string()));
            self.write_in_progress.store(false, Ordering::Release);
            result
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.release.release() {
                return;
            }
            // A cancelled write means the peer stopped reading; flushing a
            // close frame to it would never finish.
            if self.write_in_progress.load(Ordering::Acquire) {
                log::debug!("Skipping close handshake after abandoned write");
                return;
            }
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.close().await {
                log::trace!("WebSocket close handshake failed: {e}");
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.release.is_released()
    }

    fn released(&self) -> BoxFuture<'static, ()> {
        self.release.wait()
    }
}

/// In-process transport backed by an unbounded channel.
///
/// Writes fail once the receiver is dropped, which is how a vanished peer
/// looks to the dispatcher.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Utf8Bytes>,
    release: ReleaseSignal,
}

impl ChannelTransport {
    /// Create a transport and the receiver that observes its frames.
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            tx,
            release: ReleaseSignal::new(),
        });
        (transport, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Utf8Bytes) -> BoxFuture<'_, Result<(), DeliveryError>> {
        let result = if self.is_closed() {
            Err(DeliveryError::Closed)
        } else {
            self.tx
                .send(frame)
                .map_err(|_| DeliveryError::Write("receiver dropped".to_string()))
        };
        Box::pin(future::ready(result))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.release.release();
        Box::pin(future::ready(()))
    }

    fn is_closed(&self) -> bool {
        self.release.is_released()
    }

    fn released(&self) -> BoxFuture<'static, ()> {
        self.release.wait()
    }
}
