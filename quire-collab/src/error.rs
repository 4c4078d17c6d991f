//! Top-level error type for the synchronization core.
//!
//! Per-frame and per-subscriber failures never surface here: malformed
//! messages ([`ProtocolError`]), persistence failures ([`StoreError`]) and
//! delivery failures ([`DeliveryError`]) are recovered where they happen,
//! counted, and reported through
//! [`SessionReport::close_reason`](crate::session::SessionReport) when they
//! end a session.
//!
//! [`StoreError`]: crate::storage::StoreError
//! [`DeliveryError`]: crate::transport::DeliveryError

use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

/// Result alias used across the crate.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Bad or missing document id, or a failed WebSocket handshake.
    #[error("connection setup failed: {0}")]
    ConnectionSetup(String),

    #[error("dispatcher is closed")]
    DispatcherClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`DocumentClient`](crate::client::DocumentClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server sent something other than the expected message.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("connection closed by server")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        fn bind() -> SyncResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken"))?;
            Ok(())
        }
        let err = bind().unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
        assert_eq!(err.to_string(), "I/O error: taken");
    }

    #[test]
    fn test_client_error_wraps_protocol_error() {
        let err: ClientError = ProtocolError::MissingDelta.into();
        assert_eq!(err.to_string(), "edit message has no delta");
        assert_eq!(ClientError::Closed.to_string(), "connection closed by server");
    }
}
