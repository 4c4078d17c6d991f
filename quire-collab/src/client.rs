//! WebSocket client for a single document.
//!
//! Speaks the same JSON frames as a browser editor: it receives the
//! `initial` message on connect, sends `edit` messages, and reads every
//! broadcast for the document (its own edits included).

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;
use crate::protocol::{DocumentId, InboundMessage, ProtocolError, ServerMessage};
use crate::storage::DocumentSnapshot;

/// A connected client bound to one document.
pub struct DocumentClient {
    document_id: DocumentId,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl DocumentClient {
    /// Connect to `endpoint` (e.g. `ws://127.0.0.1:8081/ws`) and wait for the
    /// document's initial state.
    pub async fn connect(
        endpoint: &str,
        document_id: DocumentId,
    ) -> Result<(Self, DocumentSnapshot), ClientError> {
        let url = document_url(endpoint, "doc", document_id);
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let mut client = Self { document_id, ws };

        let first = client.next_message().await?.ok_or(ClientError::Closed)?;
        match serde_json::from_value::<ServerMessage>(first.clone()) {
            Ok(ServerMessage::Initial { title, content }) => {
                log::debug!("Joined doc {document_id} ({title})");
                Ok((client, DocumentSnapshot { title, content }))
            }
            Err(_) => Err(ClientError::UnexpectedMessage(first.to_string())),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Send an `edit` message carrying `delta`.
    pub async fn send_edit(&mut self, delta: &Value) -> Result<(), ClientError> {
        let frame = InboundMessage::edit_frame(delta)?;
        self.send_raw(&frame).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.ws.send(Message::text(text)).await?;
        Ok(())
    }

    /// Next JSON message from the server, or `None` once the connection is
    /// closed. Control frames are skipped.
    pub async fn next_message(&mut self) -> Result<Option<Value>, ClientError> {
        while let Some(message) = self.ws.next().await {
            match message? {
                Message::Text(text) => {
                    let value = serde_json::from_str(text.as_str())
                        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                    return Ok(Some(value));
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Delta of the next broadcast edit.
    pub async fn next_edit(&mut self) -> Result<Value, ClientError> {
        let message = self.next_message().await?.ok_or(ClientError::Closed)?;
        match message.get("type").and_then(Value::as_str) {
            Some("edit") => Ok(message.get("delta").cloned().unwrap_or(Value::Null)),
            _ => Err(ClientError::UnexpectedMessage(message.to_string())),
        }
    }

    /// Send a close frame.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

fn document_url(endpoint: &str, param: &str, document_id: DocumentId) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{separator}{param}={document_id}")
}
