//! JSON wire protocol for the real-time document channel.
//!
//! Wire format (WebSocket text frames):
//! ```text
//! server → client   {"type":"initial","title":<string>,"content":<json|null>}
//! client → server   {"type":"edit","delta":<json>}
//! server → client   the client's edit frame, relayed verbatim
//! ```
//!
//! Any other `type` is accepted and ignored. Payloads (`delta`, `content`)
//! are opaque JSON values; nothing here looks inside them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded;

/// Tag of the only inbound message kind that triggers persistence and fan-out.
pub const EDIT_TYPE: &str = "edit";

/// Numeric identifier of a shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub u64);

impl DocumentId {
    /// Extract a document id from a raw query string such as `doc=5&x=1`.
    ///
    /// The query is form-decoded first, so `doc=%35` names document 5. When
    /// the parameter repeats, the first occurrence wins.
    pub fn from_query(query: Option<&str>, param: &str) -> Result<Self, ProtocolError> {
        let raw = form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .find(|(key, _)| *key == param)
            .map(|(_, value)| value)
            .ok_or_else(|| ProtocolError::MissingDocumentId(param.to_string()))?;
        raw.parse()
    }

    /// Big-endian key bytes, used for ordered storage keys.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl FromStr for DocumentId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(DocumentId)
            .map_err(|_| ProtocolError::InvalidDocumentId(s.to_string()))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DocumentId {
    fn from(id: u64) -> Self {
        DocumentId(id)
    }
}

/// Messages the server originates.
///
/// Edit broadcasts are not represented here: they are the client's own frames
/// relayed without re-encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Full document state, sent once when a session becomes active.
    Initial {
        title: String,
        /// `None` serializes as `null` when the stored content is not valid JSON.
        content: Option<Value>,
    },
}

impl ServerMessage {
    pub fn initial(title: impl Into<String>, content: Option<Value>) -> Self {
        ServerMessage::Initial {
            title: title.into(),
            content,
        }
    }

    /// Serialize to a text frame body.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// A parsed client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// `{"type":"edit","delta":...}`
    Edit { delta: Value },
    /// Well-formed message with any other tag; ignored by the session.
    Other { kind: String },
}

/// Envelope shared by every client message. Extra fields are tolerated.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<Value>,
}

impl InboundMessage {
    /// Parse a text frame as a tagged message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        if envelope.kind != EDIT_TYPE {
            return Ok(InboundMessage::Other {
                kind: envelope.kind,
            });
        }

        match envelope.delta {
            Some(delta) => Ok(InboundMessage::Edit { delta }),
            None => Err(ProtocolError::MissingDelta),
        }
    }

    /// Build the text frame a client sends for an edit.
    pub fn edit_frame(delta: &Value) -> Result<String, ProtocolError> {
        serde_json::to_string(&serde_json::json!({ "type": EDIT_TYPE, "delta": delta }))
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Edit { .. } => EDIT_TYPE,
            InboundMessage::Other { kind } => kind,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed message: {0}")]
    Deserialization(String),
    #[error("edit message has no delta")]
    MissingDelta,
    #[error("missing document id parameter `{0}`")]
    MissingDocumentId(String),
    #[error("invalid document id `{0}`")]
    InvalidDocumentId(String),
    #[error("frame is not valid UTF-8")]
    NotUtf8,
}
