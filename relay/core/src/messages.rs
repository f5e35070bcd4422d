//! Relay Wire Messages
//!
//! The JSON schema spoken over the client transport, and the domain types it
//! decodes into.
//!
//! # Inbound
//!
//! ```json
//! {
//!   "model_name": "meta-llama/Llama-3.2-1B-Instruct",
//!   "conservation": [{"role": "user", "content": "Hi"}],
//!   "max_token": 200,
//!   "stream_mode": "word",
//!   "action": "cancel"
//! }
//! ```
//!
//! `conservation` is the historical wire name of the message list and is kept
//! for client compatibility. A frame whose `action` is `"cancel"` is a cancel
//! marker regardless of its other fields.
//!
//! # Outbound
//!
//! Every unit is `{"text": ..., "status": ...}`. `done` and `cancelled` carry a
//! null text; an `error` unit carries its description in an extra `error`
//! field. A [`FatalMessage`] (`{"error": ...}`) is only sent right before the
//! server closes the connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One message of the conversation forwarded upstream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role (`system`, `user`, `assistant`), passed through verbatim
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a message with the given role
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Create a `user` message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// How upstream fragments are regrouped before being sent to the client
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkMode {
    /// Forward every non-empty fragment as-is
    #[default]
    #[serde(rename = "token")]
    Token,
    /// Fixed-size character batches
    #[serde(rename = "digit", alias = "fixed_chars")]
    FixedChars,
    /// Fixed-size word batches
    #[serde(rename = "word", alias = "fixed_words")]
    FixedWords,
}

impl ChunkMode {
    /// Parse the wire name of a chunk mode
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "token" => Some(Self::Token),
            "digit" | "fixed_chars" => Some(Self::FixedChars),
            "word" | "fixed_words" => Some(Self::FixedWords),
            _ => None,
        }
    }

    /// The wire name of this chunk mode
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::FixedChars => "digit",
            Self::FixedWords => "word",
        }
    }
}

impl std::fmt::Display for ChunkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Raw inbound frame as it appears on the wire
///
/// Every field is optional so that a bare `{"action": "cancel"}` decodes.
/// Unknown fields are ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Requested upstream model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Conversation to complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conservation: Option<Vec<ChatMessage>>,
    /// Upper bound on generated tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_token: Option<u32>,
    /// Chunking policy wire name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<String>,
    /// Control action (`"cancel"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// A validated-shape request; one envelope opens at most one upstream stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Requested upstream model (not yet checked against the allow-list)
    pub model_id: String,
    /// Conversation to complete, in order
    pub messages: Vec<ChatMessage>,
    /// Token limit; the configured default applies when unset
    pub max_tokens: Option<u32>,
    /// Chunking policy for this request
    pub chunk_mode: ChunkMode,
}

impl RequestEnvelope {
    /// Create an envelope in token mode without a token limit
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            max_tokens: None,
            chunk_mode: ChunkMode::Token,
        }
    }

    /// Set the token limit
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A decoded control message from the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Cancel the in-flight request, if any
    Cancel,
    /// Start a new request
    Request(RequestEnvelope),
}

/// Errors decoding an inbound frame
///
/// All of these are recoverable: the session reports them as an `error` unit
/// and keeps waiting for the next envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON for the inbound schema
    #[error("Invalid request payload: {0}")]
    InvalidJson(String),
    /// A field required for a request is missing
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
    /// `stream_mode` names no known chunk mode
    #[error("Unknown stream_mode '{0}', expected one of: token, digit, word")]
    UnknownStreamMode(String),
    /// `action` names no known action
    #[error("Unknown action '{0}'")]
    UnknownAction(String),
    /// `max_token` must be positive
    #[error("max_token must be a positive integer")]
    InvalidMaxTokens,
}

impl InboundMessage {
    /// Interpret this frame as a control message
    pub fn into_control(self) -> Result<ControlMessage, ProtocolError> {
        match self.action.as_deref() {
            Some("cancel") => return Ok(ControlMessage::Cancel),
            Some(other) => return Err(ProtocolError::UnknownAction(other.to_string())),
            None => {}
        }

        let model_id = self
            .model_name
            .ok_or(ProtocolError::MissingField("model_name"))?;
        let messages = self
            .conservation
            .ok_or(ProtocolError::MissingField("conservation"))?;

        let chunk_mode = match self.stream_mode {
            None => ChunkMode::Token,
            Some(name) => {
                ChunkMode::from_wire(&name).ok_or(ProtocolError::UnknownStreamMode(name))?
            }
        };

        if self.max_token == Some(0) {
            return Err(ProtocolError::InvalidMaxTokens);
        }

        Ok(ControlMessage::Request(RequestEnvelope {
            model_id,
            messages,
            max_tokens: self.max_token,
            chunk_mode,
        }))
    }
}

/// Decode a raw text frame into a control message
pub fn decode_inbound(frame: &str) -> Result<ControlMessage, ProtocolError> {
    let inbound: InboundMessage =
        serde_json::from_str(frame).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    inbound.into_control()
}

/// Lifecycle status of an output unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// More units follow
    Continue,
    /// Upstream finished normally
    Done,
    /// The client cancelled the request
    Cancelled,
    /// The request failed
    Error,
}

impl UnitStatus {
    /// Whether this status ends a request
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// One unit emitted to the client, in strict production order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputUnit {
    /// Unit text (the failure description for `error` units)
    pub text: String,
    /// Lifecycle status
    pub status: UnitStatus,
}

impl OutputUnit {
    /// A content unit
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: UnitStatus::Continue,
        }
    }

    /// The terminal unit for a normally finished request
    #[must_use]
    pub fn done() -> Self {
        Self {
            text: String::new(),
            status: UnitStatus::Done,
        }
    }

    /// The terminal unit for a cancelled request
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            text: String::new(),
            status: UnitStatus::Cancelled,
        }
    }

    /// The terminal unit for a failed request
    pub fn error(description: impl Into<String>) -> Self {
        Self {
            text: description.into(),
            status: UnitStatus::Error,
        }
    }

    /// Whether this unit ends its request
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Outbound unit as it appears on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Unit text; null for terminal units
    pub text: Option<String>,
    /// Lifecycle status
    pub status: UnitStatus,
    /// Failure description on `error` units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<OutputUnit> for OutboundMessage {
    fn from(unit: OutputUnit) -> Self {
        match unit.status {
            UnitStatus::Continue => Self {
                text: Some(unit.text),
                status: unit.status,
                error: None,
            },
            UnitStatus::Error => Self {
                text: None,
                status: unit.status,
                error: Some(unit.text),
            },
            UnitStatus::Done | UnitStatus::Cancelled => Self {
                text: None,
                status: unit.status,
                error: None,
            },
        }
    }
}

/// Final message sent before the server closes a connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalMessage {
    /// Why the connection is being closed
    pub error: String,
}
