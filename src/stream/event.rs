//! Event model shared with the Chatter events stream.
//!
//! Events arrive as JSON payloads framed by the SSE transport. The payload
//! shape (`data`) is event-specific and stays opaque at this layer; routing is
//! driven entirely by the [`EventKind`] tag.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type tag used to route events to registered listeners.
///
/// Unrecognized server tags are preserved verbatim in [`EventKind::Other`] so
/// newer server event types can still be subscribed to by literal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// Synthesized locally when the subscription reaches the open state.
    ConnectionEstablished,
    /// Incremental chat completion text.
    ChatMessageChunk,
    /// Final chat message for a completion turn.
    ChatMessageComplete,
    /// Workflow execution progress.
    WorkflowStatus,
    /// Document ingestion/processing progress.
    DocumentProcessing,
    /// Tag this SDK version does not know about.
    Other(String),
}

impl EventKind {
    /// Returns the wire tag for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionEstablished => "connection.established",
            Self::ChatMessageChunk => "chat.message.chunk",
            Self::ChatMessageComplete => "chat.message.complete",
            Self::WorkflowStatus => "workflow.status",
            Self::DocumentProcessing => "document.processing",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "connection.established" => Self::ConnectionEstablished,
            "chat.message.chunk" => Self::ChatMessageChunk,
            "chat.message.complete" => Self::ChatMessageComplete,
            "workflow.status" => Self::WorkflowStatus,
            "document.processing" => Self::DocumentProcessing,
            _ => Self::Other(tag),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event parsed from the stream.
///
/// Immutable once constructed; listeners receive it by reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    /// Opaque identifier assigned by the server.
    pub id: String,
    /// Routing tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Event creation time as an ISO-8601 string.
    pub timestamp: String,
    /// Event-specific payload, opaque at this layer.
    #[serde(default)]
    pub data: Value,
    /// Optional pass-through metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl StreamEvent {
    /// Parses one SSE `data:` payload into an event.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serializes the event back to its wire form.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Builds the locally synthesized readiness event dispatched when the
    /// subscription opens.
    pub(crate) fn connection_established() -> Self {
        let now = Utc::now();
        Self {
            id: format!("local-{}", now.timestamp_millis()),
            kind: EventKind::ConnectionEstablished,
            timestamp: now.to_rfc3339(),
            data: Value::Object(Map::new()),
            metadata: None,
        }
    }
}
