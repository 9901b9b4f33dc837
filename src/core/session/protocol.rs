//! Browser-facing message types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::upstream::JsonObject;

/// Maximum allowed size for instructions (100 KB)
pub const MAX_INSTRUCTIONS_SIZE: usize = 100 * 1024;

/// Raw frame received from the browser.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(String),
    /// Raw microphone audio
    Binary(Bytes),
}

// =============================================================================
// Incoming Messages (Client -> Bridge)
// =============================================================================

/// Control messages the browser may send as JSON text frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientControlMessage {
    /// Optional label and instructions for the session
    #[serde(rename = "session.init")]
    SessionInit {
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        #[serde(default)]
        instructions: Option<String>,
    },

    /// Barge-in: cancel generation and drop uncommitted audio
    #[serde(rename = "interrupt")]
    Interrupt {},

    /// Commit buffered input audio (manual turn detection)
    #[serde(rename = "commit")]
    Commit {},

    /// Request a generation, overriding response defaults per key
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default)]
        response: Option<JsonObject>,
    },

    /// Merge keys into the live session configuration
    #[serde(rename = "session.update")]
    SessionUpdate { session: JsonObject },
}

impl ClientControlMessage {
    /// Wire name of every recognized message type.
    pub const TYPES: [&'static str; 5] = [
        "session.init",
        "interrupt",
        "commit",
        "response.create",
        "session.update",
    ];
}

// =============================================================================
// Outgoing Messages (Bridge -> Client)
// =============================================================================

/// Events the bridge itself originates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum BridgeEvent {
    #[serde(rename = "ready")]
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    #[serde(rename = "transcript.partial")]
    TranscriptPartial { transcript: String },

    #[serde(rename = "transcript.final")]
    TranscriptFinal { transcript: String },

    #[serde(rename = "turn.complete")]
    TurnComplete {
        #[serde(rename = "responseId")]
        response_id: String,
    },

    #[serde(rename = "closing")]
    Closing { reason: String },
}

impl BridgeEvent {
    pub fn error(message: impl Into<String>, details: Option<Value>) -> Self {
        BridgeEvent::Error {
            message: message.into(),
            details,
        }
    }
}

/// Outbound routing for the client socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRoute {
    /// Bridge-originated event
    Event(BridgeEvent),
    /// Upstream frame, already serialized
    Passthrough(String),
    /// Close the client socket
    Close,
}
