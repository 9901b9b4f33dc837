//! Base traits and types for upstream realtime providers.
//!
//! The session bridge never talks to a vendor directly. It issues abstract
//! [`UpstreamOp`]s and consumes decoded [`UpstreamEvent`]s; a provider supplies
//! the [`UpstreamCodec`] that maps those onto its wire protocol and the
//! [`UpstreamConnector`] that opens the streaming link.
//!
//! Only the handful of event kinds the bridge must act on are modeled. Every
//! other payload decodes to [`UpstreamEvent::Opaque`] and is relayed verbatim.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::tools::ToolDefinition;

/// JSON object used for session and response configuration payloads.
pub type JsonObject = Map<String, Value>;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur on an upstream link.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamError {
    /// Connection to the provider failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The link was closed by the provider
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

/// Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::SerializationError(err.to_string())
    }
}

// =============================================================================
// Operations (bridge -> upstream)
// =============================================================================

/// Provider-neutral operations the bridge sends upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamOp {
    /// Merge the given keys into the live upstream session configuration
    UpdateSession(JsonObject),
    /// Append one chunk of raw input audio
    AppendAudio(Bytes),
    /// Commit the pending input audio as a user turn
    CommitInput,
    /// Discard not-yet-committed input audio
    ClearInput,
    /// Request a generation with the given response parameters
    CreateResponse(JsonObject),
    /// Cancel the in-flight generation
    CancelResponse,
    /// Add a tool result to the upstream conversation
    InjectToolResult {
        /// Call the result answers
        call_id: String,
        /// JSON-encoded tool output
        output: String,
    },
}

// =============================================================================
// Events (upstream -> bridge)
// =============================================================================

/// How a transcript fragment combines with the buffered text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentMode {
    /// Fragment is a delta appended to the buffer
    Append,
    /// Fragment carries the full text so far
    Replace,
}

/// A piece of user speech transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    /// Fragment text
    pub text: String,
    /// Delta or cumulative
    pub mode: FragmentMode,
    /// Set when the provider marks the utterance as complete
    pub is_final: bool,
    /// Provider id of the utterance, when it has one
    pub utterance: Option<String>,
}

impl TranscriptFragment {
    /// Cumulative partial transcript.
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: FragmentMode::Replace,
            is_final: false,
            utterance: None,
        }
    }

    /// Incremental transcript delta.
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: FragmentMode::Append,
            is_final: false,
            utterance: None,
        }
    }

    /// Final transcript for the utterance.
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: FragmentMode::Replace,
            is_final: true,
            utterance: None,
        }
    }

    /// Attach the provider's utterance id.
    pub fn with_utterance(mut self, id: impl Into<String>) -> Self {
        self.utterance = Some(id.into());
        self
    }
}

/// Decoded upstream event. Anything the bridge does not act on is `Opaque`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Provider acknowledged the session
    SessionCreated { id: String },
    /// User speech transcription
    Transcript(TranscriptFragment),
    /// Generation started
    ResponseCreated { response_id: String },
    /// Generation finished (completed, cancelled, failed...)
    ResponseDone {
        response_id: String,
        status: Option<String>,
    },
    /// Completed assistant text or audio transcript
    AssistantText { text: String },
    /// Chunk of synthesized audio
    AudioDelta { response_id: String },
    /// End of synthesized audio for a response
    AudioDone { response_id: String },
    /// Model announced a function call
    FunctionCallAnnounced { call_id: String, name: String },
    /// Streamed argument fragment
    FunctionCallArgumentsDelta { call_id: String, delta: String },
    /// Argument stream complete
    FunctionCallArgumentsDone {
        call_id: String,
        /// Some providers repeat the name here
        name: Option<String>,
        arguments: String,
    },
    /// Protocol-level error reported by the provider
    Error { message: String },
    /// Anything else; relayed untouched
    Opaque,
}

/// Raw traffic from an upstream link.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    /// JSON text frame
    Text(String),
    /// Provider closed the link
    Closed(Option<String>),
    /// Transport failure
    Failed(String),
}

// =============================================================================
// Session defaults
// =============================================================================

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnDetectionSettings {
    /// Activation threshold (0.0 to 1.0)
    pub threshold: f32,
    /// Audio kept before detected speech (ms)
    pub prefix_padding_ms: u32,
    /// Silence that ends a turn (ms)
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Provider-neutral defaults for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub instructions: Option<String>,
    pub voice: String,
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub transcription_model: String,
    /// `None` disables automatic turn detection (client sends `commit`)
    pub turn_detection: Option<TurnDetectionSettings>,
    pub tools: Vec<ToolDefinition>,
}

// =============================================================================
// Link and traits
// =============================================================================

/// An open streaming connection to a provider.
///
/// Dropping `outbound` asks the link task to close the socket.
#[derive(Debug)]
pub struct UpstreamLink {
    /// Encoded frames to send
    pub outbound: mpsc::Sender<String>,
    /// Frames and lifecycle notifications from the provider
    pub inbound: mpsc::Receiver<UpstreamMessage>,
}

impl UpstreamLink {
    /// Build a link from its two channel halves.
    pub fn new(outbound: mpsc::Sender<String>, inbound: mpsc::Receiver<UpstreamMessage>) -> Self {
        Self { outbound, inbound }
    }
}

/// Maps provider-neutral operations and events onto a vendor wire protocol.
pub trait UpstreamCodec: Send + Sync {
    /// Encode an operation as a text frame.
    fn encode(&self, op: &UpstreamOp) -> UpstreamResult<String>;

    /// Classify a parsed frame. Unknown or malformed frames are `Opaque`.
    fn decode(&self, frame: &Value) -> UpstreamEvent;

    /// Initial session configuration sent once the link opens.
    fn session_config(&self, defaults: &SessionDefaults) -> JsonObject;

    /// Deterministic defaults for every generation request.
    fn response_defaults(&self, defaults: &SessionDefaults) -> JsonObject;
}

/// Opens upstream links.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Provider name, for logging
    fn provider(&self) -> &'static str;

    /// Wire codec for links opened by this connector
    fn codec(&self) -> Arc<dyn UpstreamCodec>;

    /// Open a new link. No retries are attempted.
    async fn connect(&self) -> UpstreamResult<UpstreamLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UpstreamError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = UpstreamError::NotConnected;
        assert_eq!(err.to_string(), "Not connected");
    }

    #[test]
    fn test_fragment_constructors() {
        let partial = TranscriptFragment::partial("hel");
        assert_eq!(partial.mode, FragmentMode::Replace);
        assert!(!partial.is_final);

        let delta = TranscriptFragment::delta(" there");
        assert_eq!(delta.mode, FragmentMode::Append);

        let done = TranscriptFragment::final_text("hello there");
        assert!(done.is_final);
    }

    #[test]
    fn test_default_turn_detection() {
        let td = TurnDetectionSettings::default();
        assert_eq!(td.threshold, 0.5);
        assert_eq!(td.silence_duration_ms, 500);
    }
}
