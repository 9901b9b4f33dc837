//! OpenAI Realtime API WebSocket message types.
//!
//! Only the client events the bridge emits and the server events it acts on
//! are typed here. Everything else the server sends is `ServerEvent::Other`
//! and reaches the browser untouched.
//!
//! Client events (sent to server):
//! - session.update
//! - input_audio_buffer.append / commit / clear
//! - conversation.item.create (function_call_output)
//! - response.create / response.cancel
//!
//! Server events (intercepted):
//! - error, session.created
//! - conversation.item.input_audio_transcription.delta / completed
//! - response.created, response.done
//! - response.output_item.added (function_call items)
//! - response.function_call_arguments.delta / done
//! - response.audio.delta / done
//! - response.text.done, response.audio_transcript.done

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::upstream::JsonObject;

// =============================================================================
// Session Configuration
// =============================================================================

/// Input audio transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

/// Turn detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side VAD
    #[serde(rename = "server_vad")]
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
        /// The bridge requests generations itself after finalizing a turn
        create_response: bool,
        /// Barge-in is driven by the client's `interrupt`
        interrupt_response: bool,
    },
}

/// A function call result added to the conversation.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionCallOutputItem {
    #[serde(rename = "type")]
    pub item_type: &'static str,
    pub call_id: String,
    pub output: String,
}

impl FunctionCallOutputItem {
    pub fn new(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            item_type: "function_call_output",
            call_id: call_id.into(),
            output: output.into(),
        }
    }
}

// =============================================================================
// Client Events (sent to server)
// =============================================================================

/// Client events sent to the OpenAI Realtime API.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate { session: JsonObject },

    /// Append audio to input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio data
        audio: String,
    },

    /// Commit the input audio buffer
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Clear the input audio buffer
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Create a conversation item
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: FunctionCallOutputItem },

    /// Create a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<JsonObject>,
    },

    /// Cancel the current response
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Create an audio append event from raw bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }
}

// =============================================================================
// Server Events (received from server)
// =============================================================================

/// Server events the bridge acts on.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        transcript: String,
    },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },

    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseInfo },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: OutputItem },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { call_id: String, delta: String },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta { response_id: String },

    #[serde(rename = "response.audio.done")]
    AudioDone { response_id: String },

    #[serde(rename = "response.text.done")]
    TextDone { text: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },

    /// Anything else
    #[serde(other)]
    Other,
}

/// API error details.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Session information.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,
}

/// Response information.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Output item header, as announced by `response.output_item.added`.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}
