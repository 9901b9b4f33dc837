//! OpenAI Realtime API connection settings.

/// OpenAI Realtime API WebSocket endpoint.
pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default realtime model.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Default voice for synthesized audio.
pub const DEFAULT_VOICE: &str = "alloy";

/// Default input transcription model.
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Audio format for both directions (PCM16, 24 kHz, mono).
pub const DEFAULT_AUDIO_FORMAT: &str = "pcm16";

/// Sample rate the realtime API expects for `pcm16`.
pub const OPENAI_REALTIME_SAMPLE_RATE: u32 = 24000;

/// Endpoint and model for a realtime link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAIRealtimeConfig {
    /// Base WebSocket URL, without the model query
    pub url: String,
    pub model: String,
}

impl Default for OpenAIRealtimeConfig {
    fn default() -> Self {
        Self {
            url: OPENAI_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
        }
    }
}

impl OpenAIRealtimeConfig {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
        }
    }

    /// Full WebSocket URL including the model query parameter.
    pub fn ws_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, separator, self.model)
    }
}
