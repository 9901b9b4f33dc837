//! OpenAI Realtime API provider.
//!
//! One WebSocket carries transcription, tool-calling generation and speech
//! synthesis. Authentication is a Bearer API key plus the `OpenAI-Beta:
//! realtime=v1` header.

mod client;
mod codec;
mod config;
mod messages;

pub use client::OpenAIConnector;
pub use codec::OpenAICodec;
pub use config::{
    DEFAULT_AUDIO_FORMAT, DEFAULT_REALTIME_MODEL, DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_VOICE,
    OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtimeConfig,
};
pub use messages::{ClientEvent, ServerEvent};
