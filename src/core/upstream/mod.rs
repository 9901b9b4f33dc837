//! Upstream realtime providers.

mod base;
pub mod openai;

pub use base::{
    FragmentMode, JsonObject, SessionDefaults, TranscriptFragment, TurnDetectionSettings,
    UpstreamCodec, UpstreamConnector, UpstreamError, UpstreamEvent, UpstreamLink, UpstreamMessage,
    UpstreamOp, UpstreamResult,
};
