//! Upstream-to-client relay.
//!
//! Every upstream frame is forwarded. Decoding only decides whether the
//! session must also act on it; the forwarded text is the provider's own,
//! except for audio events which carry the relay's sequence markers.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::audio::AudioRelay;
use super::protocol::ClientRoute;
use crate::core::upstream::{UpstreamCodec, UpstreamEvent};

/// One upstream frame after demultiplexing.
#[derive(Debug, Clone, PartialEq)]
pub struct Demuxed {
    pub event: UpstreamEvent,
    pub forward: ClientRoute,
}

pub struct OutboundMultiplexer {
    codec: Arc<dyn UpstreamCodec>,
    relayed: u64,
}

impl OutboundMultiplexer {
    pub fn new(codec: Arc<dyn UpstreamCodec>) -> Self {
        Self { codec, relayed: 0 }
    }

    /// Frames forwarded so far
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    pub fn demux(&mut self, raw: String, audio: &mut AudioRelay) -> Demuxed {
        self.relayed += 1;

        let mut value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Non-JSON upstream frame relayed as-is");
                return Demuxed {
                    event: UpstreamEvent::Opaque,
                    forward: ClientRoute::Passthrough(raw),
                };
            }
        };

        let event = self.codec.decode(&value);
        let retagged = match &event {
            UpstreamEvent::AudioDelta { response_id } => {
                audio.tag_output(&mut value, response_id);
                true
            }
            UpstreamEvent::AudioDone { response_id } => {
                audio.finish_output(&mut value, response_id);
                true
            }
            _ => false,
        };

        let forward = if retagged {
            match serde_json::to_string(&value) {
                Ok(text) => ClientRoute::Passthrough(text),
                Err(_) => ClientRoute::Passthrough(raw),
            }
        } else {
            ClientRoute::Passthrough(raw)
        };

        Demuxed { event, forward }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upstream::openai::OpenAICodec;
    use serde_json::json;

    fn mux() -> OutboundMultiplexer {
        OutboundMultiplexer::new(Arc::new(OpenAICodec))
    }

    fn forwarded(route: &ClientRoute) -> Value {
        match route {
            ClientRoute::Passthrough(text) => serde_json::from_str(text).unwrap(),
            other => panic!("expected passthrough, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_events_forward_verbatim() {
        let raw = r#"{"type":"rate_limits.updated","rate_limits":[ ]}"#.to_string();
        let out = mux().demux(raw.clone(), &mut AudioRelay::new());
        assert_eq!(out.event, UpstreamEvent::Opaque);
        assert_eq!(out.forward, ClientRoute::Passthrough(raw));
    }

    #[test]
    fn test_intercepted_events_still_forward_verbatim() {
        let raw = json!({
            "type": "response.function_call_arguments.delta",
            "call_id": "c1",
            "delta": "{\"q\":"
        })
        .to_string();
        let out = mux().demux(raw.clone(), &mut AudioRelay::new());
        assert!(matches!(out.event, UpstreamEvent::FunctionCallArgumentsDelta { .. }));
        assert_eq!(out.forward, ClientRoute::Passthrough(raw));
    }

    #[test]
    fn test_audio_deltas_gain_sequence() {
        let mut m = mux();
        let mut audio = AudioRelay::new();
        let delta = json!({"type": "response.audio.delta", "response_id": "r1", "delta": "AAA="}).to_string();

        let first = m.demux(delta.clone(), &mut audio);
        let second = m.demux(delta, &mut audio);
        assert_eq!(forwarded(&first.forward)["seq"], 0);
        assert_eq!(forwarded(&second.forward)["seq"], 1);
        assert_eq!(forwarded(&second.forward)["delta"], "AAA=");

        let done = m.demux(
            json!({"type": "response.audio.done", "response_id": "r1"}).to_string(),
            &mut audio,
        );
        assert_eq!(forwarded(&done.forward)["chunks"], 2);
        assert_eq!(m.relayed(), 3);
    }

    #[test]
    fn test_non_json_frame_forwarded() {
        let out = mux().demux("not json".to_string(), &mut AudioRelay::new());
        assert_eq!(out.forward, ClientRoute::Passthrough("not json".to_string()));
    }
}
