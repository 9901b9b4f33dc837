use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::messages::{ClientEvent, FunctionCallOutputItem, InputAudioTranscription, ServerEvent, TurnDetection};
use crate::core::upstream::{
    JsonObject, SessionDefaults, TranscriptFragment, UpstreamCodec, UpstreamEvent, UpstreamOp,
    UpstreamResult,
};

/// Wire codec for the OpenAI Realtime protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAICodec;

impl OpenAICodec {
    fn client_event(op: &UpstreamOp) -> ClientEvent {
        match op {
            UpstreamOp::UpdateSession(session) => ClientEvent::SessionUpdate {
                session: session.clone(),
            },
            UpstreamOp::AppendAudio(data) => ClientEvent::audio_append(data),
            UpstreamOp::CommitInput => ClientEvent::InputAudioBufferCommit,
            UpstreamOp::ClearInput => ClientEvent::InputAudioBufferClear,
            UpstreamOp::CreateResponse(params) => ClientEvent::ResponseCreate {
                response: (!params.is_empty()).then(|| params.clone()),
            },
            UpstreamOp::CancelResponse => ClientEvent::ResponseCancel,
            UpstreamOp::InjectToolResult { call_id, output } => ClientEvent::ConversationItemCreate {
                item: FunctionCallOutputItem::new(call_id.clone(), output.clone()),
            },
        }
    }
}

impl UpstreamCodec for OpenAICodec {
    fn encode(&self, op: &UpstreamOp) -> UpstreamResult<String> {
        Ok(serde_json::to_string(&Self::client_event(op))?)
    }

    fn decode(&self, frame: &Value) -> UpstreamEvent {
        let event = match ServerEvent::deserialize(frame) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Unmodeled upstream event shape, relaying as-is");
                return UpstreamEvent::Opaque;
            }
        };

        match event {
            ServerEvent::Error { error } => UpstreamEvent::Error {
                message: error.message,
            },
            ServerEvent::SessionCreated { session } => UpstreamEvent::SessionCreated { id: session.id },
            ServerEvent::TranscriptionDelta { item_id, delta } => {
                let fragment = TranscriptFragment::delta(delta);
                UpstreamEvent::Transcript(match item_id {
                    Some(id) => fragment.with_utterance(id),
                    None => fragment,
                })
            }
            ServerEvent::TranscriptionCompleted { item_id, transcript } => {
                let fragment = TranscriptFragment::final_text(transcript);
                UpstreamEvent::Transcript(match item_id {
                    Some(id) => fragment.with_utterance(id),
                    None => fragment,
                })
            }
            ServerEvent::ResponseCreated { response } => UpstreamEvent::ResponseCreated {
                response_id: response.id,
            },
            ServerEvent::ResponseDone { response } => UpstreamEvent::ResponseDone {
                response_id: response.id,
                status: response.status,
            },
            ServerEvent::OutputItemAdded { item } => match (item.item_type.as_str(), item.call_id, item.name) {
                ("function_call", Some(call_id), Some(name)) => {
                    UpstreamEvent::FunctionCallAnnounced { call_id, name }
                }
                _ => UpstreamEvent::Opaque,
            },
            ServerEvent::FunctionCallArgumentsDelta { call_id, delta } => {
                UpstreamEvent::FunctionCallArgumentsDelta { call_id, delta }
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => UpstreamEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            },
            ServerEvent::AudioDelta { response_id } => UpstreamEvent::AudioDelta { response_id },
            ServerEvent::AudioDone { response_id } => UpstreamEvent::AudioDone { response_id },
            ServerEvent::TextDone { text } => UpstreamEvent::AssistantText { text },
            ServerEvent::AudioTranscriptDone { transcript } => {
                UpstreamEvent::AssistantText { text: transcript }
            }
            ServerEvent::Other => UpstreamEvent::Opaque,
        }
    }

    fn session_config(&self, defaults: &SessionDefaults) -> JsonObject {
        let mut session = JsonObject::new();
        session.insert("modalities".into(), json!(defaults.modalities));
        if let Some(instructions) = &defaults.instructions {
            session.insert("instructions".into(), json!(instructions));
        }
        session.insert("voice".into(), json!(defaults.voice));
        session.insert("input_audio_format".into(), json!(defaults.input_audio_format));
        session.insert("output_audio_format".into(), json!(defaults.output_audio_format));
        session.insert(
            "input_audio_transcription".into(),
            json!(InputAudioTranscription {
                model: defaults.transcription_model.clone(),
            }),
        );

        let turn_detection = defaults.turn_detection.map(|td| TurnDetection::ServerVad {
            threshold: td.threshold,
            prefix_padding_ms: td.prefix_padding_ms,
            silence_duration_ms: td.silence_duration_ms,
            create_response: false,
            interrupt_response: false,
        });
        session.insert("turn_detection".into(), json!(turn_detection));

        if !defaults.tools.is_empty() {
            session.insert("tools".into(), json!(defaults.tools));
            session.insert("tool_choice".into(), json!("auto"));
        }

        session
    }

    fn response_defaults(&self, defaults: &SessionDefaults) -> JsonObject {
        let mut response = JsonObject::new();
        response.insert("modalities".into(), json!(defaults.modalities));
        response.insert("voice".into(), json!(defaults.voice));
        response.insert("output_audio_format".into(), json!(defaults.output_audio_format));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::ToolDefinition;
    use crate::core::upstream::{FragmentMode, TurnDetectionSettings};
    use bytes::Bytes;

    fn defaults() -> SessionDefaults {
        SessionDefaults {
            instructions: Some("Be brief.".to_string()),
            voice: "alloy".to_string(),
            modalities: vec!["text".to_string(), "audio".to_string()],
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: Some(TurnDetectionSettings::default()),
            tools: vec![ToolDefinition::function("search", "Search", json!({"type": "object"}))],
        }
    }

    fn encode(op: UpstreamOp) -> Value {
        serde_json::from_str(&OpenAICodec.encode(&op).unwrap()).unwrap()
    }

    #[test]
    fn test_encode_ops() {
        assert_eq!(encode(UpstreamOp::CommitInput)["type"], "input_audio_buffer.commit");
        assert_eq!(encode(UpstreamOp::ClearInput)["type"], "input_audio_buffer.clear");
        assert_eq!(encode(UpstreamOp::CancelResponse)["type"], "response.cancel");

        let audio = encode(UpstreamOp::AppendAudio(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(audio["audio"], "AQID");

        let inject = encode(UpstreamOp::InjectToolResult {
            call_id: "c1".to_string(),
            output: "{}".to_string(),
        });
        assert_eq!(inject["type"], "conversation.item.create");
        assert_eq!(inject["item"]["output"], "{}");
    }

    #[test]
    fn test_encode_create_response_omits_empty_params() {
        let bare = encode(UpstreamOp::CreateResponse(JsonObject::new()));
        assert!(bare.get("response").is_none());

        let mut params = JsonObject::new();
        params.insert("voice".into(), json!("verse"));
        let full = encode(UpstreamOp::CreateResponse(params));
        assert_eq!(full["response"]["voice"], "verse");
    }

    #[test]
    fn test_decode_transcription() {
        let delta = OpenAICodec.decode(&json!({
            "type": "conversation.item.input_audio_transcription.delta",
            "item_id": "item_1",
            "delta": "hel"
        }));
        match delta {
            UpstreamEvent::Transcript(f) => {
                assert_eq!(f.mode, FragmentMode::Append);
                assert_eq!(f.utterance.as_deref(), Some("item_1"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let done = OpenAICodec.decode(&json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "item_1",
            "content_index": 0,
            "transcript": "hello there"
        }));
        assert!(matches!(done, UpstreamEvent::Transcript(f) if f.is_final && f.text == "hello there"));
    }

    #[test]
    fn test_decode_function_call_lifecycle() {
        let added = OpenAICodec.decode(&json!({
            "type": "response.output_item.added",
            "response_id": "resp_1",
            "output_index": 0,
            "item": {"type": "function_call", "call_id": "c1", "name": "search", "arguments": ""}
        }));
        assert_eq!(
            added,
            UpstreamEvent::FunctionCallAnnounced {
                call_id: "c1".to_string(),
                name: "search".to_string()
            }
        );

        let message_item = OpenAICodec.decode(&json!({
            "type": "response.output_item.added",
            "item": {"type": "message", "role": "assistant"}
        }));
        assert_eq!(message_item, UpstreamEvent::Opaque);

        let done = OpenAICodec.decode(&json!({
            "type": "response.function_call_arguments.done",
            "call_id": "c1",
            "arguments": "{\"q\":\"test\"}"
        }));
        assert!(matches!(done, UpstreamEvent::FunctionCallArgumentsDone { name: None, .. }));
    }

    #[test]
    fn test_decode_malformed_known_type_is_opaque() {
        let event = OpenAICodec.decode(&json!({"type": "response.audio.delta"}));
        assert_eq!(event, UpstreamEvent::Opaque);
    }

    #[test]
    fn test_session_config_shape() {
        let session = OpenAICodec.session_config(&defaults());
        assert_eq!(session["instructions"], "Be brief.");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["turn_detection"]["create_response"], false);
        assert_eq!(session["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(session["tools"][0]["name"], "search");
        assert_eq!(session["tool_choice"], "auto");
    }

    #[test]
    fn test_session_config_without_vad() {
        let mut d = defaults();
        d.turn_detection = None;
        d.tools.clear();
        let session = OpenAICodec.session_config(&d);
        assert!(session["turn_detection"].is_null());
        assert!(!session.contains_key("tools"));
    }

    #[test]
    fn test_response_defaults() {
        let response = OpenAICodec.response_defaults(&defaults());
        assert_eq!(response.len(), 3);
        assert_eq!(response["voice"], "alloy");
    }
}
