//! Inbound frame classification and validation.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};

use super::protocol::{ClientControlMessage, ClientFrame, MAX_INSTRUCTIONS_SIZE};
use crate::core::upstream::JsonObject;
use crate::errors::{BridgeError, BridgeResult};

/// A validated client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedFrame {
    Audio(Bytes),
    Control(ClientControlMessage),
}

/// Classify a client frame. Binary frames are always audio.
pub fn route(frame: ClientFrame) -> BridgeResult<RoutedFrame> {
    match frame {
        ClientFrame::Binary(data) => Ok(RoutedFrame::Audio(data)),
        ClientFrame::Text(text) => parse_control(&text).map(RoutedFrame::Control),
    }
}

/// Parse and validate a JSON control message.
pub fn parse_control(text: &str) -> BridgeResult<ClientControlMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| BridgeError::protocol_with("Invalid JSON", json!({ "reason": e.to_string() })))?;

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(BridgeError::protocol("Message must be an object with a string `type`"));
    };

    if !ClientControlMessage::TYPES.contains(&kind) {
        return Err(BridgeError::protocol_with(
            "Unrecognized message type",
            json!({ "type": kind, "expected": ClientControlMessage::TYPES }),
        ));
    }

    let message = ClientControlMessage::deserialize(&value).map_err(|e| {
        BridgeError::protocol_with(
            format!("Malformed {kind} message"),
            json!({ "reason": e.to_string() }),
        )
    })?;

    validate_size(&message)?;
    Ok(message)
}

fn validate_size(message: &ClientControlMessage) -> BridgeResult<()> {
    let instructions = match message {
        ClientControlMessage::SessionInit { instructions, .. } => instructions.as_deref(),
        ClientControlMessage::SessionUpdate { session } => {
            session.get("instructions").and_then(Value::as_str)
        }
        ClientControlMessage::ResponseCreate { response } => response
            .as_ref()
            .and_then(|r| r.get("instructions"))
            .and_then(Value::as_str),
        _ => None,
    };

    match instructions {
        Some(text) if text.len() > MAX_INSTRUCTIONS_SIZE => Err(BridgeError::protocol_with(
            "Instructions too large",
            json!({ "size": text.len(), "max": MAX_INSTRUCTIONS_SIZE }),
        )),
        _ => Ok(()),
    }
}

/// Shallow per-key merge: keys in `overrides` replace those in `base`.
pub fn merge_fields(base: &mut JsonObject, overrides: &JsonObject) {
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol_message(err: BridgeError) -> String {
        match err {
            BridgeError::ClientProtocol { message, .. } => message,
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_is_audio() {
        let routed = route(ClientFrame::Binary(Bytes::from_static(b"\x00\x01"))).unwrap();
        assert_eq!(routed, RoutedFrame::Audio(Bytes::from_static(b"\x00\x01")));
    }

    #[test]
    fn test_invalid_json() {
        let err = route(ClientFrame::Text("{not json".to_string())).unwrap_err();
        assert_eq!(protocol_message(err), "Invalid JSON");
    }

    #[test]
    fn test_missing_type() {
        assert!(parse_control("[1,2,3]").is_err());
        assert!(parse_control(r#"{"kind":"commit"}"#).is_err());
    }

    #[test]
    fn test_unrecognized_type() {
        let err = parse_control(r#"{"type":"conversation.item.delete"}"#).unwrap_err();
        assert_eq!(protocol_message(err), "Unrecognized message type");
    }

    #[test]
    fn test_malformed_shape() {
        let err = parse_control(r#"{"type":"session.update","session":42}"#).unwrap_err();
        assert_eq!(protocol_message(err), "Malformed session.update message");
    }

    #[test]
    fn test_recognized_messages() {
        assert_eq!(
            parse_control(r#"{"type":"commit"}"#).unwrap(),
            ClientControlMessage::Commit {}
        );
        assert!(matches!(
            parse_control(r#"{"type":"response.create","response":{"voice":"verse"}}"#).unwrap(),
            ClientControlMessage::ResponseCreate { response: Some(_) }
        ));
    }

    #[test]
    fn test_oversized_instructions_rejected() {
        let big = "x".repeat(MAX_INSTRUCTIONS_SIZE + 1);
        let text = json!({"type": "session.init", "instructions": big}).to_string();
        let err = parse_control(&text).unwrap_err();
        assert_eq!(protocol_message(err), "Instructions too large");

        let text = json!({"type": "session.update", "session": {"instructions": "x".repeat(MAX_INSTRUCTIONS_SIZE + 1)}})
            .to_string();
        assert!(parse_control(&text).is_err());
    }

    #[test]
    fn test_merge_fields_per_key() {
        let mut base = JsonObject::new();
        base.insert("voice".into(), json!("alloy"));
        base.insert("modalities".into(), json!(["text", "audio"]));

        let mut overrides = JsonObject::new();
        overrides.insert("voice".into(), json!("verse"));
        overrides.insert("temperature".into(), json!(0.7));

        merge_fields(&mut base, &overrides);

        assert_eq!(base["voice"], "verse");
        assert_eq!(base["modalities"], json!(["text", "audio"]));
        assert_eq!(base["temperature"], 0.7);
    }
}
