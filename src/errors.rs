//! Bridge-level error categories.
//!
//! Only [`BridgeError::UpstreamConnection`] ends a session. Client protocol
//! errors become an `error` event and the connection stays open; unusable
//! tool arguments degrade to an empty object. Tool execution failures never
//! reach this type: they are folded into the tool's reported output (see
//! [`crate::core::tools::tool_output`]), and configuration errors stop the
//! process before any session exists.

use serde_json::{Value, json};
use thiserror::Error;

use crate::core::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed or unrecognized control message from the client
    #[error("{message}")]
    ClientProtocol {
        message: String,
        details: Option<Value>,
    },

    #[error("Upstream connection error: {0}")]
    UpstreamConnection(#[from] UpstreamError),

    /// Streamed tool arguments were not a JSON object
    #[error("Invalid arguments for call {call_id}: {reason}")]
    ToolArgumentParse { call_id: String, reason: String },
}

impl BridgeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::ClientProtocol {
            message: message.into(),
            details: None,
        }
    }

    pub fn protocol_with(message: impl Into<String>, details: Value) -> Self {
        BridgeError::ClientProtocol {
            message: message.into(),
            details: Some(details),
        }
    }

    /// Whether the error terminates the session it occurred in.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, BridgeError::UpstreamConnection(_))
    }

    /// Message for the client `error` event.
    pub fn client_message(&self) -> String {
        match self {
            BridgeError::UpstreamConnection(_) => "Upstream connection closed".to_string(),
            other => other.to_string(),
        }
    }

    /// Details object for the client `error` event.
    pub fn details(&self) -> Option<Value> {
        match self {
            BridgeError::ClientProtocol { details, .. } => details.clone(),
            BridgeError::UpstreamConnection(e) => Some(json!({ "reason": e.to_string() })),
            BridgeError::ToolArgumentParse { call_id, .. } => Some(json!({ "callId": call_id })),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_displays_message_only() {
        let err = BridgeError::protocol_with("Invalid JSON", json!({"reason": "eof"}));
        assert_eq!(err.to_string(), "Invalid JSON");
        assert_eq!(err.client_message(), "Invalid JSON");
        assert_eq!(err.details(), Some(json!({"reason": "eof"})));
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn test_upstream_error_is_fatal() {
        let err: BridgeError = UpstreamError::Closed("going away".to_string()).into();
        assert!(err.is_session_fatal());
        assert_eq!(err.client_message(), "Upstream connection closed");
        assert_eq!(
            err.details(),
            Some(json!({"reason": "Connection closed: going away"}))
        );
    }

    #[test]
    fn test_argument_errors_are_recoverable() {
        let err = BridgeError::ToolArgumentParse {
            call_id: "c1".to_string(),
            reason: "eof".to_string(),
        };
        assert!(!err.is_session_fatal());
        assert_eq!(err.details(), Some(json!({"callId": "c1"})));
    }
}
