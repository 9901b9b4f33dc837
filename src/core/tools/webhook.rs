//! Webhook posting tool.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{ExecutionError, Tool, ToolDefinition};

/// Header carrying the hex HMAC-SHA256 of the request body
pub const SIGNATURE_HEADER: &str = "X-Bridge-Signature";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the error body echoed back to the model
const MAX_ERROR_BODY: usize = 512;

/// POSTs a JSON event to a fixed endpoint.
pub struct WebhookTool {
    url: String,
    secret: Option<Zeroizing<String>>,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookTool {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: None,
            timeout: DEFAULT_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    /// Sign every request body with this shared secret
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(Zeroizing::new(secret.into()));
        self
    }

    fn sign(&self, body: &[u8]) -> Result<Option<String>, ExecutionError> {
        let Some(secret) = &self.secret else {
            return Ok(None);
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| ExecutionError::NotConfigured(format!("webhook secret: {e}")))?;
        mac.update(body);
        Ok(Some(hex::encode(mac.finalize().into_bytes())))
    }
}

#[async_trait]
impl Tool for WebhookTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "post_webhook",
            "Send a JSON event to the configured webhook endpoint.",
            json!({
                "type": "object",
                "properties": {
                    "event": { "type": "string", "description": "Short event name" },
                    "payload": { "type": "object", "description": "Event data" }
                },
                "required": ["event"]
            }),
        )
    }

    async fn call(&self, args: Value) -> Result<Value, ExecutionError> {
        let event = args
            .get("event")
            .and_then(Value::as_str)
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| ExecutionError::InvalidArguments("`event` is required".to_string()))?;
        let payload = args.get("payload").cloned().unwrap_or_else(|| json!({}));

        let body = serde_json::to_vec(&json!({ "event": event, "payload": payload }))
            .map_err(|e| ExecutionError::InvalidArguments(e.to_string()))?;

        debug!(url = %self.url, event = %event, "Posting webhook");

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json");

        if let Some(signature) = self.sign(&body)? {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| ExecutionError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_on_char_boundary(&mut body, MAX_ERROR_BODY);
            warn!(url = %self.url, status = %status, "Webhook returned non-success status");
            return Err(ExecutionError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(json!({ "delivered": true, "status": status.as_u16() }))
    }
}

/// Cut `text` to at most `max` bytes without splitting a character.
fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let end = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max)
        .last()
        .unwrap_or(0);
    text.truncate(end);
}
