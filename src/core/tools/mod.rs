//! Server-executed tools.
//!
//! The session bridge only knows the [`ToolExecutor`] capability: it hands over a
//! tool name and parsed arguments and receives structured data or an
//! [`ExecutionError`]. Failures never escape as connection errors; they are
//! folded into an `{ok: false, error}` payload by [`tool_output`] and reported
//! to the model as the tool's answer.

mod clock;
mod webhook;

pub use clock::ClockTool;
pub use webhook::WebhookTool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// Tool execution failures.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Endpoint returned HTTP {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool not configured: {0}")]
    NotConfigured(String),
}

/// Function definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Always "function"
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A single named tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, args: Value) -> Result<Value, ExecutionError>;
}

/// Capability the bridge dispatches tool calls to.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run a tool to completion. Timeouts belong to the implementation.
    async fn execute(&self, name: &str, args: Value) -> Result<Value, ExecutionError>;

    /// Names this executor can run
    fn tool_names(&self) -> Vec<String>;

    /// Definitions to advertise to the model
    fn definitions(&self) -> Vec<ToolDefinition>;
}

/// Name-keyed set of [`Tool`]s.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tools available under the given configuration.
    ///
    /// The webhook tool is only registered when a webhook URL is configured.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClockTool));

        if let Some(url) = &config.webhook_url {
            let mut tool = WebhookTool::new(url.clone());
            if let Some(secret) = &config.webhook_secret {
                tool = tool.with_secret(secret.clone());
            }
            registry.register(Arc::new(tool));
        }

        registry
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replacing previously registered tool");
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, args: Value) -> Result<Value, ExecutionError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ExecutionError::UnknownTool(name.to_string()))?;

        debug!(tool = %name, "Executing tool");
        tool.call(args).await
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }
}

/// Fold an execution outcome into the payload reported to the model.
pub fn tool_output(outcome: Result<Value, ExecutionError>) -> Value {
    match outcome {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

/// Payload for a call naming a tool nobody registered.
pub fn unknown_tool_output(name: &str) -> Value {
    tool_output(Err(ExecutionError::UnknownTool(name.to_string())))
}
