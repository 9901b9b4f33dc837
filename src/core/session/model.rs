//! Per-connection session data.

use serde::Serialize;
use std::fmt;

use crate::core::upstream::JsonObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Tool calls announced in (assistant) or answered by (tool) this turn
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_call_ids: Vec<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_ids: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, tool_call_ids: Vec<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_ids,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_ids: vec![call_id.into()],
        }
    }
}

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Connecting => write!(f, "connecting"),
            Lifecycle::Active => write!(f, "active"),
            Lifecycle::Closing => write!(f, "closing"),
            Lifecycle::Closed => write!(f, "closed"),
        }
    }
}

/// State owned by exactly one client connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// Client-chosen label from `session.init`
    pub label: Option<String>,
    lifecycle: Lifecycle,
    /// Session keys merged from the client, applied to later generations
    pub live_config: JsonObject,
    history: Vec<Turn>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            lifecycle: Lifecycle::Connecting,
            live_config: JsonObject::new(),
            history: Vec::new(),
        }
    }

    /// Generate a fresh `sess_<uuid>` id.
    pub fn generate_id() -> String {
        format!("sess_{}", uuid::Uuid::new_v4().simple())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns whether the state changed.
    pub fn advance(&mut self, next: Lifecycle) -> bool {
        if next > self.lifecycle {
            self.lifecycle = next;
            true
        } else {
            false
        }
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.history.push(turn);
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }
}
