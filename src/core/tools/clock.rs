use async_trait::async_trait;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{ExecutionError, Tool, ToolDefinition};

/// Reports the current UTC time. Has no side effects.
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "get_current_time",
            "Get the current date and time in UTC.",
            json!({ "type": "object", "properties": {}, "required": [] }),
        )
    }

    async fn call(&self, _args: Value) -> Result<Value, ExecutionError> {
        let now = OffsetDateTime::now_utc();
        let formatted = now
            .format(&Rfc3339)
            .map_err(|e| ExecutionError::RequestFailed(e.to_string()))?;

        Ok(json!({
            "utc": formatted,
            "unix": now.unix_timestamp(),
        }))
    }
}
