//! The `Tool` trait and argument helpers.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;

/// A capability the model can invoke during an agent step.
///
/// Implementations return their output as a string: it goes straight
/// back into the conversation window as a tool message.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name advertised to the model.
    fn name(&self) -> &str;

    /// Human-readable description advertised to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters_schema(&self) -> Value;

    /// Execute with the model-supplied arguments.
    async fn invoke(&self, args: Value) -> Result<String, ToolError>;
}

/// Extract a required string argument.
pub fn require_str<'a>(args: &'a Value, key: &str, tool: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing required string argument '{key}'"),
        })
}

/// Extract an optional string argument.
pub fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}
