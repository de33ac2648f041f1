//! Tool trait and the error taxonomy shared by every sandbox tool.

use std::time::Duration;

use async_trait::async_trait;

/// Failure of a single tool call.
///
/// These never end a session: the registry renders them into an `ERROR:`
/// string that is handed back to the model as the tool result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Path escapes sandbox: {0}")]
    PathEscape(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{what} too large ({size} bytes). Maximum is {max} bytes")]
    TooLarge { what: String, size: u64, max: u64 },

    #[error("Command blocked by safety policy: {0}")]
    Blocked(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("{0}")]
    ExecutionFailed(String),
}

impl ToolError {
    /// Render the error as the tagged string placed into the conversation.
    pub fn to_tool_result(&self) -> String {
        format!("ERROR: {self}")
    }
}

/// A capability exposed to model-driven sessions.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model uses to invoke the tool.
    fn name(&self) -> &str;

    /// Human-readable description sent with the catalog.
    fn description(&self) -> &str;

    /// JSON schema of the tool's arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool.
    async fn execute(&self, params: serde_json::Value) -> Result<String, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing string parameter '{key}'")))
}

/// Extract an optional string parameter, treating empty strings as absent.
pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}
