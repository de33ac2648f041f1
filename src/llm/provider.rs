//! Canonical conversation types and the provider trait.
//!
//! Sessions only ever see these types. Each backend translates the whole
//! canonical history into its own wire format on every call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id; native or synthesized by the adapter.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One turn of the canonical conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls carried by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Correlation id of the call a tool turn answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool a tool turn answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::assistant(content)
        }
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
            tool_name: Some(call.name.clone()),
        }
    }
}

/// A tool declaration sent with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: serde_json::Value,
}

/// Token usage for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Normalized model response: text plus tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

impl ChatResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            usage: TokenUsage::default(),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// An interchangeable model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Backend name, used in logs and errors.
    fn name(&self) -> &str;

    /// Model identifier.
    fn model_name(&self) -> &str;

    /// Run one round: system instructions, full conversation, tool catalog.
    async fn chat(
        &self,
        system: &str,
        conversation: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, LlmError>;

    /// Turn a response into the assistant message appended to the conversation.
    fn format_assistant_turn(&self, response: &ChatResponse) -> ChatMessage {
        ChatMessage::assistant_with_tool_calls(response.text.clone(), response.tool_calls.clone())
    }

    /// Turn a tool result into the message appended after the assistant turn.
    fn format_tool_result(&self, call: &ToolCall, content: &str) -> ChatMessage {
        ChatMessage::tool_result(call, content)
    }
}

/// Monotonic correlation ids for backends that do not return their own.
#[derive(Debug)]
pub struct CallIdSequence {
    prefix: &'static str,
    counter: AtomicU64,
}

impl CallIdSequence {
    pub const fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    /// Next id, e.g. `gemini_tc_1`, `gemini_tc_2`, ...
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_tc_{}", self.prefix, n)
    }
}

/// A backend-facing turn: one message, or a run of consecutive tool results.
pub(crate) enum WireTurn<'a> {
    Message(&'a ChatMessage),
    ToolResults(Vec<&'a ChatMessage>),
}

/// Group consecutive tool-result messages for backends that expect them in one turn.
pub(crate) fn group_tool_results(conversation: &[ChatMessage]) -> Vec<WireTurn<'_>> {
    let mut turns: Vec<WireTurn<'_>> = Vec::new();
    for msg in conversation {
        if msg.role == Role::Tool {
            if let Some(WireTurn::ToolResults(group)) = turns.last_mut() {
                group.push(msg);
                continue;
            }
            turns.push(WireTurn::ToolResults(vec![msg]));
        } else {
            turns.push(WireTurn::Message(msg));
        }
    }
    turns
}

/// Map a non-success HTTP response to an [`LlmError`].
pub(crate) fn http_error(
    provider: &str,
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        429 => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        _ => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {}", truncate_body(body)),
        },
    }
}

/// Keep error bodies short enough for logs.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        format!("{}...", body.chars().take(MAX).collect::<String>())
    }
}
