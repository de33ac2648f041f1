//! Anthropic Messages API provider.
//!
//! Responses carry mixed content blocks; `tool_use` blocks come with native
//! ids. Consecutive tool results are sent back as one user turn of
//! `tool_result` blocks.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, ChatResponse, LlmProvider, Role, TokenUsage, ToolCall, ToolDefinition, WireTurn,
    group_tool_results, http_error,
};

/// Default Anthropic API base URL.
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

/// Anthropic API version header value.
const API_VERSION: &str = "2023-06-01";

const PROVIDER: &str = "anthropic";

/// Anthropic provider using the Messages API.
pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
    api_base: String,
    model: String,
    max_tokens: u32,
}

// -- Messages API request/response types --

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiToolDef>,
}

#[derive(Debug, Serialize, PartialEq)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Block types this adapter does not use (e.g. thinking).
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
struct ApiToolDef {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_base: DEFAULT_API_BASE.to_string(),
            model: model.into(),
            max_tokens,
        }
    }

    /// Override the API base URL (proxies, tests).
    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn convert_messages(conversation: &[ChatMessage]) -> Vec<ApiMessage> {
        group_tool_results(conversation)
            .into_iter()
            .map(|turn| match turn {
                WireTurn::ToolResults(results) => ApiMessage {
                    role: "user",
                    content: results
                        .into_iter()
                        .map(|m| ContentBlock::ToolResult {
                            tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                            content: m.content.clone(),
                        })
                        .collect(),
                },
                WireTurn::Message(m) if m.role == Role::Assistant => {
                    let mut content = Vec::new();
                    if !m.content.is_empty() {
                        content.push(ContentBlock::Text {
                            text: m.content.clone(),
                        });
                    }
                    content.extend(m.tool_calls.iter().map(|c| ContentBlock::ToolUse {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        input: c.arguments.clone(),
                    }));
                    if content.is_empty() {
                        content.push(ContentBlock::Text {
                            text: "(no content)".to_string(),
                        });
                    }
                    ApiMessage {
                        role: "assistant",
                        content,
                    }
                }
                WireTurn::Message(m) => ApiMessage {
                    role: "user",
                    content: vec![ContentBlock::Text {
                        text: m.content.clone(),
                    }],
                },
            })
            .collect()
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDef> {
        tools
            .iter()
            .map(|t| ApiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn parse_response(resp: MessagesResponse) -> ChatResponse {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for block in resp.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
            }
        }

        ChatResponse {
            text: text_parts.join(""),
            tool_calls,
            usage: resp
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                })
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        system: &str,
        conversation: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, LlmError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: (!system.is_empty()).then_some(system),
            messages: Self::convert_messages(conversation),
            tools: Self::convert_tools(tools),
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(PROVIDER, status, &headers, &body));
        }

        let body: MessagesResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })?;

        Ok(Self::parse_response(body))
    }
}
