//! OpenAI-compatible chat completions provider.
//!
//! Tool calls arrive as a separate list with JSON-string arguments. Any
//! OpenAI-compatible endpoint works through `with_base_url`.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{
    CallIdSequence, ChatMessage, ChatResponse, LlmProvider, Role, TokenUsage, ToolCall,
    ToolDefinition, http_error,
};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const PROVIDER: &str = "openai";

/// OpenAI chat completions provider.
pub struct OpenAiProvider {
    client: Client,
    api_key: SecretString,
    api_base: String,
    model: String,
    max_tokens: u32,
    ids: CallIdSequence,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ApiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: ApiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ApiFunctionDef,
}

#[derive(Debug, Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_base: DEFAULT_API_BASE.to_string(),
            model: model.into(),
            max_tokens,
            ids: CallIdSequence::new("call"),
        }
    }

    /// Point at another OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn convert_messages(system: &str, conversation: &[ChatMessage]) -> Vec<ApiMessage> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        if !system.is_empty() {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: Some(system.to_string()),
                ..ApiMessage::default()
            });
        }

        for m in conversation {
            let msg = match m.role {
                Role::User => ApiMessage {
                    role: "user".to_string(),
                    content: Some(m.content.clone()),
                    ..ApiMessage::default()
                },
                Role::Assistant => ApiMessage {
                    role: "assistant".to_string(),
                    content: (!m.content.is_empty()).then(|| m.content.clone()),
                    tool_calls: m
                        .tool_calls
                        .iter()
                        .map(|c| ApiToolCall {
                            id: Some(c.id.clone()),
                            kind: function_type(),
                            function: ApiFunctionCall {
                                name: c.name.clone(),
                                arguments: c.arguments.to_string(),
                            },
                        })
                        .collect(),
                    ..ApiMessage::default()
                },
                Role::Tool => ApiMessage {
                    role: "tool".to_string(),
                    content: Some(m.content.clone()),
                    tool_call_id: m.tool_call_id.clone(),
                    ..ApiMessage::default()
                },
            };
            messages.push(msg);
        }
        messages
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<ApiTool> {
        tools
            .iter()
            .map(|t| ApiTool {
                kind: "function",
                function: ApiFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn parse_response(&self, resp: CompletionResponse) -> Result<ChatResponse, LlmError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "response has no choices".to_string(),
            })?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| ToolCall {
                id: c
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| self.ids.next_id()),
                name: c.function.name,
                // Malformed argument JSON is passed through as a string so the
                // tool reports invalid parameters back to the model.
                arguments: serde_json::from_str(&c.function.arguments)
                    .unwrap_or(serde_json::Value::String(c.function.arguments)),
            })
            .collect();

        Ok(ChatResponse {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: resp
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
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
        let request = CompletionRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: Self::convert_messages(system, conversation),
            tools: Self::convert_tools(tools),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
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

        let body: CompletionResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })?;

        self.parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(SecretString::from("sk-test"), "gpt-4o", 1024)
    }

    #[test]
    fn test_convert_messages_shapes() {
        let call = ToolCall {
            id: "call_abc".to_string(),
            name: "run_command".to_string(),
            arguments: serde_json::json!({"command": "ls"}),
        };
        let conversation = vec![
            ChatMessage::user("list files"),
            ChatMessage::assistant_with_tool_calls("", vec![call.clone()]),
            ChatMessage::tool_result(&call, "a.txt"),
        ];

        let json =
            serde_json::to_value(OpenAiProvider::convert_messages("be brief", &conversation))
                .unwrap();
        assert_eq!(json[0]["role"], "system");
        assert_eq!(json[2]["role"], "assistant");
        assert!(json[2]["content"].is_null());
        assert_eq!(json[2]["tool_calls"][0]["type"], "function");
        assert_eq!(json[2]["tool_calls"][0]["function"]["arguments"], "{\"command\":\"ls\"}");
        assert_eq!(json[3]["role"], "tool");
        assert_eq!(json[3]["tool_call_id"], "call_abc");
    }

    #[test]
    fn test_parse_response_decodes_arguments_and_fills_missing_ids() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function",
                         "function": {"name": "read_file", "arguments": "{\"path\":\"a.txt\"}"}},
                        {"type": "function",
                         "function": {"name": "list_directory", "arguments": "{}"}},
                        {"id": "call_3", "type": "function",
                         "function": {"name": "write_file", "arguments": "not json"}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        });
        let parsed: CompletionResponse = serde_json::from_value(raw).unwrap();
        let response = provider().parse_response(parsed).unwrap();

        assert_eq!(response.text, "");
        assert_eq!(response.tool_calls[0].arguments["path"], "a.txt");
        assert_eq!(response.tool_calls[1].id, "call_tc_1");
        assert_eq!(
            response.tool_calls[2].arguments,
            serde_json::Value::String("not json".to_string())
        );
        assert_eq!(response.usage.total(), 7);
    }

    #[test]
    fn test_parse_response_without_choices_is_invalid() {
        let parsed: CompletionResponse =
            serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert!(matches!(
            provider().parse_response(parsed),
            Err(LlmError::InvalidResponse { .. })
        ));
    }
}
