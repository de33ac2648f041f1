//! Gemini generateContent provider.
//!
//! Gemini returns function calls as separate parts without ids, so the
//! adapter assigns `gemini_tc_<n>` from a per-provider counter. Tool results
//! go back as `functionResponse` parts keyed by function name.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::LlmError;
use crate::llm::provider::{
    CallIdSequence, ChatMessage, ChatResponse, LlmProvider, Role, TokenUsage, ToolCall,
    ToolDefinition, WireTurn, group_tool_results, http_error,
};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const PROVIDER: &str = "gemini";

/// Gemini provider.
pub struct GeminiProvider {
    client: Client,
    api_key: SecretString,
    api_base: String,
    model: String,
    max_tokens: u32,
    ids: CallIdSequence,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl GeminiProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_base: DEFAULT_API_BASE.to_string(),
            model: model.into(),
            max_tokens,
            ids: CallIdSequence::new("gemini"),
        }
    }

    pub fn with_base_url(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn build_contents(conversation: &[ChatMessage]) -> Vec<Value> {
        group_tool_results(conversation)
            .into_iter()
            .filter_map(|turn| match turn {
                WireTurn::ToolResults(results) => {
                    let parts: Vec<Value> = results
                        .into_iter()
                        .map(|m| {
                            json!({
                                "functionResponse": {
                                    "name": m.tool_name.clone().unwrap_or_default(),
                                    "response": {"result": m.content},
                                }
                            })
                        })
                        .collect();
                    Some(json!({"role": "user", "parts": parts}))
                }
                WireTurn::Message(m) if m.role == Role::Assistant => {
                    let mut parts = Vec::new();
                    if !m.content.is_empty() {
                        parts.push(json!({"text": m.content}));
                    }
                    parts.extend(m.tool_calls.iter().map(|c| {
                        json!({"functionCall": {"name": c.name, "args": c.arguments}})
                    }));
                    (!parts.is_empty()).then(|| json!({"role": "model", "parts": parts}))
                }
                WireTurn::Message(m) => {
                    Some(json!({"role": "user", "parts": [{"text": m.content}]}))
                }
            })
            .collect()
    }

    fn build_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        if tools.is_empty() {
            return Vec::new();
        }
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        vec![json!({"functionDeclarations": declarations})]
    }

    fn build_request(&self, system: &str, conversation: &[ChatMessage], tools: &[ToolDefinition]) -> Value {
        let mut body = json!({
            "contents": Self::build_contents(conversation),
            "generationConfig": {"maxOutputTokens": self.max_tokens},
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        let tools = Self::build_tools(tools);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    fn parse_response(&self, resp: GenerateResponse) -> Result<ChatResponse, LlmError> {
        let candidate = resp
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "response has no candidates".to_string(),
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(fc) = part.function_call {
                tool_calls.push(ToolCall {
                    id: self.ids.next_id(),
                    name: fc.name,
                    arguments: fc.args.unwrap_or_else(|| json!({})),
                });
            }
        }

        Ok(ChatResponse {
            text,
            tool_calls,
            usage: resp
                .usage_metadata
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_token_count,
                    output_tokens: u.candidates_token_count,
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
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
        let body = self.build_request(system, conversation, tools);

        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.api_base, self.model
            ))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
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

        let parsed: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })?;

        self.parse_response(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiProvider {
        GeminiProvider::new(SecretString::from("test-key"), "gemini-2.0-flash", 1024)
    }

    fn two_calls() -> GenerateResponse {
        serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Checking files."},
                        {"functionCall": {"name": "list_directory", "args": {"path": "."}}},
                        {"functionCall": {"name": "read_file", "args": {"path": "a.txt"}}}
                    ]
                }
            }],
            "usageMetadata": {"promptTokenCount": 11, "candidatesTokenCount": 4}
        }))
        .unwrap()
    }

    #[test]
    fn test_synthesized_ids_are_monotonic_across_calls() {
        let p = provider();
        let first = p.parse_response(two_calls()).unwrap();
        let second = p.parse_response(two_calls()).unwrap();

        let ids: Vec<&str> = first
            .tool_calls
            .iter()
            .chain(second.tool_calls.iter())
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["gemini_tc_1", "gemini_tc_2", "gemini_tc_3", "gemini_tc_4"]);
        assert_eq!(first.text, "Checking files.");
        assert_eq!(first.usage.total(), 15);
    }

    #[test]
    fn test_contents_use_model_role_and_function_responses() {
        let p = provider();
        let response = p.parse_response(two_calls()).unwrap();
        let mut conversation = vec![ChatMessage::user("look around")];
        conversation.push(p.format_assistant_turn(&response));
        for call in &response.tool_calls {
            conversation.push(p.format_tool_result(call, "ok"));
        }

        let contents = GeminiProvider::build_contents(&conversation);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][1]["functionCall"]["name"], "list_directory");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(
            contents[2]["parts"][1]["functionResponse"],
            json!({"name": "read_file", "response": {"result": "ok"}})
        );
    }

    #[test]
    fn test_request_includes_system_and_tools() {
        let tools = vec![ToolDefinition {
            name: "read_file".to_string(),
            description: "Read".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let body = provider().build_request("sys", &[ChatMessage::user("hi")], &tools);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "read_file");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn test_no_candidates_is_invalid() {
        let parsed: GenerateResponse = serde_json::from_value(json!({"candidates": []})).unwrap();
        assert!(provider().parse_response(parsed).is_err());
    }
}
