//! Deterministic in-process provider.
//!
//! Replays a fixed script of responses and failures and records every
//! request it receives. Used by the test suite and for dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{
    CallIdSequence, ChatMessage, ChatResponse, LlmProvider, ToolCall, ToolDefinition,
};

const PROVIDER: &str = "scripted";

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(ChatResponse),
    Fail(String),
}

impl ScriptStep {
    /// A reply with text and no tool calls, which ends the session.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Respond(ChatResponse::text(text))
    }

    /// A reply requesting one tool call. The id is assigned on delivery.
    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self::Respond(ChatResponse::with_tool_calls(
            "",
            vec![ToolCall {
                id: String::new(),
                name: name.into(),
                arguments,
            }],
        ))
    }

    /// A provider failure.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Fail(reason.into())
    }
}

/// What the provider was asked.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub system: String,
    pub conversation: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

struct ScriptState {
    steps: VecDeque<ScriptStep>,
    requests: Vec<RecordedRequest>,
}

/// Provider that replays a script.
pub struct ScriptedProvider {
    state: Mutex<ScriptState>,
    /// Used once the script is exhausted.
    fallback: ScriptStep,
    delay: Duration,
    ids: CallIdSequence,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                steps: steps.into(),
                requests: Vec::new(),
            }),
            fallback: ScriptStep::text("Done."),
            delay: Duration::ZERO,
            ids: CallIdSequence::new("scripted"),
        }
    }

    /// A provider that gives the same reply forever.
    pub fn repeating(step: ScriptStep) -> Self {
        Self::new(Vec::new()).with_fallback(step)
    }

    /// Reply used after the script runs out.
    pub fn with_fallback(mut self, step: ScriptStep) -> Self {
        self.fallback = step;
        self
    }

    /// Wait this long before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of chat calls received so far.
    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        system: &str,
        conversation: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, LlmError> {
        let step = {
            let mut state = self.lock();
            state.requests.push(RecordedRequest {
                system: system.to_string(),
                conversation: conversation.to_vec(),
                tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            });
            state
                .steps
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match step {
            ScriptStep::Respond(mut response) => {
                for call in &mut response.tool_calls {
                    if call.id.is_empty() {
                        call.id = self.ids.next_id();
                    }
                }
                Ok(response)
            }
            ScriptStep::Fail(reason) => Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason,
            }),
        }
    }
}
