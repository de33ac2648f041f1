//! Per-session execution loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::llm::{ChatMessage, LlmProvider};
use crate::store::{EventKind, TaskStore, WorkerDefinition};
use crate::tools::{Sandbox, ToolRegistry};
use crate::worker::state::{SessionStatus, infer_status, tool_status};

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// The model answered without calling a tool.
    Done { rounds: usize, summary: String },
    /// The round cap ran out while the model still wanted tools.
    NeedsContinuation { rounds: usize },
    /// The provider (or sandbox setup) failed.
    Error(String),
    /// The session's token was cancelled.
    Cancelled,
}

impl SessionOutcome {
    /// Final session status for this outcome.
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Done { .. } => SessionStatus::Done,
            Self::NeedsContinuation { .. } => SessionStatus::NeedsContinuation,
            Self::Error(_) => SessionStatus::Error,
            Self::Cancelled => SessionStatus::Idle,
        }
    }
}

/// Progress reported by a session task to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    Status(SessionStatus),
    /// Raw progress text; may span several lines.
    Line(String),
    Finished(SessionOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub worker_id: String,
    /// Session number the event belongs to. Stale numbers are ignored.
    pub generation: u64,
    pub kind: SessionEventKind,
}

/// Shared dependencies for session execution.
#[derive(Clone)]
pub struct SessionDeps {
    pub provider: Arc<dyn LlmProvider>,
    pub store: Arc<dyn TaskStore>,
    pub config: Arc<OrchestratorConfig>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// One run of a worker against one task.
pub struct Session {
    worker: WorkerDefinition,
    generation: u64,
    task: String,
    token: CancellationToken,
    deps: SessionDeps,
}

impl Session {
    pub fn new(
        worker: WorkerDefinition,
        generation: u64,
        task: String,
        token: CancellationToken,
        deps: SessionDeps,
    ) -> Self {
        Self {
            worker,
            generation,
            task,
            token,
            deps,
        }
    }

    fn emit(&self, kind: SessionEventKind) {
        // The orchestrator may already be gone during shutdown.
        let _ = self.deps.events.send(SessionEvent {
            worker_id: self.worker.id.clone(),
            generation: self.generation,
            kind,
        });
    }

    fn status(&self, status: SessionStatus) {
        self.emit(SessionEventKind::Status(status));
    }

    fn line(&self, line: impl Into<String>) {
        self.emit(SessionEventKind::Line(line.into()));
    }

    async fn audit(&self, message: &str, kind: EventKind) {
        if let Err(e) = self
            .deps
            .store
            .append_event(&self.worker.id, message, kind)
            .await
        {
            tracing::warn!(worker_id = %self.worker.id, error = %e, "Failed to record event");
        }
    }

    /// Run the session to completion and report the outcome.
    pub async fn run(self) -> SessionOutcome {
        tracing::info!(
            worker_id = %self.worker.id,
            session = self.generation,
            "Session starting"
        );

        let outcome = self.execute().await;

        match &outcome {
            SessionOutcome::Done { rounds, .. } => {
                tracing::info!(worker_id = %self.worker.id, rounds, "Session completed");
            }
            SessionOutcome::NeedsContinuation { rounds } => {
                tracing::warn!(worker_id = %self.worker.id, rounds, "Session hit the round cap");
            }
            SessionOutcome::Error(e) => {
                tracing::error!(worker_id = %self.worker.id, error = %e, "Session failed");
            }
            SessionOutcome::Cancelled => {
                tracing::debug!(worker_id = %self.worker.id, "Session cancelled");
            }
        }

        self.emit(SessionEventKind::Finished(outcome.clone()));
        outcome
    }

    async fn execute(&self) -> SessionOutcome {
        let config = &self.deps.config;
        let provider = &self.deps.provider;

        let root = self.worker.sandbox_path(&config.workspace_root);
        let sandbox = match Sandbox::new(&root, config.limits.clone()) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.line(format!("Sandbox unavailable: {e}"));
                return SessionOutcome::Error(e.to_string());
            }
        };
        let system = self.worker.render_instructions(sandbox.root());
        let registry = ToolRegistry::for_sandbox(sandbox);
        let tools = registry.tool_definitions();

        let mut conversation = vec![ChatMessage::user(self.task.clone())];
        self.line(format!(
            "Session #{} started: {}",
            self.generation,
            clip(&self.task, 120)
        ));

        for round in 1..=config.max_rounds {
            if self.token.is_cancelled() {
                return SessionOutcome::Cancelled;
            }
            self.status(SessionStatus::Thinking);
            tracing::debug!(worker_id = %self.worker.id, round, "Requesting completion");

            let response = tokio::select! {
                biased;
                _ = self.token.cancelled() => return SessionOutcome::Cancelled,
                r = provider.chat(&system, &conversation, &tools) => r,
            };
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    self.line(format!("Provider error: {e}"));
                    return SessionOutcome::Error(e.to_string());
                }
            };

            conversation.push(provider.format_assistant_turn(&response));

            if !response.text.trim().is_empty() {
                self.status(infer_status(&response.text));
                self.line(response.text.clone());
            }

            if !response.has_tool_calls() {
                return SessionOutcome::Done {
                    rounds: round,
                    summary: response.text,
                };
            }

            for call in &response.tool_calls {
                if self.token.is_cancelled() {
                    return SessionOutcome::Cancelled;
                }
                let args = call.arguments.to_string();
                self.status(tool_status(&call.name));
                self.line(format!("[Tool: {}] {}", call.name, clip(&args, 150)));
                tracing::debug!(worker_id = %self.worker.id, round, tool = %call.name, "Running tool");

                let result = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return SessionOutcome::Cancelled,
                    r = registry.execute(&call.name, call.arguments.clone()) => r,
                };

                self.line(format!("  → {}", clip(&result.replace('\n', " "), 200)));
                self.audit(
                    &format!("{}: {}", call.name, clip(&args, 60)),
                    EventKind::ToolCall,
                )
                .await;
                conversation.push(provider.format_tool_result(call, &result));
            }
        }

        SessionOutcome::NeedsContinuation {
            rounds: config.max_rounds,
        }
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
