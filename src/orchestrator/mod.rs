//! Session orchestrator.
//!
//! One actor task owns the worker → session table. Callers talk to it through
//! a cloneable [`OrchestratorHandle`]; session tasks report progress over an
//! unbounded event channel and never touch the table themselves.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::error::SessionError;
use crate::llm::LlmProvider;
use crate::store::{EventKind, Task, TaskStatus, TaskStore};
use crate::worker::{
    OutputBuffer, Session, SessionDeps, SessionEvent, SessionEventKind, SessionOutcome,
    SessionStatus, StatusSnapshot,
};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Spawn {
        worker_id: String,
        task: Option<String>,
        linked_task_id: Option<String>,
        reply: oneshot::Sender<Result<StatusSnapshot, SessionError>>,
    },
    Kill {
        worker_id: String,
        reply: oneshot::Sender<()>,
    },
    Status {
        worker_id: String,
        reply: oneshot::Sender<StatusSnapshot>,
    },
    AllStatuses {
        reply: oneshot::Sender<Result<Vec<StatusSnapshot>, SessionError>>,
    },
    Output {
        worker_id: String,
        lines: usize,
        reply: oneshot::Sender<Vec<String>>,
    },
    IsAlive {
        worker_id: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable client of the orchestrator actor.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::OrchestratorClosed)?;
        rx.await.map_err(|_| SessionError::OrchestratorClosed)
    }

    /// Start a session for `worker_id`.
    ///
    /// A worker that already has a live session is left alone and its current
    /// snapshot is returned.
    pub async fn spawn(
        &self,
        worker_id: &str,
        task: Option<String>,
    ) -> Result<StatusSnapshot, SessionError> {
        self.request(|reply| Command::Spawn {
            worker_id: worker_id.to_string(),
            task,
            linked_task_id: None,
            reply,
        })
        .await?
    }

    /// Start a session working on a stored task. The task's status follows the session.
    pub async fn spawn_for_task(&self, task: &Task) -> Result<StatusSnapshot, SessionError> {
        self.request(|reply| Command::Spawn {
            worker_id: task.assigned_to.clone(),
            task: Some(task.prompt()),
            linked_task_id: Some(task.id.clone()),
            reply,
        })
        .await?
    }

    /// Cancel the worker's session, if any. Always acknowledged.
    pub async fn kill(&self, worker_id: &str) -> Result<(), SessionError> {
        self.request(|reply| Command::Kill {
            worker_id: worker_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn status(&self, worker_id: &str) -> Result<StatusSnapshot, SessionError> {
        self.request(|reply| Command::Status {
            worker_id: worker_id.to_string(),
            reply,
        })
        .await
    }

    /// Snapshots for every registered worker, in registration order.
    pub async fn all_statuses(&self) -> Result<Vec<StatusSnapshot>, SessionError> {
        self.request(|reply| Command::AllStatuses { reply }).await?
    }

    /// The last `lines` output lines of the worker's current or last session.
    pub async fn output(&self, worker_id: &str, lines: usize) -> Result<Vec<String>, SessionError> {
        self.request(|reply| Command::Output {
            worker_id: worker_id.to_string(),
            lines,
            reply,
        })
        .await
    }

    pub async fn is_alive(&self, worker_id: &str) -> Result<bool, SessionError> {
        self.request(|reply| Command::IsAlive {
            worker_id: worker_id.to_string(),
            reply,
        })
        .await
    }

    /// Cancel every session and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Per-worker session bookkeeping.
struct Slot {
    status: SessionStatus,
    buffer: OutputBuffer,
    /// Session number of the last spawn.
    pid: u64,
    /// Cancellation token of the live session; `None` when no session runs.
    live: Option<CancellationToken>,
    started_at: Option<DateTime<Utc>>,
    task: Option<String>,
    linked_task_id: Option<String>,
}

impl Slot {
    fn new(buffer_lines: usize) -> Self {
        Self {
            status: SessionStatus::Idle,
            buffer: OutputBuffer::new(buffer_lines),
            pid: 0,
            live: None,
            started_at: None,
            task: None,
            linked_task_id: None,
        }
    }

    fn is_alive(&self) -> bool {
        self.live.is_some()
    }

    fn snapshot(&self, worker_id: &str, tail: usize) -> StatusSnapshot {
        StatusSnapshot {
            worker_id: worker_id.to_string(),
            status: self.status,
            lines: self.buffer.tail(tail),
            alive: self.is_alive(),
            pid: self.pid,
            started_at: self.started_at,
            task: self.task.clone(),
            linked_task_id: self.linked_task_id.clone(),
        }
    }
}

/// The actor owning the session table.
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    deps: SessionDeps,
    config: Arc<OrchestratorConfig>,
    slots: HashMap<String, Slot>,
    next_pid: u64,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Orchestrator {
    /// Spawn the actor and return its handle.
    pub fn start(
        store: Arc<dyn TaskStore>,
        provider: Arc<dyn LlmProvider>,
        config: OrchestratorConfig,
    ) -> OrchestratorHandle {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events) = mpsc::unbounded_channel();
        let config = Arc::new(config);

        let actor = Self {
            store: store.clone(),
            deps: SessionDeps {
                provider,
                store,
                config: config.clone(),
                events: events_tx,
            },
            config,
            slots: HashMap::new(),
            next_pid: 0,
            commands,
            events,
        };
        tokio::spawn(actor.run());

        OrchestratorHandle { tx }
    }

    async fn run(mut self) {
        tracing::info!(
            workspace = %self.config.workspace_root.display(),
            max_rounds = self.config.max_rounds,
            "Orchestrator ready"
        );

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.cancel_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.cancel_all();
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
            }
        }

        tracing::info!("Orchestrator stopped");
    }

    fn slot(&mut self, worker_id: &str) -> &mut Slot {
        let lines = self.config.output_buffer_lines;
        self.slots
            .entry(worker_id.to_string())
            .or_insert_with(|| Slot::new(lines))
    }

    fn snapshot(&self, worker_id: &str) -> StatusSnapshot {
        let tail = self.config.status_tail_lines;
        match self.slots.get(worker_id) {
            Some(slot) => slot.snapshot(worker_id, tail),
            None => Slot::new(1).snapshot(worker_id, tail),
        }
    }

    fn cancel_all(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(token) = slot.live.take() {
                token.cancel();
                slot.status = SessionStatus::Idle;
            }
        }
    }

    async fn audit(&self, worker_id: &str, message: &str, kind: EventKind) {
        if let Err(e) = self.store.append_event(worker_id, message, kind).await {
            tracing::warn!(worker_id, error = %e, "Failed to record event");
        }
    }

    async fn annotate_task(&self, task_id: &str, status: TaskStatus, note: &str) {
        if let Err(e) = self
            .store
            .update_task_status(task_id, status, Some(note))
            .await
        {
            tracing::warn!(task_id, %status, error = %e, "Failed to update linked task");
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Spawn {
                worker_id,
                task,
                linked_task_id,
                reply,
            } => {
                let result = self.spawn(&worker_id, task, linked_task_id).await;
                let _ = reply.send(result);
            }
            Command::Kill { worker_id, reply } => {
                self.kill(&worker_id).await;
                let _ = reply.send(());
            }
            Command::Status { worker_id, reply } => {
                let _ = reply.send(self.snapshot(&worker_id));
            }
            Command::AllStatuses { reply } => {
                let result = match self.store.list_workers().await {
                    Ok(workers) => Ok(workers.iter().map(|w| self.snapshot(&w.id)).collect()),
                    Err(e) => Err(SessionError::Store(e)),
                };
                let _ = reply.send(result);
            }
            Command::Output {
                worker_id,
                lines,
                reply,
            } => {
                let out = self
                    .slots
                    .get(&worker_id)
                    .map(|s| s.buffer.tail(lines))
                    .unwrap_or_default();
                let _ = reply.send(out);
            }
            Command::IsAlive { worker_id, reply } => {
                let alive = self.slots.get(&worker_id).is_some_and(Slot::is_alive);
                let _ = reply.send(alive);
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn spawn(
        &mut self,
        worker_id: &str,
        task: Option<String>,
        linked_task_id: Option<String>,
    ) -> Result<StatusSnapshot, SessionError> {
        if self.slots.get(worker_id).is_some_and(Slot::is_alive) {
            tracing::debug!(worker_id, "Spawn ignored, session already live");
            return Ok(self.snapshot(worker_id));
        }

        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| SessionError::UnknownWorker(worker_id.to_string()))?;

        self.next_pid += 1;
        let pid = self.next_pid;
        let token = CancellationToken::new();
        let prompt = task.unwrap_or_else(|| self.config.default_task.clone());

        let slot = self.slot(worker_id);
        slot.buffer.clear();
        slot.status = SessionStatus::Thinking;
        slot.pid = pid;
        slot.live = Some(token.clone());
        slot.started_at = Some(Utc::now());
        slot.task = Some(prompt.clone());
        slot.linked_task_id = linked_task_id.clone();

        if let Some(task_id) = &linked_task_id {
            self.annotate_task(
                task_id,
                TaskStatus::InProgress,
                &format!("Session #{pid} started on {worker_id}"),
            )
            .await;
        }
        self.audit(worker_id, &format!("Session #{pid} started"), EventKind::Info)
            .await;
        tracing::info!(worker_id, session = pid, task_id = ?linked_task_id, "Spawning session");

        let session = Session::new(worker, pid, prompt, token, self.deps.clone());
        tokio::spawn(session.run());

        Ok(self.snapshot(worker_id))
    }

    async fn kill(&mut self, worker_id: &str) {
        let Some(slot) = self.slots.get_mut(worker_id) else {
            tracing::debug!(worker_id, "Kill for worker without session");
            return;
        };
        let Some(token) = slot.live.take() else {
            slot.status = SessionStatus::Idle;
            return;
        };

        token.cancel();
        slot.status = SessionStatus::Idle;
        slot.buffer.push("Session killed");
        let pid = slot.pid;
        let linked = slot.linked_task_id.clone();

        tracing::info!(worker_id, session = pid, "Session killed");
        if let Some(task_id) = linked {
            self.annotate_task(&task_id, TaskStatus::Cancelled, "Session killed")
                .await;
        }
        self.audit(worker_id, &format!("Session #{pid} killed"), EventKind::Warning)
            .await;
    }

    // ── Session events ──────────────────────────────────────────────

    async fn handle_event(&mut self, event: SessionEvent) {
        let Some(slot) = self.slots.get_mut(&event.worker_id) else {
            return;
        };
        // Late events of killed or superseded sessions are dropped.
        if !slot.is_alive() || slot.pid != event.generation {
            tracing::trace!(worker_id = %event.worker_id, session = event.generation, "Stale session event");
            return;
        }

        match event.kind {
            SessionEventKind::Status(status) => {
                if slot.status.can_transition_to(status) {
                    slot.status = status;
                }
            }
            SessionEventKind::Line(text) => slot.buffer.push_text(&text),
            SessionEventKind::Finished(outcome) => {
                slot.live = None;
                slot.status = outcome.status();
                let linked = slot.linked_task_id.clone();
                self.finish(&event.worker_id, event.generation, outcome, linked)
                    .await;
            }
        }
    }

    async fn finish(
        &mut self,
        worker_id: &str,
        pid: u64,
        outcome: SessionOutcome,
        linked_task_id: Option<String>,
    ) {
        let (task_update, event) = match &outcome {
            SessionOutcome::Done { rounds, summary } => (
                Some((
                    TaskStatus::Done,
                    format!("Completed in {rounds} rounds: {}", clip(summary, 200)),
                )),
                (format!("Session #{pid} completed ({rounds} rounds)"), EventKind::Info),
            ),
            SessionOutcome::NeedsContinuation { rounds } => (
                Some((
                    TaskStatus::InProgress,
                    format!("round limit reached after {rounds} rounds"),
                )),
                (format!("Session #{pid} reached the round limit"), EventKind::Warning),
            ),
            SessionOutcome::Error(e) => (
                Some((
                    TaskStatus::InProgress,
                    format!("provider error, will retry: {}", clip(e, 200)),
                )),
                (format!("Session #{pid} error: {}", clip(e, 200)), EventKind::Error),
            ),
            SessionOutcome::Cancelled => (None, (format!("Session #{pid} cancelled"), EventKind::Info)),
        };

        self.slot(worker_id)
            .buffer
            .push(&format!("Session finished: {}", outcome.status()));

        if let (Some(task_id), Some((status, note))) = (linked_task_id, task_update) {
            self.annotate_task(&task_id, status, &note).await;
        }
        self.audit(worker_id, &event.0, event.1).await;
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::llm::{ScriptStep, ScriptedProvider};
    use crate::store::{MemoryStore, NewTask, TaskPriority, WorkerDefinition};
    use serde_json::json;

    async fn setup(
        provider: ScriptedProvider,
        max_rounds: usize,
    ) -> (tempfile::TempDir, Arc<MemoryStore>, OrchestratorHandle) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .register_worker(WorkerDefinition::new("engineer", "Engineer"))
            .await
            .unwrap();
        let config = OrchestratorConfig {
            workspace_root: dir.path().to_path_buf(),
            max_rounds,
            ..OrchestratorConfig::default()
        };
        let handle = Orchestrator::start(store.clone(), Arc::new(provider), config);
        (dir, store, handle)
    }

    async fn wait_until_dead(handle: &OrchestratorHandle, worker_id: &str) {
        for _ in 0..200 {
            if !handle.is_alive(worker_id).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session for {worker_id} never finished");
    }

    async fn in_progress_task(store: &MemoryStore) -> Task {
        let task = store
            .create_task(NewTask {
                title: "Fix the build".to_string(),
                description: String::new(),
                assigned_to: "engineer".to_string(),
                priority: TaskPriority::Normal,
                created_by: "commander".to_string(),
            })
            .await
            .unwrap();
        store
            .update_task_status(&task.id, TaskStatus::InProgress, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_unknown_worker() {
        let (_dir, _store, handle) = setup(ScriptedProvider::new(vec![]), 3).await;
        let err = handle.spawn("ghost", None).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownWorker(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_spawn_while_busy_returns_snapshot() {
        let provider = ScriptedProvider::repeating(ScriptStep::text("slow"))
            .with_delay(Duration::from_secs(30));
        let (_dir, _store, handle) = setup(provider, 3).await;

        let first = handle.spawn("engineer", Some("one".to_string())).await.unwrap();
        assert!(first.alive);
        assert_eq!(first.pid, 1);

        let second = handle.spawn("engineer", Some("two".to_string())).await.unwrap();
        assert_eq!(second.pid, 1);
        assert_eq!(second.task.as_deref(), Some("one"));

        handle.kill("engineer").await.unwrap();
        let after = handle.status("engineer").await.unwrap();
        assert!(!after.alive);
        assert_eq!(after.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_kill_idle_and_unknown_is_acknowledged() {
        let (_dir, _store, handle) = setup(ScriptedProvider::new(vec![]), 3).await;
        handle.kill("engineer").await.unwrap();
        handle.kill("nobody").await.unwrap();
        assert!(!handle.is_alive("engineer").await.unwrap());
        assert_eq!(handle.status("nobody").await.unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_task_session_marks_task_done() {
        let provider = ScriptedProvider::new(vec![
            ScriptStep::tool_call("list_directory", json!({})),
            ScriptStep::text("All fixed."),
        ]);
        let (_dir, store, handle) = setup(provider, 5).await;
        let task = in_progress_task(&store).await;

        let snap = handle.spawn_for_task(&task).await.unwrap();
        assert_eq!(snap.linked_task_id.as_deref(), Some(task.id.as_str()));
        wait_until_dead(&handle, "engineer").await;

        let status = handle.status("engineer").await.unwrap();
        assert_eq!(status.status, SessionStatus::Done);
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Done);
        assert!(stored.log.iter().any(|l| l.contains("All fixed.")));

        let output = handle.output("engineer", 100).await.unwrap();
        assert!(output.iter().any(|l| l.contains("[Tool: list_directory]")));
        assert!(output.last().unwrap().contains("Session finished: done"));
    }

    #[tokio::test]
    async fn test_round_limit_keeps_task_in_progress() {
        let provider =
            ScriptedProvider::repeating(ScriptStep::tool_call("list_directory", json!({})));
        let (_dir, store, handle) = setup(provider, 2).await;
        let task = in_progress_task(&store).await;

        handle.spawn_for_task(&task).await.unwrap();
        wait_until_dead(&handle, "engineer").await;

        assert_eq!(
            handle.status("engineer").await.unwrap().status,
            SessionStatus::NeedsContinuation
        );
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert!(stored.log.last().unwrap().contains("round limit reached"));
    }

    #[tokio::test]
    async fn test_kill_cancels_linked_task_and_drops_late_events() {
        let provider = ScriptedProvider::repeating(ScriptStep::text("late"))
            .with_delay(Duration::from_millis(200));
        let (_dir, store, handle) = setup(provider, 3).await;
        let task = in_progress_task(&store).await;

        handle.spawn_for_task(&task).await.unwrap();
        handle.kill("engineer").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snap = handle.status("engineer").await.unwrap();
        assert_eq!(snap.status, SessionStatus::Idle);
        assert!(!snap.alive);
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_all_statuses_and_shutdown() {
        let (_dir, _store, handle) = setup(ScriptedProvider::new(vec![]), 3).await;
        let all = handle.all_statuses().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].worker_id, "engineer");

        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            handle.is_alive("engineer").await,
            Err(SessionError::OrchestratorClosed)
        ));
    }
}
