//! Persisted record shapes: workers, tasks and audit events.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Log marker written each time the scheduler restarts a stalled task.
pub const RETRY_MARKER: &str = "[auto-retry]";

/// Log marker written on an explicit requeue. Retries before it no longer count.
pub const REQUEUE_MARKER: &str = "[requeued]";

// ── WorkerDefinition ────────────────────────────────────────────────

/// A registered worker profile.
///
/// Fields this crate does not model are kept in `metadata` and written back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, alias = "desc", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Keywords matched case-insensitively by the router.
    #[serde(default)]
    pub triggers: Vec<String>,
    /// System instructions; `{name}`, `{id}` and `{workspace}` are substituted.
    #[serde(default, alias = "system_prompt")]
    pub instruction_template: String,
    /// Sandbox root. Empty means `<workspace>/<id>`; relative paths are
    /// resolved against the workspace root.
    #[serde(default, alias = "workspace_dir")]
    pub sandbox_root: PathBuf,
    /// Base workers cannot be removed.
    #[serde(default, alias = "is_base")]
    pub protected: bool,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl WorkerDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: None,
            color: None,
            description: None,
            triggers: Vec::new(),
            instruction_template: String::new(),
            sandbox_root: PathBuf::new(),
            protected: false,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_instructions(mut self, template: impl Into<String>) -> Self {
        self.instruction_template = template.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_cosmetics(mut self, icon: impl Into<String>, color: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self.color = Some(color.into());
        self
    }

    pub fn with_sandbox_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sandbox_root = root.into();
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Where this worker's sandbox lives.
    pub fn sandbox_path(&self, workspace_root: &Path) -> PathBuf {
        if self.sandbox_root.as_os_str().is_empty() {
            workspace_root.join(&self.id)
        } else if self.sandbox_root.is_absolute() {
            self.sandbox_root.clone()
        } else {
            workspace_root.join(&self.sandbox_root)
        }
    }

    /// System instructions for a session rooted at `sandbox`.
    pub fn render_instructions(&self, sandbox: &Path) -> String {
        let workspace = sandbox.display().to_string();
        let base = if self.instruction_template.trim().is_empty() {
            format!(
                "You are {}, an autonomous worker. Complete the task you are given using the \
                 available tools, then reply with a short summary of what you did.",
                self.name
            )
        } else {
            self.instruction_template
                .replace("{name}", &self.name)
                .replace("{id}", &self.id)
                .replace("{workspace}", &workspace)
        };
        format!(
            "{base}\n\nYour workspace is {workspace}. All paths are relative to it. \
             Delegated tasks arrive in inbox/ and results belong in output/. \
             When the task is finished, answer without calling any tool."
        )
    }
}

// ── Task ────────────────────────────────────────────────────────────

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a session.
    Pending,
    /// A session was started for it.
    InProgress,
    /// Finished successfully.
    Done,
    /// Failed permanently.
    Error,
    /// Abandoned by a kill or by a caller.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `in_progress -> in_progress` is allowed so annotations can be logged.
    /// Terminal statuses only leave through an explicit requeue.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, InProgress) | (Pending, Cancelled) | (Pending, Error) |
            (InProgress, InProgress) | (InProgress, Done) |
            (InProgress, Error) | (InProgress, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Task priority; the scheduler starts higher priorities first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    #[serde(alias = "medium")]
    Normal,
    High,
    #[serde(alias = "critical")]
    Urgent,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" | "critical" => Ok(Self::Urgent),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Input for [`crate::store::TaskStore::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub assigned_to: String,
    pub priority: TaskPriority,
    pub created_by: String,
}

/// A unit of work assigned to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub assigned_to: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Append-only `[timestamp] message` entries.
    #[serde(default)]
    pub log: Vec<String>,
}

impl Task {
    pub fn new(input: NewTask) -> Self {
        let now = Utc::now();
        let short = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("task-{}", &short[..8]),
            title: input.title,
            description: input.description,
            assigned_to: input.assigned_to,
            priority: input.priority,
            status: TaskStatus::Pending,
            created_by: input.created_by,
            created_at: now,
            updated_at: now,
            log: Vec::new(),
        }
    }

    /// Append a timestamped log entry.
    pub fn append_log(&mut self, message: &str) {
        let now = Utc::now();
        self.log
            .push(format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S"), message));
        self.updated_at = now;
    }

    /// Number of times the scheduler has restarted this task since it was
    /// last requeued.
    pub fn retry_count(&self) -> u32 {
        self.log
            .iter()
            .rev()
            .take_while(|e| !e.contains(REQUEUE_MARKER))
            .filter(|e| e.contains(RETRY_MARKER))
            .count() as u32
    }

    /// Text handed to a session working on this task.
    pub fn prompt(&self) -> String {
        if self.description.trim().is_empty() {
            format!("Task {}: {}", self.id, self.title)
        } else {
            format!("Task {}: {}\n\n{}", self.id, self.title, self.description)
        }
    }
}

// ── Event ───────────────────────────────────────────────────────────

/// Kind of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Warning,
    Error,
    TaskCreated,
    ToolCall,
    InboxCheck,
    SelfImprove,
}

/// One entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
    pub message: String,
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(NewTask {
            title: "Analyse BTC".to_string(),
            description: "Look at signals".to_string(),
            assigned_to: "quant".to_string(),
            priority: TaskPriority::High,
            created_by: "commander".to_string(),
        })
    }

    #[test]
    fn test_valid_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Done));
        assert!(InProgress.can_transition_to(Error));
        assert!(InProgress.can_transition_to(Cancelled));
    }

    #[test]
    fn test_terminal_statuses_do_not_move() {
        use TaskStatus::*;
        for from in [Done, Error, Cancelled] {
            assert!(from.is_terminal());
            for to in [Pending, InProgress, Done, Error, Cancelled] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Done));
    }

    #[test]
    fn test_status_display_round_trips() {
        use TaskStatus::*;
        for status in [Pending, InProgress, Done, Error, Cancelled] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_priority_ordering_and_aliases() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!("medium".parse::<TaskPriority>().unwrap(), TaskPriority::Normal);
        let p: TaskPriority = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(p, TaskPriority::Urgent);
    }

    #[test]
    fn test_task_id_and_retry_count() {
        let mut t = task();
        assert!(t.id.starts_with("task-"));
        assert_eq!(t.id.len(), 13);
        assert_eq!(t.status, TaskStatus::Pending);

        t.append_log("Routed to quant");
        t.append_log(&format!("{RETRY_MARKER} restart 1"));
        t.append_log(&format!("{RETRY_MARKER} restart 2"));
        assert_eq!(t.retry_count(), 2);
        assert!(t.log[0].starts_with('['));

        t.append_log(&format!("{REQUEUE_MARKER} from error: operator"));
        assert_eq!(t.retry_count(), 0);
        t.append_log(&format!("{RETRY_MARKER} restart 1"));
        assert_eq!(t.retry_count(), 1);
        assert!(t.log[0].ends_with("] Routed to quant"));
    }

    #[test]
    fn test_worker_metadata_bag_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "id": "quant",
            "name": "Quant",
            "tier": "specialist",
            "skills": ["python", "stats"],
            "desc": "Numbers",
            "system_prompt": "You are {name}.",
            "is_base": true,
            "triggers": ["trading"]
        });
        let def: WorkerDefinition = serde_json::from_value(raw).unwrap();
        assert!(def.protected);
        assert_eq!(def.description.as_deref(), Some("Numbers"));
        assert_eq!(def.instruction_template, "You are {name}.");
        assert_eq!(def.metadata["tier"], "specialist");
        assert_eq!(def.metadata["skills"][1], "stats");

        let back = serde_json::to_value(&def).unwrap();
        assert_eq!(back["tier"], "specialist");
    }

    #[test]
    fn test_sandbox_path_and_instructions() {
        let ws = Path::new("/ws");
        let def = WorkerDefinition::new("quant", "Quant").with_instructions("I am {name} ({id}).");
        assert_eq!(def.sandbox_path(ws), PathBuf::from("/ws/quant"));
        assert_eq!(
            def.clone().with_sandbox_root("shared/q").sandbox_path(ws),
            PathBuf::from("/ws/shared/q")
        );
        assert_eq!(
            def.clone().with_sandbox_root("/data/q").sandbox_path(ws),
            PathBuf::from("/data/q")
        );

        let text = def.render_instructions(Path::new("/ws/quant"));
        assert!(text.starts_with("I am Quant (quant)."));
        assert!(text.contains("/ws/quant"));
    }
}
