//! Session state machine and observability helpers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session, or the session was killed.
    Idle,
    /// Waiting on the provider.
    Thinking,
    Searching,
    Planning,
    Coding,
    Working,
    /// The model stopped calling tools.
    Done,
    /// The provider failed.
    Error,
    /// The round cap ran out with work remaining.
    NeedsContinuation,
}

impl SessionStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;

        match self {
            Idle => matches!(target, Thinking),
            // Running sessions move freely, including to idle on kill.
            Thinking | Searching | Planning | Coding | Working => true,
            Done | Error | NeedsContinuation => matches!(target, Thinking | Idle),
        }
    }

    /// A session that will not change state on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::NeedsContinuation)
    }

    /// A session that is still running rounds.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != Self::Idle
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Searching => "searching",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Working => "working",
            Self::Done => "done",
            Self::Error => "error",
            Self::NeedsContinuation => "needs_continuation",
        };
        write!(f, "{s}")
    }
}

/// Coarse display status for a piece of model text. Never drives control flow.
pub fn infer_status(text: &str) -> SessionStatus {
    let t = text.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| t.contains(w));

    if any(&["analy", "think", "consider", "evaluat", "analiz", "düşün", "incele"]) {
        SessionStatus::Thinking
    } else if any(&["plan", "strateg", "design", "strateji", "tasarla"]) {
        SessionStatus::Planning
    } else if any(&["code", "implement", "write", "creat", "kod", "yaz", "oluştur"]) {
        SessionStatus::Coding
    } else if any(&["search", "find", "look", "ara", "bul", "tara"]) {
        SessionStatus::Searching
    } else {
        SessionStatus::Working
    }
}

/// Display status while a tool runs.
pub fn tool_status(tool_name: &str) -> SessionStatus {
    match tool_name {
        "read_file" | "list_directory" | "search_code" => SessionStatus::Searching,
        "write_file" => SessionStatus::Coding,
        _ => SessionStatus::Working,
    }
}

/// Fixed-capacity log of progress lines; the oldest line is evicted first.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    /// Maximum characters kept per line.
    const MAX_LINE_CHARS: usize = 200;

    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append one `[HH:MM:SS] ...` line.
    pub fn push(&mut self, line: &str) {
        let trimmed: String = line.trim().chars().take(Self::MAX_LINE_CHARS).collect();
        let stamped = format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), trimmed);
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(stamped);
    }

    /// Append every non-empty line of `text`.
    pub fn push_text(&mut self, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.push(line);
        }
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Point-in-time view of a worker's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub worker_id: String,
    pub status: SessionStatus,
    /// Most recent output lines.
    pub lines: Vec<String>,
    pub alive: bool,
    /// Session number; increases with every spawn.
    pub pid: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub task: Option<String>,
    pub linked_task_id: Option<String>,
}
