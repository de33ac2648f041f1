//! Configuration types.
//!
//! Every struct has a `Default` matching the production constants and a
//! `from_env()` constructor that overrides individual fields from
//! `TASKFORCE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::LlmConfig;
use crate::store::EventKind;

/// Read an environment variable and parse it, falling back to `default` when unset.
pub(crate) fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Read an optional string environment variable (empty counts as unset).
pub(crate) fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Hard ceilings applied by every sandbox.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Largest file that may be read or written, in bytes.
    pub max_file_bytes: u64,
    /// Maximum stdout characters returned from a command.
    pub max_output_chars: usize,
    /// Maximum stderr characters returned from a command.
    pub max_stderr_chars: usize,
    /// Wall-clock limit for a single command.
    pub command_timeout: Duration,
    /// Maximum matches returned by a search.
    pub max_search_matches: usize,
    /// Maximum characters of a matching line shown in search results.
    pub search_preview_chars: usize,
    /// Maximum entries returned by a directory listing.
    pub max_list_entries: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 50_000,
            max_output_chars: 10_000,
            max_stderr_chars: 2_000,
            command_timeout: Duration::from_secs(30),
            max_search_matches: 30,
            search_preview_chars: 120,
            max_list_entries: 100,
        }
    }
}

impl SandboxLimits {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_file_bytes: env_or("TASKFORCE_MAX_FILE_BYTES", defaults.max_file_bytes)?,
            command_timeout: Duration::from_secs(env_or(
                "TASKFORCE_COMMAND_TIMEOUT_SECS",
                defaults.command_timeout.as_secs(),
            )?),
            ..defaults
        })
    }
}

/// Orchestrator and session settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory under which per-worker sandboxes live.
    pub workspace_root: PathBuf,
    /// Round cap for one session.
    pub max_rounds: usize,
    /// Capacity of each session's output ring buffer.
    pub output_buffer_lines: usize,
    /// Number of output lines included in a status snapshot.
    pub status_tail_lines: usize,
    /// Task given to a session spawned without one.
    pub default_task: String,
    /// Sandbox ceilings.
    pub limits: SandboxLimits,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            max_rounds: 30,
            output_buffer_lines: 500,
            status_tail_lines: 10,
            default_task: "Explore your workspace, summarize what you find, and report what \
                           you would work on next."
                .to_string(),
            limits: SandboxLimits::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            workspace_root: env_opt("TASKFORCE_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            max_rounds: env_or("TASKFORCE_MAX_ROUNDS", defaults.max_rounds)?,
            output_buffer_lines: env_or(
                "TASKFORCE_OUTPUT_BUFFER_LINES",
                defaults.output_buffer_lines,
            )?,
            limits: SandboxLimits::from_env()?,
            ..defaults
        })
    }
}

/// A low-frequency job run by the autonomous loop every `every_ticks` ticks.
#[derive(Debug, Clone)]
pub struct HousekeepingJob {
    /// Short name used in logs.
    pub name: String,
    /// Run on ticks where `tick_count % every_ticks == 0`.
    pub every_ticks: u64,
    /// Worker the job is attributed to.
    pub worker_id: String,
    /// Kind of the audit event recorded when the job fires.
    pub kind: EventKind,
    /// Audit event message.
    pub message: String,
    /// When set, a session is spawned for `worker_id` with this task (if idle).
    pub spawn_task: Option<String>,
}

/// Autonomous scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between ticks.
    pub tick_interval: Duration,
    /// Maximum spawns (new work plus retries) per tick.
    pub max_spawns_per_tick: usize,
    /// Retries allowed before a stalled task is marked `error`.
    pub max_task_retries: u32,
    /// Minimum time since the last update before an in-progress task counts as stalled.
    pub stall_grace: Duration,
    /// Periodic auxiliary jobs.
    pub housekeeping: Vec<HousekeepingJob>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_spawns_per_tick: 3,
            max_task_retries: 5,
            stall_grace: Duration::ZERO,
            housekeeping: vec![
                HousekeepingJob {
                    name: "inbox_check".to_string(),
                    every_ticks: 5,
                    worker_id: "commander".to_string(),
                    kind: EventKind::InboxCheck,
                    message: "Supervisor inbox check".to_string(),
                    spawn_task: None,
                },
                HousekeepingJob {
                    name: "self_review".to_string(),
                    every_ticks: 10,
                    worker_id: "commander".to_string(),
                    kind: EventKind::SelfImprove,
                    message: "Periodic self-review".to_string(),
                    spawn_task: Some(
                        "Review the results in your workspace output/ directory. Write a short \
                         list of what worked, what failed, and one concrete improvement to \
                         output/self_review.md."
                            .to_string(),
                    ),
                },
            ],
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tick_interval: Duration::from_secs(env_or(
                "TASKFORCE_TICK_SECS",
                defaults.tick_interval.as_secs(),
            )?),
            max_spawns_per_tick: env_or(
                "TASKFORCE_MAX_SPAWNS_PER_TICK",
                defaults.max_spawns_per_tick,
            )?,
            max_task_retries: env_or("TASKFORCE_MAX_RETRIES", defaults.max_task_retries)?,
            stall_grace: Duration::from_secs(env_or(
                "TASKFORCE_STALL_GRACE_SECS",
                defaults.stall_grace.as_secs(),
            )?),
            ..defaults
        })
    }
}

/// Router and commander settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Worker chosen when no trigger matches.
    pub fallback_worker: String,
    /// Synthesize a new worker when no trigger matches.
    pub auto_create_workers: bool,
    /// Number of content words used to build a synthesized worker.
    pub synth_keyword_count: usize,
    /// Write delegated tasks into the worker's inbox directory.
    pub deliver_to_inbox: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fallback_worker: "commander".to_string(),
            auto_create_workers: false,
            synth_keyword_count: 3,
            deliver_to_inbox: true,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            fallback_worker: env_opt("TASKFORCE_FALLBACK_WORKER")
                .unwrap_or(defaults.fallback_worker),
            auto_create_workers: env_or(
                "TASKFORCE_AUTO_CREATE_WORKERS",
                defaults.auto_create_workers,
            )?,
            ..defaults
        })
    }
}

/// Everything the binary needs to wire the system together.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
    pub router: RouterConfig,
    /// JSON snapshot file for the in-memory store.
    pub store_path: Option<PathBuf>,
    /// JSON roster of worker definitions loaded at startup.
    pub workers_file: Option<PathBuf>,
    /// Directory for the rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            llm: LlmConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
            router: RouterConfig::from_env()?,
            store_path: env_opt("TASKFORCE_STORE_PATH").map(PathBuf::from),
            workers_file: env_opt("TASKFORCE_WORKERS_FILE").map(PathBuf::from),
            log_dir: env_opt("TASKFORCE_LOG_DIR").map(PathBuf::from),
        })
    }
}
