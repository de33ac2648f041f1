//! Commander: routes incoming work to workers and records it as tasks.
//!
//! - `router`: trigger scoring
//! - `synth`: new worker definitions from unmatched text
//! - `inbox`: task delivery into worker sandboxes

pub mod inbox;
pub mod router;
pub mod synth;

pub use router::{RouteDecision, route};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::RouterConfig;
use crate::error::{DatabaseError, Error};
use crate::store::{EventKind, NewTask, Task, TaskPriority, TaskStore, WorkerDefinition};

/// Worker id recorded as the creator of delegated tasks.
pub const COMMANDER_ID: &str = "commander";

/// Registration attempts before synthesis gives up on finding a free id.
const SYNTH_ATTEMPTS: usize = 8;

/// Result of [`Commander::delegate`].
#[derive(Debug, Clone)]
pub struct Delegation {
    pub task: Task,
    pub decision: RouteDecision,
    /// Set when a worker was synthesized for this task.
    pub synthesized: Option<WorkerDefinition>,
}

pub struct Commander {
    store: Arc<dyn TaskStore>,
    config: RouterConfig,
    workspace_root: PathBuf,
}

impl Commander {
    pub fn new(
        store: Arc<dyn TaskStore>,
        config: RouterConfig,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            config,
            workspace_root: workspace_root.into(),
        }
    }

    /// Route `text` against the current roster.
    pub async fn route(&self, text: &str) -> Result<RouteDecision, Error> {
        let workers = self.store.list_workers().await?;
        Ok(route(text, &workers, &self.config.fallback_worker))
    }

    /// Create and register a new worker for `text`.
    ///
    /// Returns `None` when the text has no usable keywords. Every call mints a
    /// fresh worker; an existing id gets a numeric suffix. An id registered
    /// concurrently by someone else is skipped and the next suffix tried.
    pub async fn synthesize_worker(&self, text: &str) -> Result<Option<WorkerDefinition>, Error> {
        let mut taken: HashSet<String> = self
            .store
            .list_workers()
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect();

        let mut registered = None;
        for _ in 0..SYNTH_ATTEMPTS {
            let Some(worker) = synth::synthesize(text, self.config.synth_keyword_count, |id| {
                taken.contains(id)
            }) else {
                return Ok(None);
            };
            match self.store.register_worker(worker.clone()).await {
                Ok(()) => {
                    registered = Some(worker);
                    break;
                }
                Err(DatabaseError::Constraint(_)) => {
                    tracing::debug!(worker_id = %worker.id, "Synthesized id taken, trying next");
                    taken.insert(worker.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let Some(worker) = registered else {
            return Err(DatabaseError::Constraint(format!(
                "no free worker id after {SYNTH_ATTEMPTS} attempts"
            ))
            .into());
        };

        inbox::scaffold(&worker.sandbox_path(&self.workspace_root), &worker).await?;
        self.store
            .append_event(
                &worker.id,
                &format!("New worker synthesized: {}", worker.name),
                EventKind::Info,
            )
            .await?;
        tracing::info!(worker_id = %worker.id, triggers = ?worker.triggers, "Synthesized worker");

        Ok(Some(worker))
    }

    /// Route a piece of work, record it as a pending task and deliver it to
    /// the chosen worker's inbox.
    pub async fn delegate(
        &self,
        title: &str,
        description: &str,
        priority: TaskPriority,
    ) -> Result<Delegation, Error> {
        let text = format!("{title} {description}");
        let mut decision = self.route(&text).await?;
        let mut synthesized = None;

        if decision.score == 0 && self.config.auto_create_workers {
            if let Some(worker) = self.synthesize_worker(&text).await? {
                decision = RouteDecision {
                    worker_id: worker.id.clone(),
                    worker_name: worker.name.clone(),
                    score: 0,
                };
                synthesized = Some(worker);
            }
        }

        let mut task = self
            .store
            .create_task(NewTask {
                title: title.to_string(),
                description: description.to_string(),
                assigned_to: decision.worker_id.clone(),
                priority,
                created_by: COMMANDER_ID.to_string(),
            })
            .await?;

        let note = match (&synthesized, decision.score) {
            (Some(w), _) => format!("No trigger matched, created worker {}", w.id),
            (None, 0) => format!("No trigger matched, assigned to {}", decision.worker_id),
            (None, score) => format!("Routed to {} (score {score})", decision.worker_id),
        };
        task = self.store.append_task_log(&task.id, &note).await?;

        if self.config.deliver_to_inbox {
            match self.store.get_worker(&decision.worker_id).await? {
                Some(worker) => {
                    let sandbox = worker.sandbox_path(&self.workspace_root);
                    if let Err(e) = inbox::deliver(&sandbox, &task).await {
                        tracing::warn!(task_id = %task.id, error = %e, "Inbox delivery failed");
                    }
                }
                None => {
                    tracing::warn!(worker_id = %decision.worker_id, "Fallback worker is not registered");
                }
            }
        }

        self.store
            .append_event(
                &decision.worker_id,
                &format!(
                    "Task assigned (score {}): {}",
                    decision.score,
                    title.chars().take(60).collect::<String>()
                ),
                EventKind::TaskCreated,
            )
            .await?;
        tracing::info!(
            task_id = %task.id,
            worker_id = %decision.worker_id,
            score = decision.score,
            "Task delegated"
        );

        Ok(Delegation {
            task,
            decision,
            synthesized,
        })
    }
}
