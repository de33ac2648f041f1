//! In-memory [`TaskStore`] with optional JSON snapshot persistence.
//!
//! Every mutation of workers or tasks rewrites the snapshot file (write to a
//! temp file, then rename). Events are kept in a bounded ring.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::DatabaseError;
use crate::store::model::{
    Event, EventKind, NewTask, REQUEUE_MARKER, Task, TaskStatus, WorkerDefinition,
};
use crate::store::traits::TaskStore;

/// Events retained in memory and in the snapshot.
const MAX_EVENTS: usize = 1000;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    workers: Vec<WorkerDefinition>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    events: VecDeque<Event>,
    #[serde(default)]
    total_events: u64,
}

/// Store kept entirely in memory.
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    path: Option<PathBuf>,
    /// Serializes snapshot writes so the newest state always lands last.
    persist_lock: Mutex<()>,
}

impl MemoryStore {
    /// A store that is never written to disk.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Open a snapshot-backed store, loading the file if it exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            path = %path.display(),
            workers = snapshot.workers.len(),
            tasks = snapshot.tasks.len(),
            "Opened task store"
        );
        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path),
            persist_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<(), DatabaseError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let json = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn task_not_found(id: &str) -> DatabaseError {
        DatabaseError::NotFound {
            entity: "task".to_string(),
            id: id.to_string(),
        }
    }

    fn worker_not_found(id: &str) -> DatabaseError {
        DatabaseError::NotFound {
            entity: "worker".to_string(),
            id: id.to_string(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_worker(&self, id: &str) -> Result<Option<WorkerDefinition>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.workers.iter().find(|w| w.id == id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerDefinition>, DatabaseError> {
        Ok(self.state.read().await.workers.clone())
    }

    async fn register_worker(&self, worker: WorkerDefinition) -> Result<(), DatabaseError> {
        {
            let mut state = self.state.write().await;
            if state.workers.iter().any(|w| w.id == worker.id) {
                return Err(DatabaseError::Constraint(format!(
                    "worker '{}' already exists",
                    worker.id
                )));
            }
            state.workers.push(worker);
        }
        self.persist().await
    }

    async fn update_worker(&self, worker: WorkerDefinition) -> Result<(), DatabaseError> {
        {
            let mut state = self.state.write().await;
            let slot = state
                .workers
                .iter_mut()
                .find(|w| w.id == worker.id)
                .ok_or_else(|| Self::worker_not_found(&worker.id))?;
            *slot = worker;
        }
        self.persist().await
    }

    async fn remove_worker(&self, id: &str) -> Result<(), DatabaseError> {
        {
            let mut state = self.state.write().await;
            let idx = state
                .workers
                .iter()
                .position(|w| w.id == id)
                .ok_or_else(|| Self::worker_not_found(id))?;
            if state.workers[idx].protected {
                return Err(DatabaseError::Constraint(format!(
                    "worker '{id}' is protected and cannot be removed"
                )));
            }
            state.workers.remove(idx);
        }
        self.persist().await
    }

    async fn create_task(&self, input: NewTask) -> Result<Task, DatabaseError> {
        let task = Task::new(input);
        self.state.write().await.tasks.push(task.clone());
        self.persist().await?;
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect())
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        log_entry: Option<&str>,
    ) -> Result<Task, DatabaseError> {
        let updated = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| Self::task_not_found(id))?;

            if !task.status.can_transition_to(status) {
                return Err(DatabaseError::InvalidTransition {
                    id: id.to_string(),
                    from: task.status.to_string(),
                    to: status.to_string(),
                });
            }
            task.status = status;
            task.updated_at = Utc::now();
            if let Some(entry) = log_entry {
                task.append_log(entry);
            }
            task.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    async fn requeue_task(&self, id: &str, reason: &str) -> Result<Task, DatabaseError> {
        let updated = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| Self::task_not_found(id))?;
            let from = task.status;
            task.status = TaskStatus::Pending;
            task.append_log(&format!("{REQUEUE_MARKER} from {from}: {reason}"));
            task.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    async fn append_task_log(&self, id: &str, entry: &str) -> Result<Task, DatabaseError> {
        let updated = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| Self::task_not_found(id))?;
            task.append_log(entry);
            task.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    async fn append_event(
        &self,
        worker_id: &str,
        message: &str,
        kind: EventKind,
    ) -> Result<Event, DatabaseError> {
        let event = {
            let mut state = self.state.write().await;
            state.total_events += 1;
            let event = Event {
                id: state.total_events,
                timestamp: Utc::now(),
                worker_id: worker_id.to_string(),
                message: message.to_string(),
                kind,
            };
            state.events.push_back(event.clone());
            while state.events.len() > MAX_EVENTS {
                state.events.pop_front();
            }
            event
        };
        self.persist().await?;
        Ok(event)
    }

    async fn list_events(&self, limit: usize) -> Result<Vec<Event>, DatabaseError> {
        let state = self.state.read().await;
        let skip = state.events.len().saturating_sub(limit);
        Ok(state.events.iter().skip(skip).cloned().collect())
    }

    async fn event_count(&self) -> Result<u64, DatabaseError> {
        Ok(self.state.read().await.total_events)
    }
}
