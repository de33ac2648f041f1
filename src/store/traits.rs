//! Backend-agnostic store trait.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::store::model::{Event, EventKind, NewTask, Task, TaskStatus, WorkerDefinition};

/// Worker roster, task records and audit trail.
///
/// Implementations provide their own locking; callers may share one store
/// across the orchestrator, the scheduler and the commander.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ==================== Workers ====================

    async fn get_worker(&self, id: &str) -> Result<Option<WorkerDefinition>, DatabaseError>;

    /// All workers in registration order.
    async fn list_workers(&self) -> Result<Vec<WorkerDefinition>, DatabaseError>;

    /// Register a new worker. Fails if the id is taken.
    async fn register_worker(&self, worker: WorkerDefinition) -> Result<(), DatabaseError>;

    /// Replace an existing worker definition, keeping its registration position.
    async fn update_worker(&self, worker: WorkerDefinition) -> Result<(), DatabaseError>;

    /// Remove a worker. Protected workers are refused.
    async fn remove_worker(&self, id: &str) -> Result<(), DatabaseError>;

    // ==================== Tasks ====================

    async fn create_task(&self, task: NewTask) -> Result<Task, DatabaseError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Tasks in creation order, optionally filtered by status.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, DatabaseError>;

    async fn list_pending_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        self.list_tasks(Some(TaskStatus::Pending)).await
    }

    /// Move a task to `status`, appending `log_entry` if given.
    ///
    /// Fails with `InvalidTransition` when the status machine forbids the move.
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        log_entry: Option<&str>,
    ) -> Result<Task, DatabaseError>;

    /// Explicitly put a task back to `pending`, from any status.
    async fn requeue_task(&self, id: &str, reason: &str) -> Result<Task, DatabaseError>;

    /// Append a log entry without changing the status.
    async fn append_task_log(&self, id: &str, entry: &str) -> Result<Task, DatabaseError>;

    // ==================== Events ====================

    async fn append_event(
        &self,
        worker_id: &str,
        message: &str,
        kind: EventKind,
    ) -> Result<Event, DatabaseError>;

    /// Most recent events, oldest first.
    async fn list_events(&self, limit: usize) -> Result<Vec<Event>, DatabaseError>;

    /// Total events recorded since the store was created.
    async fn event_count(&self) -> Result<u64, DatabaseError>;
}
