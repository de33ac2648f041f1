//! Autonomous scheduler.
//!
//! A fixed-interval loop that starts sessions for pending tasks, restarts
//! stalled ones up to a retry ceiling, and runs periodic housekeeping jobs.
//! Ticks never overlap: timer ticks and manual [`AutonomousLoop::tick`] calls
//! queue on the same lock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Error, SessionError};
use crate::orchestrator::OrchestratorHandle;
use crate::store::{EventKind, RETRY_MARKER, Task, TaskStatus, TaskStore};

/// Worker id the scheduler's own audit events are attributed to.
pub const SCHEDULER_ID: &str = "scheduler";

/// Snapshot returned by [`AutonomousLoop::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatus {
    pub running: bool,
    pub tick_count: u64,
    pub last_tick: Option<DateTime<Utc>>,
    pub total_events: u64,
    pub workers_tracked: usize,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    /// Task ids started for the first time.
    pub spawned: Vec<String>,
    /// Task ids restarted after a stall.
    pub retried: Vec<String>,
    /// Task ids marked `error` after exhausting their retries.
    pub failed: Vec<String>,
    /// Failures that were recorded and skipped.
    pub errors: Vec<String>,
}

#[derive(Default)]
struct Counters {
    tick_count: u64,
    last_tick: Option<DateTime<Utc>>,
}

struct Scheduler {
    store: Arc<dyn TaskStore>,
    orchestrator: OrchestratorHandle,
    config: SchedulerConfig,
    counters: Mutex<Counters>,
    /// Held for the whole of a tick.
    ticking: tokio::sync::Mutex<()>,
}

/// Handle to the scheduler loop.
pub struct AutonomousLoop {
    inner: Arc<Scheduler>,
    runner: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl AutonomousLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        orchestrator: OrchestratorHandle,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Scheduler {
                store,
                orchestrator,
                config,
                counters: Mutex::new(Counters::default()),
                ticking: tokio::sync::Mutex::new(()),
            }),
            runner: Mutex::new(None),
        }
    }

    fn runner(&self) -> std::sync::MutexGuard<'_, Option<(JoinHandle<()>, CancellationToken)>> {
        self.runner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start ticking. Does nothing if already running.
    pub fn start(&self) {
        let mut runner = self.runner();
        if runner.as_ref().is_some_and(|(h, _)| !h.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let handle = tokio::spawn(inner.run(token.clone()));
        *runner = Some((handle, token));
        tracing::info!(
            interval_secs = self.inner.config.tick_interval.as_secs(),
            "Autonomous loop started"
        );
    }

    /// Stop ticking. Does nothing if not running.
    pub fn stop(&self) {
        if let Some((_, token)) = self.runner().take() {
            token.cancel();
            tracing::info!("Autonomous loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner()
            .as_ref()
            .is_some_and(|(h, t)| !h.is_finished() && !t.is_cancelled())
    }

    pub async fn status(&self) -> Result<LoopStatus, Error> {
        let (tick_count, last_tick) = {
            let c = self.inner.counters();
            (c.tick_count, c.last_tick)
        };
        Ok(LoopStatus {
            running: self.is_running(),
            tick_count,
            last_tick,
            total_events: self.inner.store.event_count().await?,
            workers_tracked: self.inner.store.list_workers().await?.len(),
        })
    }

    /// Run one tick now, outside the timer. Waits for a running tick to finish first.
    pub async fn tick(&self) -> TickReport {
        self.inner.tick().await
    }
}

impl Drop for AutonomousLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Scheduler {
    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.tick_interval.max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // Skip the immediate first tick

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.errors.is_empty() {
                        tracing::debug!(tick = report.tick, errors = report.errors.len(), "Tick finished with errors");
                    }
                }
            }
        }
    }

    /// Record a failure as a warning event; never propagates.
    async fn record_failure(&self, report: &mut TickReport, worker_id: &str, message: String) {
        tracing::warn!(worker_id, "{}", message);
        if let Err(e) = self
            .store
            .append_event(worker_id, &message, EventKind::Warning)
            .await
        {
            tracing::warn!(error = %e, "Failed to record scheduler warning");
        }
        report.errors.push(message);
    }

    async fn tick(&self) -> TickReport {
        let _ticking = self.ticking.lock().await;
        let tick = {
            let mut c = self.counters();
            c.tick_count += 1;
            c.last_tick = Some(Utc::now());
            c.tick_count
        };
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        let mut busy: HashSet<String> = match self.orchestrator.all_statuses().await {
            Ok(statuses) => statuses
                .into_iter()
                .filter(|s| s.alive)
                .map(|s| s.worker_id)
                .collect(),
            Err(e) => {
                self.record_failure(&mut report, SCHEDULER_ID, format!("Status query failed: {e}"))
                    .await;
                return report;
            }
        };
        if let Err(e) = self
            .store
            .append_event(
                SCHEDULER_ID,
                &format!("Tick {tick}: {} active sessions", busy.len()),
                EventKind::Info,
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to record tick event");
        }

        let mut budget = self.config.max_spawns_per_tick;
        self.start_pending(&mut report, &mut busy, &mut budget).await;
        self.restart_stalled(&mut report, &mut busy, &mut budget).await;
        self.housekeeping(&mut report, &busy, tick).await;

        tracing::debug!(
            tick,
            spawned = report.spawned.len(),
            retried = report.retried.len(),
            failed = report.failed.len(),
            "Tick complete"
        );
        report
    }

    /// Start one pending task per idle worker, highest priority and oldest first.
    async fn start_pending(
        &self,
        report: &mut TickReport,
        busy: &mut HashSet<String>,
        budget: &mut usize,
    ) {
        let mut pending = match self.store.list_pending_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.record_failure(report, SCHEDULER_ID, format!("Listing pending tasks failed: {e}"))
                    .await;
                return;
            }
        };
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        for task in pending {
            if *budget == 0 {
                break;
            }
            if busy.contains(&task.assigned_to) {
                continue;
            }

            // Marked before the spawn so the stall check cannot see it as orphaned.
            let task = match self
                .store
                .update_task_status(&task.id, TaskStatus::InProgress, Some("Picked up by scheduler"))
                .await
            {
                Ok(t) => t,
                Err(e) => {
                    self.record_failure(report, &task.assigned_to, format!("Task {}: {e}", task.id))
                        .await;
                    continue;
                }
            };

            if self.launch(report, &task).await {
                busy.insert(task.assigned_to.clone());
                report.spawned.push(task.id);
                *budget -= 1;
            }
        }
    }

    /// Restart in-progress tasks whose worker has no live session.
    async fn restart_stalled(
        &self,
        report: &mut TickReport,
        busy: &mut HashSet<String>,
        budget: &mut usize,
    ) {
        let in_progress = match self.store.list_tasks(Some(TaskStatus::InProgress)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.record_failure(report, SCHEDULER_ID, format!("Listing tasks failed: {e}"))
                    .await;
                return;
            }
        };
        let now = Utc::now();
        let max = self.config.max_task_retries;

        for task in in_progress {
            if busy.contains(&task.assigned_to) || report.spawned.contains(&task.id) {
                continue;
            }
            let idle_for = (now - task.updated_at).to_std().unwrap_or(Duration::ZERO);
            if idle_for < self.config.stall_grace {
                continue;
            }

            let retries = task.retry_count();
            if retries >= max {
                let note = format!("Retry limit reached ({retries}/{max}), giving up");
                match self
                    .store
                    .update_task_status(&task.id, TaskStatus::Error, Some(&note))
                    .await
                {
                    Ok(_) => {
                        tracing::warn!(task_id = %task.id, worker_id = %task.assigned_to, retries, "Task failed permanently");
                        if let Err(e) = self
                            .store
                            .append_event(
                                &task.assigned_to,
                                &format!("Task {} failed after {retries} retries", task.id),
                                EventKind::Error,
                            )
                            .await
                        {
                            tracing::warn!(error = %e, "Failed to record task failure");
                        }
                        report.failed.push(task.id);
                    }
                    Err(e) => {
                        self.record_failure(report, &task.assigned_to, format!("Task {}: {e}", task.id))
                            .await;
                    }
                }
                continue;
            }

            if *budget == 0 {
                continue;
            }

            if !self.launch(report, &task).await {
                continue;
            }
            busy.insert(task.assigned_to.clone());
            *budget -= 1;

            // Only a session that actually started uses up a retry.
            let note = format!("{RETRY_MARKER} restart {}/{max}", retries + 1);
            if let Err(e) = self.store.append_task_log(&task.id, &note).await {
                self.record_failure(report, &task.assigned_to, format!("Task {}: {e}", task.id))
                    .await;
            }
            tracing::info!(task_id = %task.id, worker_id = %task.assigned_to, attempt = retries + 1, "Restarted stalled task");
            report.retried.push(task.id);
        }
    }

    /// Spawn a session for `task`. Returns whether a new session was started for it.
    async fn launch(&self, report: &mut TickReport, task: &Task) -> bool {
        let previous_pid = match self.orchestrator.status(&task.assigned_to).await {
            Ok(snapshot) => snapshot.pid,
            Err(e) => {
                self.record_failure(report, &task.assigned_to, format!("Spawn for {} failed: {e}", task.id))
                    .await;
                return false;
            }
        };

        match self.orchestrator.spawn_for_task(task).await {
            Ok(snapshot)
                if snapshot.pid != previous_pid
                    && snapshot.linked_task_id.as_deref() == Some(task.id.as_str()) =>
            {
                true
            }
            Ok(_) => {
                // A session was already live for the worker; the task waits for the next tick.
                false
            }
            Err(SessionError::UnknownWorker(worker_id)) => {
                let note = format!("Worker '{worker_id}' is not registered");
                if let Err(e) = self
                    .store
                    .update_task_status(&task.id, TaskStatus::Error, Some(&note))
                    .await
                {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to fail task");
                }
                self.record_failure(report, &worker_id, format!("Task {}: {note}", task.id))
                    .await;
                report.failed.push(task.id.clone());
                false
            }
            Err(e) => {
                self.record_failure(report, &task.assigned_to, format!("Spawn for {} failed: {e}", task.id))
                    .await;
                false
            }
        }
    }

    async fn housekeeping(&self, report: &mut TickReport, busy: &HashSet<String>, tick: u64) {
        for job in &self.config.housekeeping {
            if job.every_ticks == 0 || tick % job.every_ticks != 0 {
                continue;
            }
            tracing::debug!(job = %job.name, tick, "Running housekeeping job");

            if let Err(e) = self
                .store
                .append_event(&job.worker_id, &job.message, job.kind)
                .await
            {
                self.record_failure(report, &job.worker_id, format!("Job {}: {e}", job.name))
                    .await;
                continue;
            }

            if let Some(task) = &job.spawn_task {
                if busy.contains(&job.worker_id) {
                    continue;
                }
                if let Err(e) = self
                    .orchestrator
                    .spawn(&job.worker_id, Some(task.clone()))
                    .await
                {
                    self.record_failure(report, &job.worker_id, format!("Job {}: {e}", job.name))
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HousekeepingJob, OrchestratorConfig};
    use crate::llm::{ScriptStep, ScriptedProvider};
    use crate::orchestrator::Orchestrator;
    use crate::store::{MemoryStore, NewTask, TaskPriority, WorkerDefinition};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        orchestrator: OrchestratorHandle,
        provider: Arc<ScriptedProvider>,
    }

    async fn fixture(provider: ScriptedProvider, workers: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        for id in workers {
            store
                .register_worker(WorkerDefinition::new(*id, *id))
                .await
                .unwrap();
        }
        let provider = Arc::new(provider);
        let config = OrchestratorConfig {
            workspace_root: dir.path().to_path_buf(),
            max_rounds: 2,
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::start(store.clone(), provider.clone(), config);
        Fixture {
            _dir: dir,
            store,
            orchestrator,
            provider,
        }
    }

    fn quiet_config() -> SchedulerConfig {
        SchedulerConfig {
            housekeeping: Vec::new(),
            ..SchedulerConfig::default()
        }
    }

    async fn add_task(store: &MemoryStore, worker: &str, priority: TaskPriority, title: &str) -> Task {
        store
            .create_task(NewTask {
                title: title.to_string(),
                description: String::new(),
                assigned_to: worker.to_string(),
                priority,
                created_by: "commander".to_string(),
            })
            .await
            .unwrap()
    }

    async fn settle(orchestrator: &OrchestratorHandle) {
        for _ in 0..200 {
            let statuses = orchestrator.all_statuses().await.unwrap();
            if statuses.iter().all(|s| !s.alive) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions never settled");
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let f = fixture(ScriptedProvider::new(vec![]), &["a"]).await;
        let auto = AutonomousLoop::new(f.store.clone(), f.orchestrator.clone(), quiet_config());

        assert!(!auto.is_running());
        auto.stop();
        auto.start();
        auto.start();
        assert!(auto.is_running());
        auto.stop();
        auto.stop();
        assert!(!auto.is_running());

        let status = auto.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.workers_tracked, 1);
    }

    #[tokio::test]
    async fn test_one_task_per_worker_by_priority() {
        let provider = ScriptedProvider::repeating(ScriptStep::text("slow"))
            .with_delay(Duration::from_millis(200));
        let f = fixture(provider, &["a"]).await;
        let low = add_task(&f.store, "a", TaskPriority::Low, "low").await;
        let urgent = add_task(&f.store, "a", TaskPriority::Urgent, "urgent").await;

        let auto = AutonomousLoop::new(f.store.clone(), f.orchestrator.clone(), quiet_config());
        let report = auto.tick().await;
        assert_eq!(report.tick, 1);
        assert_eq!(report.spawned, vec![urgent.id.clone()]);

        let low = f.store.get_task(&low.id).await.unwrap().unwrap();
        assert_eq!(low.status, TaskStatus::Pending);
        assert!(f.orchestrator.is_alive("a").await.unwrap());
        f.orchestrator.kill("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_cap_per_tick() {
        let provider = ScriptedProvider::repeating(ScriptStep::text("slow"))
            .with_delay(Duration::from_millis(200));
        let f = fixture(provider, &["a", "b", "c", "d"]).await;
        for w in ["a", "b", "c", "d"] {
            add_task(&f.store, w, TaskPriority::Normal, w).await;
        }

        let auto = AutonomousLoop::new(f.store.clone(), f.orchestrator.clone(), quiet_config());
        let report = auto.tick().await;
        assert_eq!(report.spawned.len(), 3);
        assert_eq!(f.store.list_pending_tasks().await.unwrap().len(), 1);
        for w in ["a", "b", "c", "d"] {
            f.orchestrator.kill(w).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unknown_worker_task_fails() {
        let f = fixture(ScriptedProvider::new(vec![ScriptStep::text("done")]), &["a"]).await;
        let task = add_task(&f.store, "ghost", TaskPriority::Urgent, "orphan").await;
        let valid = add_task(&f.store, "a", TaskPriority::Normal, "real work").await;

        let auto = AutonomousLoop::new(f.store.clone(), f.orchestrator.clone(), quiet_config());
        let report = auto.tick().await;
        assert_eq!(report.failed, vec![task.id.clone()]);
        assert_eq!(report.errors.len(), 1);
        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Error);

        // The failure does not stop the rest of the tick.
        assert_eq!(report.spawned, vec![valid.id.clone()]);
        settle(&f.orchestrator).await;
        assert_eq!(f.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ticks_retry_once() {
        let provider = ScriptedProvider::repeating(ScriptStep::text("slow"))
            .with_delay(Duration::from_millis(300));
        let f = fixture(provider, &["a"]).await;
        let task = add_task(&f.store, "a", TaskPriority::Normal, "stuck").await;
        f.store
            .update_task_status(&task.id, TaskStatus::InProgress, None)
            .await
            .unwrap();

        let auto = AutonomousLoop::new(f.store.clone(), f.orchestrator.clone(), quiet_config());
        let (first, second) = tokio::join!(auto.tick(), auto.tick());

        let retried: Vec<&String> = first.retried.iter().chain(&second.retried).collect();
        assert_eq!(retried, vec![&task.id]);
        assert_ne!(first.tick, second.tick);

        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count(), 1);
        assert_eq!(f.orchestrator.status("a").await.unwrap().pid, 1);
        f.orchestrator.kill("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_live_worker_does_not_consume_retry() {
        let provider = ScriptedProvider::repeating(ScriptStep::text("slow"))
            .with_delay(Duration::from_millis(300));
        let f = fixture(provider, &["a"]).await;
        let task = add_task(&f.store, "a", TaskPriority::Normal, "stuck").await;
        let task = f
            .store
            .update_task_status(&task.id, TaskStatus::InProgress, None)
            .await
            .unwrap();

        // Occupied by a session the scheduler did not start.
        f.orchestrator.spawn("a", Some("other".to_string())).await.unwrap();

        let scheduler = Scheduler {
            store: f.store.clone(),
            orchestrator: f.orchestrator.clone(),
            config: quiet_config(),
            counters: Mutex::new(Counters::default()),
            ticking: tokio::sync::Mutex::new(()),
        };
        let mut report = TickReport::default();
        assert!(!scheduler.launch(&mut report, &task).await);
        assert!(report.errors.is_empty());

        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count(), 0);
        f.orchestrator.kill("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_stall_grace_delays_retry() {
        let f = fixture(ScriptedProvider::new(vec![]), &["a"]).await;
        let task = add_task(&f.store, "a", TaskPriority::Normal, "stuck").await;
        f.store
            .update_task_status(&task.id, TaskStatus::InProgress, None)
            .await
            .unwrap();

        let config = SchedulerConfig {
            stall_grace: Duration::from_secs(3600),
            ..quiet_config()
        };
        let auto = AutonomousLoop::new(f.store.clone(), f.orchestrator.clone(), config);
        let report = auto.tick().await;
        assert!(report.retried.is_empty());
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_housekeeping_runs_on_schedule() {
        let f = fixture(ScriptedProvider::new(vec![]), &["commander"]).await;
        let config = SchedulerConfig {
            housekeeping: vec![HousekeepingJob {
                name: "review".to_string(),
                every_ticks: 2,
                worker_id: "commander".to_string(),
                kind: EventKind::SelfImprove,
                message: "Self review".to_string(),
                spawn_task: Some("Review output/".to_string()),
            }],
            ..quiet_config()
        };
        let auto = AutonomousLoop::new(f.store.clone(), f.orchestrator.clone(), config);

        auto.tick().await;
        assert_eq!(f.provider.calls(), 0);
        auto.tick().await;
        settle(&f.orchestrator).await;
        assert_eq!(f.provider.calls(), 1);

        let events = f.store.list_events(100).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::SelfImprove));
        assert_eq!(
            events
                .iter()
                .filter(|e| e.worker_id == SCHEDULER_ID && e.message.contains("active sessions"))
                .count(),
            2
        );
        assert_eq!(auto.status().await.unwrap().tick_count, 2);
    }
}
