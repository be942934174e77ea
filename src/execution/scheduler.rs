//! Workflow Scheduler
//!
//! Owns the lifecycle of every execution record:
//! - Loads and validates a workflow's tasks
//! - Creates the record and moves it through `pending -> running -> terminal`
//! - Drives sync tasks one at a time and async runs as concurrent batches
//! - Stops at the first failed task
//! - Persists every change and then invalidates the read cache
//!
//! One scheduler serves any number of concurrent executions; each one is
//! driven by its own Tokio task and only shares the status store.
//!
//! Every record carries the id of the scheduler driving it and a heartbeat
//! that scheduler refreshes while it works. Schedulers sharing a database
//! only fail each other's records once that heartbeat is older than the
//! lease, so they should all run with the same lease.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::backend::ExecutorBackend;
use crate::cache::CacheInvalidator;
use crate::error::{EngineError, Result, TaskError};
use crate::storage::StatusStore;
use crate::workflow::validator::validate_tasks;
use crate::workflow::{
    ExecutionPlan, ExecutionRecord, ExecutionStatus, TaskDescriptor, TaskOutcome, TaskStatus,
    WorkflowId,
};

/// Error stored on tasks that were running when a previous scheduler died.
pub const ORPHANED_TASK_ERROR: &str = "execution orphaned by scheduler restart";

/// Error prefix stored on tasks that were running when their own scheduler
/// gave up on the execution after an engine error.
pub const ABORTED_TASK_ERROR: &str = "execution aborted by scheduler error";

/// How long an owner may go without a heartbeat before its records count
/// as orphaned.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Attempts at storing the failed snapshot of an aborted execution.
const FINAL_WRITE_ATTEMPTS: u32 = 3;

const FINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Longest gap between two heartbeats, whatever the lease.
const MAX_HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

/// Handle returned when an execution is started in the background.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionTicket {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

/// Drives workflow executions against a backend.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use stepwise::cache::NoopInvalidator;
/// use stepwise::execution::{InlineBackend, Scheduler, StepRunner};
/// use stepwise::storage::{MemoryStore, StatusStore};
/// use stepwise::load_workflow;
///
/// # async fn run() -> stepwise::Result<()> {
/// let store = Arc::new(MemoryStore::new());
/// let workflow = store.insert_workflow(&load_workflow("nightly.yaml")?).await?;
///
/// let scheduler = Scheduler::new(
///     store,
///     Arc::new(NoopInvalidator),
///     Arc::new(InlineBackend::new(Arc::new(StepRunner::default()))),
/// );
/// let record = scheduler.execute(workflow.id).await?;
/// println!("{} finished as {}", record.id, record.status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn StatusStore>,
    cache: Arc<dyn CacheInvalidator>,
    backend: Arc<dyn ExecutorBackend>,
    instance_id: Arc<str>,
    lease: Duration,
}

/// Stops the heartbeat task when the driver finishes or is dropped.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StatusStore>,
        cache: Arc<dyn CacheInvalidator>,
        backend: Arc<dyn ExecutorBackend>,
    ) -> Self {
        Self {
            store,
            cache,
            backend,
            instance_id: Arc::from(Uuid::new_v4().to_string()),
            lease: DEFAULT_LEASE,
        }
    }

    /// Sets the heartbeat lease used for this scheduler's own records and
    /// for judging other schedulers' records.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Identifier recorded as the owner of every execution this scheduler
    /// drives.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Starts an execution and drives it in the background.
    ///
    /// Returns once the record is persisted as running. Fails with
    /// `NotFound` for an unknown workflow or one without tasks, and with
    /// `Validation` for a malformed task list; no record is created then.
    pub async fn start_execution(&self, workflow_id: WorkflowId) -> Result<ExecutionTicket> {
        let (record, tasks) = self.prepare(workflow_id).await?;
        let ticket = ExecutionTicket {
            execution_id: record.id.clone(),
            status: record.status,
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            let execution_id = record.id.clone();
            if let Err(e) = scheduler.run_to_end(record, tasks).await {
                error!("Execution {} aborted: {}", execution_id, e);
            }
        });

        Ok(ticket)
    }

    /// Runs an execution to completion on the caller's task and returns the
    /// final record.
    ///
    /// If an engine error stops the run, the execution is still failed in
    /// the store on a best-effort basis before the error is returned.
    pub async fn execute(&self, workflow_id: WorkflowId) -> Result<ExecutionRecord> {
        let (record, tasks) = self.prepare(workflow_id).await?;
        self.run_to_end(record, tasks).await
    }

    /// Returns the current snapshot of an execution.
    pub async fn get_status(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.store.load_execution(execution_id).await
    }

    /// Polls the store until the execution is terminal.
    pub async fn wait_for_completion(
        &self,
        execution_id: &str,
        poll_interval: Duration,
    ) -> Result<ExecutionRecord> {
        loop {
            let record = self.get_status(execution_id).await?;
            if record.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Fails every unfinished execution whose owner has stopped
    /// heartbeating.
    ///
    /// Records held by a live scheduler, this one included, are left alone,
    /// as are records that finish while the sweep runs. Returns the number
    /// of records resolved.
    pub async fn reconcile_orphans(&self) -> Result<usize> {
        let mut resolved = 0;

        for status in [ExecutionStatus::Running, ExecutionStatus::Pending] {
            for mut record in self.store.list_executions(status).await? {
                if record.is_owned_by(&self.instance_id)
                    || !record.lease_expired(Utc::now(), self.lease)
                {
                    debug!(
                        "Execution {} is held by live scheduler {}",
                        record.id,
                        record.owner.as_deref().unwrap_or("-")
                    );
                    continue;
                }

                if record.status == ExecutionStatus::Pending {
                    record.start()?;
                }
                let orphaned_tasks = record.fail_running_tasks(ORPHANED_TASK_ERROR);
                record.fail()?;
                match self.persist(&mut record).await {
                    Ok(()) => {}
                    Err(EngineError::Conflict(reason)) => {
                        debug!("Execution {} finished during the sweep: {}", record.id, reason);
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                warn!(
                    "Execution {} was left {} by a previous run; marked failed ({} task(s) orphaned)",
                    record.id, status, orphaned_tasks
                );
                resolved += 1;
            }
        }

        if resolved > 0 {
            info!("Reconciled {} orphaned execution(s)", resolved);
        }
        Ok(resolved)
    }

    async fn prepare(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<(ExecutionRecord, Vec<TaskDescriptor>)> {
        let tasks = self.store.load_tasks(workflow_id).await?;
        if tasks.is_empty() {
            return Err(EngineError::NotFound(format!(
                "workflow {} has no tasks",
                workflow_id
            )));
        }
        validate_tasks(workflow_id, &tasks)?;

        let mut record = ExecutionRecord::new(Uuid::new_v4().to_string(), workflow_id, &tasks);
        record.claim(&self.instance_id);
        self.persist(&mut record).await?;
        record.start()?;
        self.persist(&mut record).await?;

        info!(
            "Execution {} started for workflow {} ({} tasks, {} backend)",
            record.id,
            workflow_id,
            tasks.len(),
            self.backend.name()
        );
        Ok((record, tasks))
    }

    /// Drives a prepared record while keeping its lease alive, and fails it
    /// if the drive stops on an engine error.
    async fn run_to_end(
        &self,
        mut record: ExecutionRecord,
        tasks: Vec<TaskDescriptor>,
    ) -> Result<ExecutionRecord> {
        let _heartbeat = self.spawn_heartbeat(&record.id);
        match self.drive(&mut record, &tasks).await {
            Ok(()) => Ok(record),
            Err(e) => {
                self.abandon(&mut record, &e).await;
                Err(e)
            }
        }
    }

    fn spawn_heartbeat(&self, execution_id: &str) -> HeartbeatGuard {
        let store = Arc::clone(&self.store);
        let owner = Arc::clone(&self.instance_id);
        let execution_id = execution_id.to_string();
        let period = (self.lease / 3)
            .clamp(Duration::from_millis(10), MAX_HEARTBEAT_PERIOD);

        HeartbeatGuard(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.touch_execution(&execution_id, &owner, Utc::now()).await {
                    Ok(true) => trace!("Execution {}: heartbeat", execution_id),
                    Ok(false) => break,
                    Err(e) => warn!("Execution {}: heartbeat failed: {}", execution_id, e),
                }
            }
        }))
    }

    /// Fails an execution whose drive stopped on an engine error and stores
    /// the final snapshot, retrying a bounded number of times.
    async fn abandon(&self, record: &mut ExecutionRecord, cause: &EngineError) {
        if matches!(cause, EngineError::Conflict(_)) {
            warn!("Execution {} was finished by another scheduler: {}", record.id, cause);
            return;
        }

        record.fail_running_tasks(&format!("{}: {}", ABORTED_TASK_ERROR, cause));
        if !record.is_terminal() {
            if let Err(e) = record.fail() {
                error!("Execution {}: cannot mark failed: {}", record.id, e);
                return;
            }
        }

        for attempt in 1..=FINAL_WRITE_ATTEMPTS {
            match self.persist(record).await {
                Ok(()) => {
                    error!(
                        "Execution {} stopped by an engine error and stored as {}",
                        record.id, record.status
                    );
                    return;
                }
                Err(EngineError::Conflict(reason)) => {
                    warn!("Execution {} already finished: {}", record.id, reason);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Execution {}: storing final status failed (attempt {}/{}): {}",
                        record.id, attempt, FINAL_WRITE_ATTEMPTS, e
                    );
                    tokio::time::sleep(FINAL_WRITE_BACKOFF * attempt).await;
                }
            }
        }
        error!(
            "Execution {}: final status not stored; it stays running until its lease lapses",
            record.id
        );
    }

    async fn drive(&self, record: &mut ExecutionRecord, tasks: &[TaskDescriptor]) -> Result<()> {
        let started = Instant::now();
        let plan = ExecutionPlan::from_tasks(tasks);
        let mut failed = false;

        'batches: for batch in plan.batches() {
            debug!(
                "Execution {}: {} batch of {} task(s)",
                record.id,
                batch.mode,
                batch.len()
            );
            for unit in batch.dispatch_units() {
                if self.run_unit(record, unit).await? {
                    failed = true;
                    break 'batches;
                }
            }
        }

        if failed {
            record.fail()?;
        } else {
            record.complete()?;
        }
        self.persist(record).await?;

        let (done, total) = record.progress();
        if failed {
            error!(
                "Execution {} failed after {:.2?} ({}/{} tasks finished)",
                record.id,
                started.elapsed(),
                done,
                total
            );
        } else {
            info!(
                "Execution {} completed in {:.2?} ({} tasks)",
                record.id,
                started.elapsed(),
                total
            );
        }
        Ok(())
    }

    /// Runs one dispatch unit and records its outcomes. Returns true if any
    /// task of the unit failed.
    async fn run_unit(
        &self,
        record: &mut ExecutionRecord,
        unit: &[TaskDescriptor],
    ) -> Result<bool> {
        let mut changed = false;
        for task in unit {
            changed |= record.mark_task_running(task.id);
        }
        if changed {
            self.persist(record).await?;
        }

        let outcomes = self.backend.run_batch(&record.id, unit).await;

        let mut failed = false;
        let mut changed = false;
        for outcome in &outcomes {
            if failed && outcome.is_success() {
                changed |= record.mark_task_skipped(outcome.task_id);
                continue;
            }
            if !record.apply_outcome(outcome) {
                continue;
            }
            changed = true;
            if let Err(e) = &outcome.result {
                error!(
                    "Execution {}: task {} failed: {}",
                    record.id, outcome.task_id, e
                );
                failed = true;
            }
        }

        for task in unit {
            let unreported = record
                .task(task.id)
                .map(|entry| entry.status == TaskStatus::Running)
                .unwrap_or(false);
            if unreported {
                warn!(
                    "Execution {}: backend reported no outcome for task {}",
                    record.id, task.id
                );
                let fault = TaskError::RuntimeFault("no outcome reported by backend".into());
                changed |= record.apply_outcome(&TaskOutcome::failure(task.id, fault));
                failed = true;
            }
        }

        if changed {
            self.persist(record).await?;
        }
        Ok(failed)
    }

    /// Single write path: persist the snapshot, then drop cached reads.
    /// Writing a record this scheduler owns also renews its lease.
    async fn persist(&self, record: &mut ExecutionRecord) -> Result<()> {
        if record.is_owned_by(&self.instance_id) {
            record.heartbeat_at = Some(Utc::now());
        }
        self.store.save_execution(record).await?;
        if let Err(e) = self.cache.invalidate(record.workflow_id, &record.id).await {
            warn!(
                "Cache invalidation failed for execution {}: {}",
                record.id, e
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::cache::NoopInvalidator;
    use crate::execution::step::TaskRunner;
    use crate::execution::{DistributedBackend, InlineBackend, QueuedBackend, StepRunner};
    use crate::queue::{MemoryJobQueue, QueueWorker};
    use crate::storage::MemoryStore;
    use crate::workflow::{ExecutionMode, Workflow};

    /// Runner recording when each task started and finished.
    #[derive(Default)]
    struct RecordingRunner {
        spans: Mutex<HashMap<i64, (Instant, Instant)>>,
    }

    impl RecordingRunner {
        fn span(&self, task_id: i64) -> (Instant, Instant) {
            self.spans.lock().unwrap()[&task_id]
        }

        fn ran(&self, task_id: i64) -> bool {
            self.spans.lock().unwrap().contains_key(&task_id)
        }
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(&self, task: &TaskDescriptor) -> std::result::Result<(), TaskError> {
            let start = Instant::now();
            let millis = task.number_parameter("millis").unwrap_or(0.0) as u64;
            tokio::time::sleep(Duration::from_millis(millis)).await;
            self.spans
                .lock()
                .unwrap()
                .insert(task.id, (start, Instant::now()));
            match task.string_parameter("fail") {
                Some(message) => Err(TaskError::Execution(message.to_string())),
                None => Ok(()),
            }
        }
    }

    /// Invalidator that records calls and can be told to fail.
    #[derive(Default)]
    struct RecordingInvalidator {
        calls: Mutex<Vec<(WorkflowId, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheInvalidator for RecordingInvalidator {
        async fn invalidate(&self, workflow_id: WorkflowId, execution_id: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((workflow_id, execution_id.to_string()));
            if self.fail {
                return Err(EngineError::Storage("cache unreachable".into()));
            }
            Ok(())
        }
    }

    /// Store wrapper counting snapshot writes. Fails the write numbered
    /// `fail_on`, if set.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        saves: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl CountingStore {
        fn failing_on(save: usize) -> Self {
            Self {
                fail_on: Some(save),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl StatusStore for CountingStore {
        async fn insert_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
            self.inner.insert_workflow(workflow).await
        }

        async fn load_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<TaskDescriptor>> {
            self.inner.load_tasks(workflow_id).await
        }

        async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
            let save = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(save) {
                return Err(EngineError::Storage("disk I/O error".into()));
            }
            self.inner.save_execution(record).await
        }

        async fn touch_execution(
            &self,
            execution_id: &str,
            owner: &str,
            at: chrono::DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.touch_execution(execution_id, owner, at).await
        }

        async fn load_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
            self.inner.load_execution(execution_id).await
        }

        async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionRecord>> {
            self.inner.list_executions(status).await
        }
    }

    /// Backend that reports every outcome twice, the repeat always failing.
    struct RepeatingBackend;

    #[async_trait]
    impl ExecutorBackend for RepeatingBackend {
        async fn run_batch(&self, _execution_id: &str, tasks: &[TaskDescriptor]) -> Vec<TaskOutcome> {
            tasks
                .iter()
                .flat_map(|t| {
                    [
                        TaskOutcome::success(t.id),
                        TaskOutcome::failure(t.id, TaskError::Execution("redelivered".into())),
                    ]
                })
                .collect()
        }

        fn name(&self) -> &'static str {
            "repeating"
        }
    }

    /// Backend that never reports anything.
    struct SilentBackend;

    #[async_trait]
    impl ExecutorBackend for SilentBackend {
        async fn run_batch(&self, _execution_id: &str, _tasks: &[TaskDescriptor]) -> Vec<TaskOutcome> {
            Vec::new()
        }

        fn name(&self) -> &'static str {
            "silent"
        }
    }

    fn task(name: &str, order: i64, mode: ExecutionMode, millis: u64) -> TaskDescriptor {
        TaskDescriptor::new(name, order)
            .with_mode(mode)
            .with_parameter("millis", millis)
    }

    async fn seed(store: &dyn StatusStore, tasks: Vec<TaskDescriptor>) -> Workflow {
        store
            .insert_workflow(&Workflow::from_tasks("wf", tasks))
            .await
            .unwrap()
    }

    fn inline_scheduler(
        store: Arc<dyn StatusStore>,
        runner: Arc<RecordingRunner>,
    ) -> Scheduler {
        Scheduler::new(
            store,
            Arc::new(NoopInvalidator),
            Arc::new(InlineBackend::new(runner)),
        )
    }

    #[tokio::test]
    async fn test_sync_then_async_batch_completes() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(RecordingRunner::default());
        let workflow = seed(
            store.as_ref(),
            vec![
                task("prepare", 1, ExecutionMode::Sync, 30),
                task("left", 2, ExecutionMode::Async, 100),
                task("right", 3, ExecutionMode::Async, 100),
            ],
        )
        .await;
        let ids: Vec<_> = workflow.tasks.iter().map(|t| t.id).collect();
        let scheduler = inline_scheduler(store.clone(), runner.clone());

        let record = scheduler.execute(workflow.id).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.completed_at.is_some());
        assert_eq!(
            record.task_statuses.iter().map(|e| e.task_id).collect::<Vec<_>>(),
            ids
        );
        assert!(record
            .task_statuses
            .iter()
            .all(|e| e.status == TaskStatus::Completed));

        let (_, prepare_end) = runner.span(ids[0]);
        let (left_start, left_end) = runner.span(ids[1]);
        let (right_start, right_end) = runner.span(ids[2]);
        assert!(prepare_end <= left_start);
        assert!(prepare_end <= right_start);
        assert!(left_start < right_end && right_start < left_end);

        let stored = scheduler.get_status(&record.id).await.unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_sync_tasks_never_overlap() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(RecordingRunner::default());
        let workflow = seed(
            store.as_ref(),
            (1..=3)
                .map(|order| task(&format!("s{}", order), order, ExecutionMode::Sync, 20))
                .collect(),
        )
        .await;
        let scheduler = inline_scheduler(store, runner.clone());

        scheduler.execute(workflow.id).await.unwrap();

        let spans: Vec<_> = workflow.tasks.iter().map(|t| runner.span(t.id)).collect();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[tokio::test]
    async fn test_sync_failure_stops_execution() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(RecordingRunner::default());
        let workflow = seed(
            store.as_ref(),
            vec![
                task("first", 1, ExecutionMode::Sync, 0).with_parameter("fail", "bad input"),
                task("second", 2, ExecutionMode::Sync, 0),
            ],
        )
        .await;
        let scheduler = inline_scheduler(store, runner.clone());

        let record = scheduler.execute(workflow.id).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        let first = &record.task_statuses[0];
        assert_eq!(first.status, TaskStatus::Failed);
        assert_eq!(first.error.as_deref(), Some("bad input"));

        let second = &record.task_statuses[1];
        assert_eq!(second.status, TaskStatus::Pending);
        assert!(second.started_at.is_none());
        assert!(!runner.ran(workflow.tasks[1].id));
    }

    #[tokio::test]
    async fn test_async_failure_skips_later_siblings() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(RecordingRunner::default());
        let workflow = seed(
            store.as_ref(),
            vec![
                task("ok", 1, ExecutionMode::Async, 10),
                task("broken", 2, ExecutionMode::Async, 0).with_parameter("fail", "crashed"),
                task("late", 3, ExecutionMode::Async, 10),
                task("after", 4, ExecutionMode::Sync, 0),
            ],
        )
        .await;
        let scheduler = inline_scheduler(store, runner.clone());

        let record = scheduler.execute(workflow.id).await.unwrap();

        let statuses: Vec<_> = record.task_statuses.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Skipped,
                TaskStatus::Pending
            ]
        );
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(!runner.ran(workflow.tasks[3].id));
    }

    #[tokio::test]
    async fn test_start_execution_returns_running() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(RecordingRunner::default());
        let workflow = seed(
            store.as_ref(),
            vec![task("only", 1, ExecutionMode::Sync, 50)],
        )
        .await;
        let scheduler = inline_scheduler(store, runner);

        let ticket = scheduler.start_execution(workflow.id).await.unwrap();
        assert_eq!(ticket.status, ExecutionStatus::Running);
        assert!(Uuid::parse_str(&ticket.execution_id).is_ok());

        let record = scheduler
            .wait_for_completion(&ticket.execution_id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_execution_not_found() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()));

        let err = scheduler.get_status("does-not-exist").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.execution_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_or_empty_workflow_not_found() {
        let store = Arc::new(MemoryStore::new());
        let empty = store.insert_workflow(&Workflow::new("empty")).await.unwrap();
        let scheduler = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()));

        assert!(scheduler.start_execution(999).await.unwrap_err().is_not_found());
        assert!(scheduler
            .start_execution(empty.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(store.execution_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_order_rejected_before_start() {
        let store = Arc::new(MemoryStore::new());
        let workflow = seed(
            store.as_ref(),
            vec![
                task("a", 1, ExecutionMode::Sync, 0),
                task("b", 1, ExecutionMode::Sync, 0),
            ],
        )
        .await;
        let scheduler = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()));

        let err = scheduler.execute(workflow.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(store.execution_count().await, 0);
    }

    #[tokio::test]
    async fn test_repeated_outcomes_are_not_rewritten() {
        let store = Arc::new(CountingStore::default());
        let workflow = seed(
            store.as_ref(),
            vec![task("once", 1, ExecutionMode::Sync, 0)],
        )
        .await;
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(NoopInvalidator),
            Arc::new(RepeatingBackend),
        );

        let record = scheduler.execute(workflow.id).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.task_statuses[0].status, TaskStatus::Completed);
        assert!(record.task_statuses[0].error.is_none());
        // pending, running, task dispatched, task finished, completed
        assert_eq!(store.saves.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_missing_outcome_fails_task() {
        let store = Arc::new(MemoryStore::new());
        let workflow = seed(
            store.as_ref(),
            vec![task("lost", 1, ExecutionMode::Sync, 0)],
        )
        .await;
        let scheduler = Scheduler::new(store, Arc::new(NoopInvalidator), Arc::new(SilentBackend));

        let record = scheduler.execute(workflow.id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.task_statuses[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_cache_invalidated_after_each_write() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(RecordingInvalidator {
            fail: true,
            ..RecordingInvalidator::default()
        });
        let workflow = seed(
            store.as_ref(),
            vec![task("only", 1, ExecutionMode::Sync, 0)],
        )
        .await;
        let scheduler = Scheduler::new(
            store,
            cache.clone(),
            Arc::new(InlineBackend::new(Arc::new(RecordingRunner::default()))),
        );

        let record = scheduler.execute(workflow.id).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        let calls = cache.calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert!(calls
            .iter()
            .all(|(wf, id)| *wf == workflow.id && *id == record.id));
    }

    #[tokio::test]
    async fn test_reconcile_orphans() {
        let store = Arc::new(MemoryStore::new());
        let workflow = seed(
            store.as_ref(),
            vec![
                task("a", 1, ExecutionMode::Sync, 0),
                task("b", 2, ExecutionMode::Sync, 0),
            ],
        )
        .await;
        let ids: Vec<_> = workflow.tasks.iter().map(|t| t.id).collect();

        let mut crashed = ExecutionRecord::new("crashed", workflow.id, &workflow.tasks);
        crashed.claim("gone");
        crashed.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(10));
        crashed.start().unwrap();
        crashed.mark_task_running(ids[0]);
        store.save_execution(&crashed).await.unwrap();

        let pending = ExecutionRecord::new("never-started", workflow.id, &workflow.tasks);
        store.save_execution(&pending).await.unwrap();

        let mut live = ExecutionRecord::new("elsewhere", workflow.id, &workflow.tasks);
        live.claim("other-scheduler");
        live.start().unwrap();
        store.save_execution(&live).await.unwrap();

        let scheduler = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()));
        assert_eq!(scheduler.reconcile_orphans().await.unwrap(), 2);
        assert_eq!(scheduler.reconcile_orphans().await.unwrap(), 0);

        let crashed = scheduler.get_status("crashed").await.unwrap();
        assert_eq!(crashed.status, ExecutionStatus::Failed);
        assert!(crashed.completed_at.is_some());
        let orphan = crashed.task(ids[0]).unwrap();
        assert_eq!(orphan.status, TaskStatus::Failed);
        assert_eq!(orphan.error.as_deref(), Some(ORPHANED_TASK_ERROR));
        assert_eq!(crashed.task(ids[1]).unwrap().status, TaskStatus::Pending);

        let never = scheduler.get_status("never-started").await.unwrap();
        assert_eq!(never.status, ExecutionStatus::Failed);

        let live = scheduler.get_status("elsewhere").await.unwrap();
        assert_eq!(live.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_sweep_leaves_live_execution_alone() {
        let store = Arc::new(MemoryStore::new());
        let workflow = seed(
            store.as_ref(),
            vec![task("slow", 1, ExecutionMode::Sync, 300)],
        )
        .await;
        let owner = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()));
        let other = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()));
        assert_ne!(owner.instance_id(), other.instance_id());

        let ticket = owner.start_execution(workflow.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(other.reconcile_orphans().await.unwrap(), 0);
        let during = other.get_status(&ticket.execution_id).await.unwrap();
        assert_eq!(during.status, ExecutionStatus::Running);
        assert!(during.is_owned_by(owner.instance_id()));

        let record = owner
            .wait_for_completion(&ticket.execution_id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.task_statuses[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let store = Arc::new(MemoryStore::new());
        let workflow = seed(
            store.as_ref(),
            vec![task("long", 1, ExecutionMode::Sync, 900)],
        )
        .await;
        let lease = Duration::from_millis(300);
        let owner = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()))
            .with_lease(lease);
        let other = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()))
            .with_lease(lease);

        let ticket = owner.start_execution(workflow.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(other.reconcile_orphans().await.unwrap(), 0);

        let record = owner
            .wait_for_completion(&ticket.execution_id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_swept_execution_stays_failed() {
        let store = Arc::new(MemoryStore::new());
        let workflow = seed(
            store.as_ref(),
            vec![task("slow", 1, ExecutionMode::Sync, 300)],
        )
        .await;
        let owner = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()));
        let impatient = inline_scheduler(store.clone(), Arc::new(RecordingRunner::default()))
            .with_lease(Duration::from_millis(1));

        let ticket = owner.start_execution(workflow.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(impatient.reconcile_orphans().await.unwrap(), 1);

        // Give the owner time to finish its task and try to store the result
        tokio::time::sleep(Duration::from_millis(400)).await;
        let record = owner.get_status(&ticket.execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(
            record.task_statuses[0].error.as_deref(),
            Some(ORPHANED_TASK_ERROR)
        );
    }

    #[tokio::test]
    async fn test_store_error_still_fails_execution() {
        // pending, running, then the dispatch write fails
        let store = Arc::new(CountingStore::failing_on(3));
        let workflow = seed(
            store.as_ref(),
            vec![task("only", 1, ExecutionMode::Sync, 0)],
        )
        .await;
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(NoopInvalidator),
            Arc::new(InlineBackend::new(Arc::new(RecordingRunner::default()))),
        );

        let ticket = scheduler.start_execution(workflow.id).await.unwrap();
        let record = tokio::time::timeout(
            Duration::from_secs(2),
            scheduler.wait_for_completion(&ticket.execution_id, Duration::from_millis(10)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.completed_at.is_some());
        let message = record.task_statuses[0].error.as_deref().unwrap();
        assert!(message.starts_with(ABORTED_TASK_ERROR));
        assert!(message.contains("disk I/O error"));
    }

    #[tokio::test]
    async fn test_failed_final_write_is_retried() {
        // pending, running, dispatched, finished, then the completed write fails
        let store = Arc::new(CountingStore::failing_on(5));
        let workflow = seed(
            store.as_ref(),
            vec![task("only", 1, ExecutionMode::Sync, 0)],
        )
        .await;
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(NoopInvalidator),
            Arc::new(InlineBackend::new(Arc::new(RecordingRunner::default()))),
        );

        let err = scheduler.execute(workflow.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        let executions = store
            .list_executions(ExecutionStatus::Completed)
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].task_statuses[0].status, TaskStatus::Completed);
        assert!(store
            .list_executions(ExecutionStatus::Running)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_task_outcome_survives_failed_write() {
        // the write recording the task's failure is lost
        let store = Arc::new(CountingStore::failing_on(4));
        let workflow = seed(
            store.as_ref(),
            vec![task("only", 1, ExecutionMode::Sync, 0)],
        )
        .await;
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(NoopInvalidator),
            Arc::new(SilentBackend),
        );

        assert!(scheduler.execute(workflow.id).await.is_err());

        let failed = store.list_executions(ExecutionStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        let entry = &failed[0].task_statuses[0];
        assert_eq!(entry.status, TaskStatus::Failed);
        assert!(entry.error.as_deref().unwrap().contains("no outcome reported"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_executions_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(RecordingRunner::default());
        let good = seed(
            store.as_ref(),
            vec![task("fine", 1, ExecutionMode::Sync, 20)],
        )
        .await;
        let bad = seed(
            store.as_ref(),
            vec![task("broken", 1, ExecutionMode::Sync, 0).with_parameter("fail", "nope")],
        )
        .await;
        let scheduler = inline_scheduler(store, runner);

        let first = scheduler.start_execution(good.id).await.unwrap();
        let second = scheduler.start_execution(bad.id).await.unwrap();
        assert_ne!(first.execution_id, second.execution_id);

        let poll = Duration::from_millis(5);
        let first = scheduler
            .wait_for_completion(&first.execution_id, poll)
            .await
            .unwrap();
        let second = scheduler
            .wait_for_completion(&second.execution_id, poll)
            .await
            .unwrap();
        assert_eq!(first.status, ExecutionStatus::Completed);
        assert_eq!(second.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_queued_backend_with_worker() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let workflow = seed(
            store.as_ref(),
            vec![
                task("a", 1, ExecutionMode::Async, 0).with_parameter("duration", 0),
                task("b", 2, ExecutionMode::Async, 0).with_parameter("duration", 0),
            ],
        )
        .await;

        let worker = QueueWorker::new(
            queue.clone(),
            Arc::new(StepRunner::default()),
            Duration::from_millis(10),
        );
        let worker_handle = tokio::spawn(async move {
            let mut handled = 0;
            while handled < 2 {
                if worker.run_once().await.unwrap() {
                    handled += 1;
                }
            }
        });

        let backend = QueuedBackend::new(queue, Duration::from_secs(5), Duration::from_millis(10));
        let scheduler = Scheduler::new(store, Arc::new(NoopInvalidator), Arc::new(backend));

        let record = scheduler.execute(workflow.id).await.unwrap();
        worker_handle.await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_queued_timeout_fails_execution() {
        let store = Arc::new(MemoryStore::new());
        let workflow = seed(
            store.as_ref(),
            vec![task("stuck", 1, ExecutionMode::Sync, 0)],
        )
        .await;
        let backend = QueuedBackend::new(
            Arc::new(MemoryJobQueue::new()),
            Duration::from_millis(30),
            Duration::from_millis(10),
        );
        let scheduler = Scheduler::new(store, Arc::new(NoopInvalidator), Arc::new(backend));

        let record = scheduler.execute(workflow.id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.task_statuses[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_distributed_backend_runs_batch() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(RecordingRunner::default());
        let workflow = seed(
            store.as_ref(),
            vec![
                task("x", 1, ExecutionMode::Async, 50),
                task("y", 2, ExecutionMode::Async, 50),
            ],
        )
        .await;
        let backend = DistributedBackend::new(runner.clone(), 2, 2).unwrap();
        let scheduler = Scheduler::new(store, Arc::new(NoopInvalidator), Arc::new(backend));

        let record = scheduler.execute(workflow.id).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        let (x_start, x_end) = runner.span(workflow.tasks[0].id);
        let (y_start, y_end) = runner.span(workflow.tasks[1].id);
        assert!(x_start < y_end && y_start < x_end);
    }
}
