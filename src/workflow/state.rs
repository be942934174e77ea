//! Execution State
//!
//! The Execution Record of one workflow run and the state machine that
//! governs it:
//!
//! ```text
//! pending -> running -> completed
//!                    \-> failed
//! ```
//!
//! Only the scheduler mutates a record. Stores persist snapshots of it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::model::{TaskDescriptor, TaskId, WorkflowId};
use crate::error::{EngineError, TaskError};

/// Status of a whole execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            // Accept the legacy "in_progress" spelling
            "running" | "in_progress" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one task inside an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Never dispatched
    Pending,
    /// Handed to the backend
    Running,
    Completed,
    Failed,
    /// Ran in a batch whose earlier sibling failed; result discarded
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub result: Result<(), TaskError>,
}

impl TaskOutcome {
    pub fn success(task_id: TaskId) -> Self {
        Self {
            task_id,
            result: Ok(()),
        }
    }

    pub fn failure(task_id: TaskId, error: TaskError) -> Self {
        Self {
            task_id,
            result: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-task entry of an execution record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskStatusEntry {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatusEntry {
    fn pending(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Mutable state of one run of a workflow.
///
/// `completed_at` is set exactly when the status is terminal, and
/// `task_statuses` mirrors the workflow's tasks in ascending order.
///
/// `owner` names the scheduler instance driving the record. The owner
/// refreshes `heartbeat_at` while it works, and only records whose lease
/// has lapsed may be failed by another scheduler.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub task_statuses: Vec<TaskStatusEntry>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Creates a pending record with one pending entry per task.
    ///
    /// `tasks` must already be sorted by order.
    pub fn new(id: impl Into<String>, workflow_id: WorkflowId, tasks: &[TaskDescriptor]) -> Self {
        Self {
            id: id.into(),
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            task_statuses: tasks.iter().map(|t| TaskStatusEntry::pending(t.id)).collect(),
            owner: None,
            heartbeat_at: None,
        }
    }

    /// Records `owner` as the scheduler driving this execution.
    pub fn claim(&mut self, owner: &str) {
        self.owner = Some(owner.to_string());
        self.heartbeat_at = Some(Utc::now());
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner.as_deref() == Some(owner)
    }

    /// True when no live owner can be vouched for at `now`: the record was
    /// never claimed, or its last heartbeat is older than `lease`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        let (Some(_), Some(heartbeat)) = (&self.owner, self.heartbeat_at) else {
            return true;
        };
        // A lease too long to represent never expires
        chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| heartbeat.checked_add_signed(lease))
            .map_or(false, |expires| expires < now)
    }

    fn transition(&mut self, to: ExecutionStatus) -> Result<(), EngineError> {
        let allowed = matches!(
            (self.status, to),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
        );
        if !allowed {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        debug!("Execution {}: {} -> {}", self.id, self.status, to);
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Moves a pending record to running.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Running)
    }

    /// Moves a running record to completed.
    pub fn complete(&mut self) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Completed)
    }

    /// Moves a running record to failed.
    pub fn fail(&mut self) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn task(&self, task_id: TaskId) -> Option<&TaskStatusEntry> {
        self.task_statuses.iter().find(|e| e.task_id == task_id)
    }

    fn task_mut(&mut self, task_id: TaskId) -> Option<&mut TaskStatusEntry> {
        self.task_statuses.iter_mut().find(|e| e.task_id == task_id)
    }

    /// Marks a pending task as dispatched. Returns true if the entry changed.
    pub fn mark_task_running(&mut self, task_id: TaskId) -> bool {
        match self.task_mut(task_id) {
            Some(entry) if entry.status == TaskStatus::Pending => {
                entry.status = TaskStatus::Running;
                entry.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Records a task's terminal outcome. Returns true if the entry changed.
    ///
    /// A task that is already terminal keeps its first outcome, so repeated
    /// delivery of a completion leaves the record untouched.
    pub fn apply_outcome(&mut self, outcome: &TaskOutcome) -> bool {
        let execution_id = self.id.clone();
        let Some(entry) = self.task_mut(outcome.task_id) else {
            warn!(
                "Execution {}: ignoring outcome for unknown task {}",
                execution_id, outcome.task_id
            );
            return false;
        };

        if entry.status.is_terminal() {
            debug!(
                "Execution {}: task {} already {}, ignoring repeated outcome",
                execution_id, entry.task_id, entry.status
            );
            return false;
        }

        match &outcome.result {
            Ok(()) => {
                entry.status = TaskStatus::Completed;
                entry.error = None;
            }
            Err(error) => {
                entry.status = TaskStatus::Failed;
                entry.error = Some(error.to_string());
            }
        }
        entry.finished_at = Some(Utc::now());
        true
    }

    /// Discards the result of a task that ran after a failed sibling.
    pub fn mark_task_skipped(&mut self, task_id: TaskId) -> bool {
        match self.task_mut(task_id) {
            Some(entry) if !entry.status.is_terminal() && entry.status != TaskStatus::Skipped => {
                entry.status = TaskStatus::Skipped;
                entry.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Fails every task still marked running with the given message.
    pub fn fail_running_tasks(&mut self, message: &str) -> usize {
        let mut count = 0;
        for entry in &mut self.task_statuses {
            if entry.status == TaskStatus::Running {
                entry.status = TaskStatus::Failed;
                entry.error = Some(message.to_string());
                entry.finished_at = Some(Utc::now());
                count += 1;
            }
        }
        count
    }

    /// Returns (terminal task count, total task count).
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .task_statuses
            .iter()
            .filter(|e| e.status.is_terminal())
            .count();
        (done, self.task_statuses.len())
    }
}
