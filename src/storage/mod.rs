//! Status Storage
//!
//! Durable read/write of workflow definitions and execution records. The
//! scheduler is the only writer of execution records; stores never change a
//! status on their own.
//!
//! - [`MemoryStore`]: process-local maps, for tests and one-shot CLI runs
//! - [`SqliteStore`]: relational store on SQLite

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::workflow::{ExecutionRecord, ExecutionStatus, TaskDescriptor, Workflow, WorkflowId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persistence collaborator consumed by the scheduler.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Stores a workflow and its tasks, returning it with identifiers assigned.
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<Workflow>;

    /// Loads a workflow's tasks sorted by order.
    ///
    /// Fails with `NotFound` if the workflow does not exist. An existing
    /// workflow without tasks yields an empty list.
    async fn load_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<TaskDescriptor>>;

    /// Inserts or replaces the snapshot of one execution.
    ///
    /// Fails with `Conflict` if the stored record is already terminal with a
    /// different status; a finished execution never changes its outcome.
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Refreshes the heartbeat of an unfinished execution held by `owner`.
    ///
    /// Returns false if the execution is unknown, finished, or owned by
    /// another scheduler.
    async fn touch_execution(
        &self,
        execution_id: &str,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Loads one execution, failing with `NotFound` if it is unknown.
    async fn load_execution(&self, execution_id: &str) -> Result<ExecutionRecord>;

    /// Lists executions currently in `status`, oldest first.
    async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionRecord>>;
}
