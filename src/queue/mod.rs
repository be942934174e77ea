//! Job Queue
//!
//! Transport between the queued backend and worker processes. The backend
//! enqueues one [`Job`] per task and waits for the matching [`Completion`];
//! workers dequeue jobs, run them and report back.
//!
//! - [`MemoryJobQueue`]: in-process queue, for embedding the backend and its
//!   workers in one process (the CLI always uses Redis)
//! - [`RedisJobQueue`]: Redis lists shared across processes
//! - [`QueueWorker`]: the consuming side

pub mod memory;
pub mod redis_queue;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::workflow::{TaskDescriptor, TaskId, TaskOutcome};

pub use memory::MemoryJobQueue;
pub use redis_queue::RedisJobQueue;
pub use worker::QueueWorker;

/// How long an uncollected completion is kept before it is dropped.
pub const COMPLETION_TTL: Duration = Duration::from_secs(3600);

/// One task handed to a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub execution_id: String,
    pub task: TaskDescriptor,
}

impl Job {
    pub fn new(execution_id: impl Into<String>, task: TaskDescriptor) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            task,
        }
    }
}

/// Result of one job, reported by the worker that ran it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Completion {
    pub execution_id: String,
    pub task_id: TaskId,
    /// Failure message; `None` means the job succeeded
    #[serde(default)]
    pub error: Option<String>,
}

impl Completion {
    pub fn from_outcome(execution_id: impl Into<String>, outcome: &TaskOutcome) -> Self {
        Self {
            execution_id: execution_id.into(),
            task_id: outcome.task_id,
            error: outcome.result.as_ref().err().map(ToString::to_string),
        }
    }

    pub fn into_outcome(self) -> TaskOutcome {
        match self.error {
            None => TaskOutcome::success(self.task_id),
            Some(message) => TaskOutcome::failure(self.task_id, TaskError::Execution(message)),
        }
    }
}

/// Queue shared by the queued backend and its workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Makes a job available to workers.
    async fn enqueue(&self, job: &Job) -> Result<()>;

    /// Takes the next job, waiting up to `wait`. `None` if none arrived.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>>;

    /// Publishes the result of a job.
    async fn report(&self, completion: &Completion) -> Result<()>;

    /// Takes the next completion for an execution, waiting up to `wait`.
    async fn next_completion(&self, execution_id: &str, wait: Duration)
        -> Result<Option<Completion>>;
}
