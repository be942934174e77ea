//! Workflow Execution Module
//!
//! Drives executions and runs their tasks.
//!
//! # Architecture
//!
//! - [`scheduler`]: Execution lifecycle, batching and fail-fast policy
//! - [`backend`]: The executor backend contract and its factory
//! - [`inline`], [`queued`], [`distributed`]: The three backends
//! - [`step`]: Single-task execution

pub mod backend;
pub mod distributed;
pub mod inline;
pub mod queued;
pub mod scheduler;
pub mod step;

pub use backend::{build_backend, ExecutorBackend};
pub use distributed::DistributedBackend;
pub use inline::InlineBackend;
pub use queued::QueuedBackend;
pub use scheduler::{
    ExecutionTicket, Scheduler, ABORTED_TASK_ERROR, DEFAULT_LEASE, ORPHANED_TASK_ERROR,
};
pub use step::{StepRunner, TaskRunner};
