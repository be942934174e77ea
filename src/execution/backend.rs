//! Executor Backends
//!
//! A backend runs one dispatch unit (a single sync task, or a whole async
//! batch) and reports one outcome per task. Backends never fail as a whole:
//! every problem, including a runtime fault or a missing completion, is
//! reported as a failed outcome of the task concerned.

use std::sync::Arc;

use async_trait::async_trait;

use super::distributed::DistributedBackend;
use super::inline::InlineBackend;
use super::queued::QueuedBackend;
use super::step::TaskRunner;
use crate::config::{BackendKind, EngineConfig};
use crate::error::{EngineError, Result};
use crate::queue::JobQueue;
use crate::workflow::{TaskDescriptor, TaskOutcome};

/// Runs tasks on behalf of the scheduler.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Runs `tasks` concurrently and returns one outcome per task, in the
    /// order of `tasks`.
    async fn run_batch(&self, execution_id: &str, tasks: &[TaskDescriptor]) -> Vec<TaskOutcome>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Builds the backend selected by the configuration.
///
/// The queued backend needs a job queue; the others ignore it.
pub fn build_backend(
    config: &EngineConfig,
    runner: Arc<dyn TaskRunner>,
    queue: Option<Arc<dyn JobQueue>>,
) -> Result<Arc<dyn ExecutorBackend>> {
    let backend: Arc<dyn ExecutorBackend> = match config.backend {
        BackendKind::Inline => Arc::new(InlineBackend::new(runner)),
        BackendKind::Queued => {
            let queue = queue.ok_or_else(|| {
                EngineError::Config("queued backend requires a job queue".into())
            })?;
            Arc::new(QueuedBackend::new(
                queue,
                config.queue_timeout(),
                config.poll_interval(),
            ))
        }
        BackendKind::Distributed => Arc::new(DistributedBackend::new(
            runner,
            config.workers,
            config.max_parallel,
        )?),
    };
    Ok(backend)
}
