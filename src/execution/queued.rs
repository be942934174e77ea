//! Queued backend: hands tasks to out-of-process workers through a
//! [`JobQueue`] and waits, bounded, for their completions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::Instant;

use super::backend::ExecutorBackend;
use crate::error::TaskError;
use crate::queue::{Job, JobQueue};
use crate::workflow::{TaskDescriptor, TaskId, TaskOutcome};

/// Stand-in deadline distance for waits too long to add to an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub struct QueuedBackend {
    queue: Arc<dyn JobQueue>,
    /// Upper bound on the wait for a whole dispatch unit
    timeout: Duration,
    /// Longest single blocking read on the completion list
    poll_interval: Duration,
}

impl QueuedBackend {
    pub fn new(queue: Arc<dyn JobQueue>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            queue,
            timeout,
            poll_interval,
        }
    }

    async fn collect_completions(
        &self,
        execution_id: &str,
        waiting: &mut HashSet<TaskId>,
        outcomes: &mut HashMap<TaskId, TaskOutcome>,
    ) {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);

        while !waiting.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(self.poll_interval);

            match self.queue.next_completion(execution_id, wait).await {
                Ok(Some(completion)) => {
                    if waiting.remove(&completion.task_id) {
                        debug!(
                            "Execution {}: completion for task {} received",
                            execution_id, completion.task_id
                        );
                        outcomes.insert(completion.task_id, completion.into_outcome());
                    } else {
                        debug!(
                            "Execution {}: ignoring duplicate or stray completion for task {}",
                            execution_id, completion.task_id
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Execution {}: reading completions failed: {}",
                        execution_id, e
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[async_trait]
impl ExecutorBackend for QueuedBackend {
    async fn run_batch(&self, execution_id: &str, tasks: &[TaskDescriptor]) -> Vec<TaskOutcome> {
        let mut outcomes: HashMap<TaskId, TaskOutcome> = HashMap::with_capacity(tasks.len());
        let mut waiting = HashSet::with_capacity(tasks.len());

        for task in tasks {
            let job = Job::new(execution_id, task.clone());
            match self.queue.enqueue(&job).await {
                Ok(()) => {
                    waiting.insert(task.id);
                }
                Err(e) => {
                    warn!(
                        "Execution {}: could not enqueue task {}: {}",
                        execution_id, task.id, e
                    );
                    outcomes.insert(
                        task.id,
                        TaskOutcome::failure(
                            task.id,
                            TaskError::Execution(format!("failed to enqueue job: {}", e)),
                        ),
                    );
                }
            }
        }
        info!(
            "Execution {}: {} job(s) enqueued",
            execution_id,
            waiting.len()
        );

        self.collect_completions(execution_id, &mut waiting, &mut outcomes)
            .await;

        if !waiting.is_empty() {
            warn!(
                "Execution {}: {} job(s) did not complete within {:?}",
                execution_id,
                waiting.len(),
                self.timeout
            );
        }

        let timeout = self.timeout;
        tasks
            .iter()
            .map(|task| {
                outcomes.remove(&task.id).unwrap_or_else(|| {
                    TaskOutcome::failure(task.id, TaskError::Timeout { waited: timeout })
                })
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "queued"
    }
}
