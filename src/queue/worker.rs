//! Queue Worker
//!
//! Consumes jobs from a [`JobQueue`], runs each with a [`TaskRunner`] and
//! reports the completion back to the execution that enqueued it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::{Completion, JobQueue};
use crate::error::Result;
use crate::execution::step::TaskRunner;
use crate::workflow::TaskOutcome;

pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    runner: Arc<dyn TaskRunner>,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn TaskRunner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            runner,
            poll_interval,
        }
    }

    /// Handles at most one job. Returns true if a job was processed.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.dequeue(self.poll_interval).await? else {
            return Ok(false);
        };

        debug!(
            "Worker picked job {} (execution {}, task '{}')",
            job.job_id, job.execution_id, job.task.name
        );
        let result = self.runner.run(&job.task).await;
        if let Err(e) = &result {
            warn!("Job {} failed: {}", job.job_id, e);
        }

        let outcome = TaskOutcome {
            task_id: job.task.id,
            result,
        };
        self.queue
            .report(&Completion::from_outcome(&job.execution_id, &outcome))
            .await?;
        Ok(true)
    }

    /// Processes jobs until `stop` is set. Returns the number of jobs handled.
    ///
    /// Queue errors are logged and retried after one poll interval.
    pub async fn run(&self, stop: &AtomicBool) -> usize {
        info!("Worker started (poll interval {:?})", self.poll_interval);
        let mut handled = 0;

        while !stop.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Worker queue error: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!("Worker stopped after {} job(s)", handled);
        handled
    }
}
