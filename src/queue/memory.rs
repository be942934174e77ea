//! In-process job queue.
//!
//! Completions nobody collects (a worker reporting after the backend gave
//! up on the job) are dropped once they have sat for the completion TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use super::{Completion, Job, JobQueue, COMPLETION_TTL};
use crate::error::{EngineError, Result};

/// Completions buffered for one execution.
struct Buffered {
    items: VecDeque<Completion>,
    touched: Instant,
}

/// Deadline `wait` from now, saturating instead of overflowing.
fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

/// Job queue held in process memory.
///
/// Waiters register interest with [`Notify`] before checking the queue, so a
/// push between the check and the wait is never missed.
pub struct MemoryJobQueue {
    jobs: Mutex<VecDeque<Job>>,
    completions: Mutex<HashMap<String, Buffered>>,
    completion_ttl: Duration,
    job_ready: Notify,
    completion_ready: Notify,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::with_completion_ttl(COMPLETION_TTL)
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue dropping uncollected completions after `ttl`.
    pub fn with_completion_ttl(ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            completions: Mutex::new(HashMap::new()),
            completion_ttl: ttl,
            job_ready: Notify::new(),
            completion_ready: Notify::new(),
        }
    }

    /// Number of executions with buffered completions.
    pub fn buffered_executions(&self) -> usize {
        self.completions.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of jobs not yet taken by a worker.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    fn pop_job(&self) -> Result<Option<Job>> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| EngineError::Queue("job queue lock poisoned".into()))?;
        Ok(jobs.pop_front())
    }

    fn pop_completion(&self, execution_id: &str) -> Result<Option<Completion>> {
        let mut completions = self
            .completions
            .lock()
            .map_err(|_| EngineError::Queue("completion lock poisoned".into()))?;
        let Some(pending) = completions.get_mut(execution_id) else {
            return Ok(None);
        };
        let next = pending.items.pop_front();
        if pending.items.is_empty() {
            completions.remove(execution_id);
        }
        Ok(next)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<()> {
        self.jobs
            .lock()
            .map_err(|_| EngineError::Queue("job queue lock poisoned".into()))?
            .push_back(job.clone());
        trace!("Enqueued job {} (task {})", job.job_id, job.task.id);
        self.job_ready.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>> {
        let deadline = deadline_after(wait);
        loop {
            let notified = self.job_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop_job()? {
                return Ok(Some(job));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.pop_job();
            }
        }
    }

    async fn report(&self, completion: &Completion) -> Result<()> {
        {
            let mut completions = self
                .completions
                .lock()
                .map_err(|_| EngineError::Queue("completion lock poisoned".into()))?;
            let now = Instant::now();
            let ttl = self.completion_ttl;
            completions.retain(|execution_id, buffered| {
                let live = now.duration_since(buffered.touched) < ttl;
                if !live {
                    debug!(
                        "Dropping {} uncollected completion(s) of execution {}",
                        buffered.items.len(),
                        execution_id
                    );
                }
                live
            });

            let buffered = completions
                .entry(completion.execution_id.clone())
                .or_insert_with(|| Buffered {
                    items: VecDeque::new(),
                    touched: now,
                });
            buffered.items.push_back(completion.clone());
            buffered.touched = now;
        }
        self.completion_ready.notify_waiters();
        Ok(())
    }

    async fn next_completion(
        &self,
        execution_id: &str,
        wait: Duration,
    ) -> Result<Option<Completion>> {
        let deadline = deadline_after(wait);
        loop {
            let notified = self.completion_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(completion) = self.pop_completion(execution_id)? {
                return Ok(Some(completion));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.pop_completion(execution_id);
            }
        }
    }
}
