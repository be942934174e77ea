//! Redis job queue.
//!
//! Jobs are JSON documents pushed onto one shared list; completions go to a
//! per-execution list so each scheduler only sees its own results.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use redis::Client;

use super::{Completion, Job, JobQueue, COMPLETION_TTL};
use crate::error::Result;

/// List holding jobs waiting for a worker.
const JOBS_KEY: &str = "stepwise:jobs";

/// Prefix of the per-execution completion lists.
const DONE_KEY_PREFIX: &str = "stepwise:done";

/// BRPOP treats 0 as "block forever", so waits are clamped above it.
const MIN_BLOCK_SECS: f64 = 0.01;

fn done_key(execution_id: &str) -> String {
    format!("{}:{}", DONE_KEY_PREFIX, execution_id)
}

fn block_secs(wait: Duration) -> f64 {
    wait.as_secs_f64().max(MIN_BLOCK_SECS)
}

/// Job queue on Redis lists.
pub struct RedisJobQueue {
    client: Client,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        info!("Redis job queue configured ({})", redis_url);
        Ok(Self { client })
    }

    async fn blocking_pop(&self, key: &str, wait: Duration) -> Result<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(block_secs(wait))
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, payload)| payload))
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(JOBS_KEY)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!("Enqueued job {} for task {}", job.job_id, job.task.id);
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>> {
        match self.blocking_pop(JOBS_KEY, wait).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn report(&self, completion: &Completion) -> Result<()> {
        let key = done_key(&completion.execution_id);
        let payload = serde_json::to_string(completion)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(COMPLETION_TTL.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn next_completion(
        &self,
        execution_id: &str,
        wait: Duration,
    ) -> Result<Option<Completion>> {
        match self.blocking_pop(&done_key(execution_id), wait).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}
