//! Redis cache invalidation.

use async_trait::async_trait;
use log::{debug, info};
use redis::Client;

use super::{execution_keys, execution_list_patterns, CacheInvalidator};
use crate::error::Result;
use crate::workflow::WorkflowId;

/// Drops cached execution snapshots and list pages from Redis.
pub struct RedisCacheInvalidator {
    client: Client,
}

impl RedisCacheInvalidator {
    /// Creates an invalidator for the given Redis URL. No connection is made
    /// until the first invalidation.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        info!("Redis cache invalidation enabled ({})", redis_url);
        Ok(Self { client })
    }
}

#[async_trait]
impl CacheInvalidator for RedisCacheInvalidator {
    async fn invalidate(&self, workflow_id: WorkflowId, execution_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut doomed = execution_keys(execution_id);
        for pattern in execution_list_patterns(workflow_id) {
            let matched: Vec<String> = redis::cmd("KEYS")
                .arg(&pattern)
                .query_async(&mut conn)
                .await?;
            doomed.extend(matched);
        }
        doomed.sort();
        doomed.dedup();

        let removed: i64 = redis::cmd("DEL").arg(&doomed).query_async(&mut conn).await?;
        debug!(
            "Invalidated {} cache keys for execution {}",
            removed, execution_id
        );
        Ok(())
    }
}
