//! Cache Invalidation
//!
//! Read caches in front of the status store are dropped whenever the
//! scheduler persists a status change. Invalidation is fire-and-forget: a
//! failure is logged by the caller and never affects the execution.

pub mod redis_cache;

use async_trait::async_trait;

use crate::error::Result;
use crate::workflow::WorkflowId;

pub use redis_cache::RedisCacheInvalidator;

/// Collaborator notified after every persisted status change.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, workflow_id: WorkflowId, execution_id: &str) -> Result<()>;
}

/// Invalidator used when caching is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

#[async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn invalidate(&self, _workflow_id: WorkflowId, _execution_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Exact keys dropped for one execution.
pub fn execution_keys(execution_id: &str) -> Vec<String> {
    vec![format!("execution:{}", execution_id)]
}

/// Key patterns dropped for one execution of a workflow.
pub fn execution_list_patterns(workflow_id: WorkflowId) -> Vec<String> {
    vec![
        "executions:list:*".to_string(),
        format!("executions:list:{}:*", workflow_id),
    ]
}
