//! In-memory status store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::RwLock;

use super::StatusStore;
use crate::error::{EngineError, Result};
use crate::workflow::{ExecutionRecord, ExecutionStatus, TaskDescriptor, Workflow, WorkflowId};

/// Status store backed by process-local maps.
///
/// Workflows and executions live in separate locks, and each lock is held
/// only for the duration of a map operation.
#[derive(Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    executions: RwLock<HashMap<String, ExecutionRecord>>,
    next_workflow_id: AtomicI64,
    next_task_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored execution records.
    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
        let mut stored = workflow.clone();
        stored.id = self.next_workflow_id.fetch_add(1, Ordering::SeqCst) + 1;
        for task in &mut stored.tasks {
            task.id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
            task.workflow_id = stored.id;
        }
        stored.sort_tasks();

        debug!("Stored workflow '{}' as {}", stored.name, stored.id);
        self.workflows.write().await.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn load_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<TaskDescriptor>> {
        let workflows = self.workflows.read().await;
        let workflow = workflows
            .get(&workflow_id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;

        let mut tasks = workflow.tasks.clone();
        tasks.sort_by_key(|t| t.order);
        Ok(tasks)
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut executions = self.executions.write().await;
        if let Some(stored) = executions.get(&record.id) {
            if stored.is_terminal() && stored.status != record.status {
                return Err(EngineError::Conflict(format!(
                    "execution {} is already {}",
                    record.id, stored.status
                )));
            }
        }
        executions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn touch_execution(
        &self,
        execution_id: &str,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(execution_id) {
            Some(record) if record.is_owned_by(owner) && !record.is_terminal() => {
                record.heartbeat_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))
    }

    async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }
}
