//! Distributed backend: runs tasks on a dedicated multi-threaded worker
//! cluster, separate from the scheduler's runtime, with a cap on how many
//! tasks of one batch run at once.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;

use super::backend::ExecutorBackend;
use super::step::TaskRunner;
use crate::error::{EngineError, Result, TaskError};
use crate::workflow::{TaskDescriptor, TaskOutcome};

pub struct DistributedBackend {
    runner: Arc<dyn TaskRunner>,
    /// Always `Some` until drop
    cluster: Option<Runtime>,
    permits: Arc<Semaphore>,
}

impl DistributedBackend {
    /// Starts a cluster of `workers` threads admitting at most
    /// `max_parallel` tasks at a time.
    pub fn new(runner: Arc<dyn TaskRunner>, workers: usize, max_parallel: usize) -> Result<Self> {
        if workers == 0 || max_parallel == 0 {
            return Err(EngineError::Config(
                "distributed backend needs at least one worker and one parallel slot".into(),
            ));
        }

        let cluster = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("stepwise-cluster")
            .enable_all()
            .build()
            .map_err(|e| EngineError::Backend(format!("failed to start worker cluster: {}", e)))?;

        info!(
            "Worker cluster started ({} threads, {} parallel tasks)",
            workers, max_parallel
        );
        Ok(Self {
            runner,
            cluster: Some(cluster),
            permits: Arc::new(Semaphore::new(max_parallel)),
        })
    }
}

impl Drop for DistributedBackend {
    fn drop(&mut self) {
        // Dropping a runtime from inside another runtime panics
        if let Some(cluster) = self.cluster.take() {
            cluster.shutdown_background();
        }
    }
}

#[async_trait]
impl ExecutorBackend for DistributedBackend {
    async fn run_batch(&self, execution_id: &str, tasks: &[TaskDescriptor]) -> Vec<TaskOutcome> {
        let Some(cluster) = &self.cluster else {
            return tasks
                .iter()
                .map(|t| {
                    TaskOutcome::failure(t.id, TaskError::RuntimeFault("cluster shut down".into()))
                })
                .collect();
        };

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let runner = Arc::clone(&self.runner);
            let permits = Arc::clone(&self.permits);
            let task_id = task.id;
            let task = task.clone();
            let handle = cluster.handle().spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| TaskError::RuntimeFault(format!("semaphore closed: {}", e)))?;
                runner.run(&task).await
            });
            handles.push((task_id, handle));
        }
        debug!(
            "Execution {}: {} task(s) submitted to the worker cluster",
            execution_id,
            handles.len()
        );

        let mut outcomes = Vec::with_capacity(handles.len());
        for (task_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(
                        "Execution {}: task {} faulted on the cluster: {}",
                        execution_id, task_id, join_error
                    );
                    Err(TaskError::RuntimeFault(join_error.to_string()))
                }
            };
            outcomes.push(TaskOutcome { task_id, result });
        }
        outcomes
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}
