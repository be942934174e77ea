//! Inline backend: runs tasks as tasks on the scheduler's own runtime.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};

use super::backend::ExecutorBackend;
use super::step::TaskRunner;
use crate::error::TaskError;
use crate::workflow::{TaskDescriptor, TaskOutcome};

pub struct InlineBackend {
    runner: Arc<dyn TaskRunner>,
}

impl InlineBackend {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ExecutorBackend for InlineBackend {
    async fn run_batch(&self, execution_id: &str, tasks: &[TaskDescriptor]) -> Vec<TaskOutcome> {
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let runner = Arc::clone(&self.runner);
            let task = task.clone();
            handles.push((task.id, tokio::spawn(async move { runner.run(&task).await })));
            // Give the spawned task a chance to start before the next spawn
            tokio::task::yield_now().await;
        }
        debug!(
            "Execution {}: {} task(s) started inline",
            execution_id,
            handles.len()
        );

        let mut outcomes = Vec::with_capacity(handles.len());
        for (task_id, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => TaskOutcome {
                    task_id,
                    result,
                },
                Err(join_error) => {
                    error!(
                        "Execution {}: task {} aborted: {}",
                        execution_id, task_id, join_error
                    );
                    TaskOutcome::failure(task_id, TaskError::RuntimeFault(join_error.to_string()))
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::step::StepRunner;
    use crate::workflow::ExecutionMode;
    use std::time::{Duration, Instant};

    struct PanickingRunner;

    #[async_trait]
    impl TaskRunner for PanickingRunner {
        async fn run(&self, task: &TaskDescriptor) -> Result<(), TaskError> {
            if task.order == 2 {
                panic!("runner exploded");
            }
            Ok(())
        }
    }

    fn sleepy(id: i64, millis: u64) -> TaskDescriptor {
        TaskDescriptor::new(format!("t{}", id), id)
            .with_ids(id, 1)
            .with_mode(ExecutionMode::Async)
            .with_parameter("duration", millis as f64 / 1000.0)
    }

    #[tokio::test]
    async fn test_outcomes_follow_input_order() {
        let backend = InlineBackend::new(Arc::new(StepRunner::default()));
        let tasks = vec![
            sleepy(1, 30),
            TaskDescriptor::new("f", 2)
                .with_ids(2, 1)
                .with_parameter("fail", "nope"),
            sleepy(3, 0),
        ];

        let outcomes = backend.run_batch("e", &tasks).await;
        assert_eq!(
            outcomes.iter().map(|o| o.task_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[1].result, Err(TaskError::Execution("nope".into())));
    }

    #[tokio::test]
    async fn test_batch_runs_concurrently() {
        let backend = InlineBackend::new(Arc::new(StepRunner::default()));
        let tasks: Vec<_> = (1..=4).map(|id| sleepy(id, 200)).collect();

        let started = Instant::now();
        let outcomes = backend.run_batch("e", &tasks).await;
        assert!(outcomes.iter().all(TaskOutcome::is_success));
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_panic_becomes_runtime_fault() {
        let backend = InlineBackend::new(Arc::new(PanickingRunner));
        let tasks = vec![
            TaskDescriptor::new("a", 1).with_ids(1, 1),
            TaskDescriptor::new("b", 2).with_ids(2, 1),
        ];

        let outcomes = backend.run_batch("e", &tasks).await;
        assert!(outcomes[0].is_success());
        assert!(matches!(outcomes[1].result, Err(TaskError::RuntimeFault(_))));
    }
}
