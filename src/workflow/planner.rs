//! Execution Planner
//!
//! Splits an ordered task list into batches: maximal contiguous runs of
//! tasks sharing an execution mode. A sync batch is dispatched one task at a
//! time; an async batch is dispatched as a whole.

use log::debug;

use super::model::{ExecutionMode, TaskDescriptor};

/// A maximal contiguous run of same-mode tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub mode: ExecutionMode,
    pub tasks: Vec<TaskDescriptor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns the units the backend receives, in dispatch order.
    ///
    /// Sync batches yield one single-task slice per task so that each task
    /// reaches a terminal state before the next one starts.
    pub fn dispatch_units(&self) -> Vec<&[TaskDescriptor]> {
        match self.mode {
            ExecutionMode::Sync => self.tasks.chunks(1).collect(),
            ExecutionMode::Async => vec![self.tasks.as_slice()],
        }
    }
}

/// Ordered sequence of batches for one execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionPlan {
    batches: Vec<Batch>,
}

impl ExecutionPlan {
    /// Builds a plan from tasks already sorted by `order`.
    pub fn from_tasks(tasks: &[TaskDescriptor]) -> Self {
        let mut batches: Vec<Batch> = Vec::new();

        for task in tasks {
            match batches.last_mut() {
                Some(batch) if batch.mode == task.execution_mode => batch.tasks.push(task.clone()),
                _ => batches.push(Batch {
                    mode: task.execution_mode,
                    tasks: vec![task.clone()],
                }),
            }
        }

        debug!(
            "Planned {} batches: {:?}",
            batches.len(),
            batches
                .iter()
                .map(|b| format!("{}x{}", b.mode, b.len()))
                .collect::<Vec<_>>()
        );

        Self { batches }
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
