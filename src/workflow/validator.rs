//! Workflow Validation
//!
//! Checks a task list before an execution is created:
//! - Task names are present
//! - Order values are unique within the workflow
//! - Every task belongs to the workflow being executed
//!
//! A list that fails validation never produces an execution record.

use std::collections::HashMap;

use log::{debug, info};

use super::model::{TaskDescriptor, Workflow, WorkflowId};
use crate::error::EngineError;

/// Validation problems found in a task list.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow(String),
    EmptyTaskName { order: i64 },
    DuplicateOrder { order: i64, first: String, second: String },
    ForeignTask { task: String, workflow_id: WorkflowId },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow(name) => write!(f, "Workflow '{}' has no tasks", name),
            Self::EmptyTaskName { order } => {
                write!(f, "Task at order {} has an empty name", order)
            }
            Self::DuplicateOrder {
                order,
                first,
                second,
            } => write!(
                f,
                "Tasks '{}' and '{}' share order {}",
                first, second, order
            ),
            Self::ForeignTask { task, workflow_id } => write!(
                f,
                "Task '{}' belongs to workflow {} instead",
                task, workflow_id
            ),
        }
    }
}

/// Collects every problem in an ordered task list.
fn collect_errors(workflow_id: Option<WorkflowId>, tasks: &[TaskDescriptor]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen_orders: HashMap<i64, &str> = HashMap::new();

    for task in tasks {
        if task.name.trim().is_empty() {
            errors.push(ValidationError::EmptyTaskName { order: task.order });
        }

        if let Some(first) = seen_orders.insert(task.order, task.name.as_str()) {
            errors.push(ValidationError::DuplicateOrder {
                order: task.order,
                first: first.to_string(),
                second: task.name.clone(),
            });
        }

        if let Some(expected) = workflow_id {
            if task.workflow_id != expected {
                errors.push(ValidationError::ForeignTask {
                    task: task.name.clone(),
                    workflow_id: task.workflow_id,
                });
            }
        }

        debug!(
            "Task '{}' (order {}, {})",
            task.name, task.order, task.execution_mode
        );
    }

    errors
}

fn into_result(errors: Vec<ValidationError>) -> Result<(), EngineError> {
    if errors.is_empty() {
        return Ok(());
    }
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    Err(EngineError::Validation(messages.join("\n")))
}

/// Validates the tasks loaded for an execution of `workflow_id`.
///
/// An empty list is not a validation error here; the scheduler reports it
/// as a missing workflow.
pub fn validate_tasks(workflow_id: WorkflowId, tasks: &[TaskDescriptor]) -> Result<(), EngineError> {
    into_result(collect_errors(Some(workflow_id), tasks))?;
    info!("Validated {} tasks for workflow {}", tasks.len(), workflow_id);
    Ok(())
}

/// Validates a workflow definition before it is stored.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), EngineError> {
    if workflow.tasks.is_empty() {
        return into_result(vec![ValidationError::EmptyWorkflow(workflow.name.clone())]);
    }
    into_result(collect_errors(None, &workflow.tasks))
}
