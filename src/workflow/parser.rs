//! Workflow Parser
//!
//! Loads workflow definitions from YAML files. Loaded workflows are sorted
//! by task order and validated; identifiers are assigned later, when the
//! workflow is inserted into a store.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Workflow;
use super::validator::validate_workflow;
use crate::error::{EngineError, Result};

/// Loads a workflow from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the workflow YAML file
///
/// # Returns
///
/// * `Ok(Workflow)` - Parsed, ordered and validated workflow
/// * `Err` - Read, parse or validation error
///
/// # Example
///
/// ```rust,no_run
/// use stepwise::workflow::parser::load_workflow;
///
/// let workflow = load_workflow("nightly.yaml").expect("Failed to load workflow");
/// println!("Loaded {} tasks", workflow.tasks.len());
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::NotFound(format!("workflow file '{}': {}", path.display(), e))
    })?;

    let mut workflow = parse_workflow(&content)?;

    if workflow.name.trim().is_empty() {
        workflow.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    info!(
        "Workflow '{}' loaded with {} tasks",
        workflow.name,
        workflow.tasks.len()
    );
    Ok(workflow)
}

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(content: &str) -> Result<Workflow> {
    let mut workflow: Workflow = serde_yaml::from_str(content)?;
    workflow.sort_tasks();

    for task in &workflow.tasks {
        debug!(
            "Parsed task '{}' (order {}, {})",
            task.name, task.order, task.execution_mode
        );
    }

    validate_workflow(&workflow)?;
    Ok(workflow)
}
