//! Workflow Data Model
//!
//! Core data structures describing a workflow and its ordered tasks.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: nightly-report
//! description: Collect, transform and publish the nightly numbers
//! tasks:
//!   - name: fetch
//!     order: 1
//!     parameters:
//!       duration: 2
//!
//!   - name: render_pdf
//!     order: 2
//!     execution_mode: async
//!     parameters:
//!       command: ./render.sh pdf
//!
//!   - name: render_html
//!     order: 3
//!     execution_mode: async
//!     parameters:
//!       command: ./render.sh html
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a stored workflow.
pub type WorkflowId = i64;

/// Identifier of a stored task.
pub type TaskId = i64;

/// How a task is dispatched relative to its neighbours.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Runs alone; the next task starts only after this one is terminal.
    #[default]
    Sync,
    /// Runs concurrently with adjacent async tasks.
    Async,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sync" => Some(Self::Sync),
            "async" => Some(Self::Async),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable definition of one workflow step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    /// Store-assigned identifier (0 until the task is persisted)
    #[serde(default)]
    pub id: TaskId,

    /// Workflow this task belongs to (0 until persisted)
    #[serde(default)]
    pub workflow_id: WorkflowId,

    /// Human-readable task name
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Position in the workflow; ascending order is execution order
    pub order: i64,

    /// Dispatch mode; tasks without one run synchronously
    #[serde(default, alias = "execution_type")]
    pub execution_mode: ExecutionMode,

    /// Opaque parameters handed to the task runner
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl TaskDescriptor {
    /// Creates a new synchronous task with no parameters.
    ///
    /// # Example
    ///
    /// ```
    /// use stepwise::workflow::{ExecutionMode, TaskDescriptor};
    ///
    /// let task = TaskDescriptor::new("render", 2)
    ///     .with_mode(ExecutionMode::Async)
    ///     .with_parameter("duration", 0.5);
    /// assert!(task.is_async());
    /// ```
    pub fn new(name: impl Into<String>, order: i64) -> Self {
        Self {
            id: 0,
            workflow_id: 0,
            name: name.into().trim().to_string(),
            description: None,
            order,
            execution_mode: ExecutionMode::Sync,
            parameters: Map::new(),
        }
    }

    /// Sets the store identifiers for this task.
    pub fn with_ids(mut self, id: TaskId, workflow_id: WorkflowId) -> Self {
        self.id = id;
        self.workflow_id = workflow_id;
        self
    }

    /// Sets the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a single parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn is_async(&self) -> bool {
        self.execution_mode == ExecutionMode::Async
    }

    /// Returns a string parameter, if present and a string.
    pub fn string_parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Returns a numeric parameter as f64, if present and numeric.
    pub fn number_parameter(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(Value::as_f64)
    }
}

/// A named, ordered collection of tasks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    /// Store-assigned identifier (0 until persisted)
    #[serde(default)]
    pub id: WorkflowId,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Tasks, kept sorted by `order`
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: None,
            tasks: Vec::new(),
        }
    }

    /// Creates a workflow from a list of tasks, sorted by order.
    pub fn from_tasks(name: impl Into<String>, tasks: Vec<TaskDescriptor>) -> Self {
        let mut workflow = Self::new(name);
        workflow.tasks = tasks;
        workflow.sort_tasks();
        workflow
    }

    /// Adds a task, keeping the list ordered.
    ///
    /// Fails if another task already uses the same order value.
    pub fn add_task(&mut self, task: TaskDescriptor) -> Result<(), String> {
        if self.tasks.iter().any(|t| t.order == task.order) {
            return Err(format!(
                "Task '{}' reuses order {} within workflow '{}'",
                task.name, task.order, self.name
            ));
        }
        self.tasks.push(task);
        self.sort_tasks();
        Ok(())
    }

    /// Gets a task by ID.
    pub fn get_task(&self, id: TaskId) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Stable sort by order so equal orders keep their declared position.
    pub fn sort_tasks(&mut self) {
        self.tasks.sort_by_key(|t| t.order);
    }

    /// Returns the number of tasks in the workflow.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the workflow has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
