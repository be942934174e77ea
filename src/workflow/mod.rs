//! Workflow Definition Module
//!
//! Provides data structures for workflow definitions and execution records.
//!
//! # Structure
//!
//! - [`model`]: Task descriptors and workflows
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Ordering and ownership checks
//! - [`planner`]: Batch partitioning
//! - [`state`]: Execution records and their state machine

pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use model::{ExecutionMode, TaskDescriptor, TaskId, Workflow, WorkflowId};
pub use parser::load_workflow;
pub use planner::{Batch, ExecutionPlan};
pub use state::{ExecutionRecord, ExecutionStatus, TaskOutcome, TaskStatus, TaskStatusEntry};
