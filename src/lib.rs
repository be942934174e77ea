//! Stepwise - Workflow Execution Engine
//!
//! Runs ordered workflows of tasks. Consecutive synchronous tasks run one at
//! a time, consecutive asynchronous tasks run together as a batch, and the
//! first failure stops the execution. Every status change is persisted and
//! then announced to a cache invalidator.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`workflow`]: Workflow definitions, validation, batching and execution records
//! - [`execution`]: The scheduler and the inline, queued and distributed backends
//! - [`queue`]: Job queue and worker used by the queued backend
//! - [`storage`]: Status stores (in-memory and SQLite)
//! - [`cache`]: Cache invalidation after status changes
//! - [`monitoring`]: Execution timelines
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stepwise::cache::NoopInvalidator;
//! use stepwise::execution::{InlineBackend, Scheduler, StepRunner};
//! use stepwise::storage::{SqliteStore, StatusStore};
//! use stepwise::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> stepwise::Result<()> {
//!     // Store the workflow definition
//!     let store = Arc::new(SqliteStore::open("stepwise.db")?);
//!     let workflow = store.insert_workflow(&load_workflow("nightly.yaml")?).await?;
//!
//!     // Run it on the current runtime
//!     let backend = Arc::new(InlineBackend::new(Arc::new(StepRunner::default())));
//!     let scheduler = Scheduler::new(store, Arc::new(NoopInvalidator), backend);
//!
//!     // The driver runs in the background; poll until it finishes
//!     let ticket = scheduler.start_execution(workflow.id).await?;
//!     let record = scheduler
//!         .wait_for_completion(&ticket.execution_id, Duration::from_millis(500))
//!         .await?;
//!     println!("Execution {} finished as {}", record.id, record.status);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod queue;
pub mod storage;
pub mod workflow;

// Re-export commonly used types
pub use config::{BackendKind, EngineConfig};
pub use error::{EngineError, Result, TaskError};
pub use execution::{ExecutionTicket, Scheduler};
pub use workflow::model::{ExecutionMode, TaskDescriptor, Workflow};
pub use workflow::parser::load_workflow;
pub use workflow::state::{ExecutionRecord, ExecutionStatus, TaskStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Stepwise";
