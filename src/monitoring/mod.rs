//! Execution Monitoring Module
//!
//! Reporting helpers for finished or in-flight executions.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Per-task timing spans and Gantt charts

pub mod timeline;

pub use timeline::{ExecutionTimeline, TimelineSpan};
