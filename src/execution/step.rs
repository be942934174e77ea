//! Task Execution
//!
//! Performs the work of a single task. Behaviour is driven by the task's
//! parameters:
//! - `fail`: fail immediately with the given message
//! - `command`: run through `bash -c`, optionally in a working directory
//! - `duration`: sleep for the given number of seconds
//!
//! A task with neither `command` nor `duration` sleeps for one second.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use tokio::process::Command;

use crate::error::TaskError;
use crate::workflow::TaskDescriptor;

/// Sleep applied when a task specifies no work at all.
const DEFAULT_DURATION_SECS: f64 = 1.0;

/// Performs one task's work.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &TaskDescriptor) -> Result<(), TaskError>;
}

/// Default task runner.
#[derive(Debug, Clone, Default)]
pub struct StepRunner {
    working_dir: Option<PathBuf>,
}

impl StepRunner {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }

    async fn run_command(&self, task: &TaskDescriptor, command_text: &str) -> Result<(), TaskError> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command_text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        let output = cmd.output().await.map_err(|e| {
            TaskError::Execution(format!("failed to launch '{}': {}", task.name, e))
        })?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                debug!("Task '{}' output:\n{}", task.name, stdout.trim_end());
            }
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Task '{}' failed with exit code: {:?}",
            task.name,
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr.trim_end());
        }

        Err(TaskError::Execution(failure_message(
            &task.name,
            output.status.code(),
            &stderr,
        )))
    }
}

/// Builds the stored error of a failed command from its exit code and the
/// last non-empty stderr line.
fn failure_message(task_name: &str, code: Option<i32>, stderr: &str) -> String {
    let exit = match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    };
    match stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => format!("task '{}' failed ({}): {}", task_name, exit, line),
        None => format!("task '{}' failed ({})", task_name, exit),
    }
}

/// Resolves how long a task should sleep.
fn resolve_duration(task: &TaskDescriptor) -> Duration {
    let secs = match task.number_parameter("duration") {
        Some(secs) => secs,
        None if task.string_parameter("command").is_some() => 0.0,
        None => DEFAULT_DURATION_SECS,
    };
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[async_trait]
impl TaskRunner for StepRunner {
    async fn run(&self, task: &TaskDescriptor) -> Result<(), TaskError> {
        debug!(
            "Running task '{}' (id {}, order {}, {})",
            task.name, task.id, task.order, task.execution_mode
        );

        if let Some(message) = task.string_parameter("fail") {
            return Err(TaskError::Execution(message.to_string()));
        }

        if let Some(command_text) = task.string_parameter("command") {
            self.run_command(task, command_text).await?;
        }

        let duration = resolve_duration(task);
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }

        debug!("Task '{}' completed successfully", task.name);
        Ok(())
    }
}
