//! Execution Timeline
//!
//! Builds per-task timing spans from an execution record's timestamps and
//! renders them as an ASCII Gantt chart.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::workflow::{ExecutionRecord, TaskId, TaskStatus};

/// Width of the chart area in characters.
const CHART_WIDTH: f64 = 50.0;

/// Width of the task label column.
const LABEL_WIDTH: usize = 12;

/// One task's time on the timeline, in milliseconds from execution start.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineSpan {
    pub task_id: TaskId,
    pub label: String,
    pub status: TaskStatus,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimelineSpan {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    fn bar_char(&self) -> char {
        match self.status {
            TaskStatus::Failed => 'X',
            TaskStatus::Skipped => '~',
            _ => '#',
        }
    }
}

/// Timing view of one execution.
///
/// Only tasks that were dispatched appear; pending tasks have no span.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    spans: Vec<TimelineSpan>,
    total_ms: i64,
}

impl ExecutionTimeline {
    /// Builds a timeline from a record. `names` maps task ids to labels;
    /// tasks without a name are labelled by id.
    pub fn from_record(record: &ExecutionRecord, names: &HashMap<TaskId, String>) -> Self {
        let origin = record.started_at;
        let ms_since = |t: DateTime<Utc>| (t - origin).num_milliseconds().max(0);

        let mut latest = record.completed_at.map(ms_since).unwrap_or(0);
        let mut spans = Vec::new();

        for entry in &record.task_statuses {
            let Some(started) = entry.started_at else {
                continue;
            };
            let start_ms = ms_since(started);
            let end_ms = entry.finished_at.map(ms_since).unwrap_or(start_ms).max(start_ms);
            latest = latest.max(end_ms);

            spans.push(TimelineSpan {
                task_id: entry.task_id,
                label: names
                    .get(&entry.task_id)
                    .cloned()
                    .unwrap_or_else(|| format!("task {}", entry.task_id)),
                status: entry.status,
                start_ms,
                end_ms,
            });
        }

        spans.sort_by_key(|s| s.start_ms);
        Self {
            spans,
            total_ms: latest,
        }
    }

    pub fn spans(&self) -> &[TimelineSpan] {
        &self.spans
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// `#` marks completed work, `X` a failed task and `~` a task whose
    /// result was discarded.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        if self.spans.is_empty() {
            return output;
        }

        let scale = CHART_WIDTH / self.total_ms.max(1) as f64;

        for span in &self.spans {
            let start_pos = (span.start_ms as f64 * scale) as usize;
            let width = (span.duration_ms() as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&span.bar_char().to_string().repeat(width));

            output.push_str(&format!(
                "{} |{:<chart$}| ({} ms, {})\n",
                truncate(&span.label, LABEL_WIDTH),
                bar,
                span.duration_ms(),
                span.status,
                chart = CHART_WIDTH as usize + 1
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", self.total_ms));
        output
    }
}

/// Pads or truncates a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
