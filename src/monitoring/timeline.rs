//! Execution Log
//!
//! Append-only record of what happened to each step during a run. The log
//! is stored in checkpoints, so a resumed run continues the same log and
//! its timing offsets keep increasing across the interruption.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step condition was false
    Skipped,
    /// Step failed
    Failed,
    /// Run resumed from a checkpoint
    Resumed,
    /// Checkpoint written after a step
    CheckpointSaved,
}

/// A single entry in the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Step name (or workflow name for run-level events)
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub event: EventType,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the run (including earlier, resumed attempts) began
    pub offset_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Append-only execution log.
///
/// Serializes as a plain list of entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<LogEntry>", into = "Vec<LogEntry>")]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
    start_time: Instant,
    base_offset_ms: u64,
}

impl ExecutionLog {
    /// Creates a new, empty log starting now.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            start_time: Instant::now(),
            base_offset_ms: 0,
        }
    }

    /// Appends an event for a step.
    pub fn record(
        &mut self,
        step: &str,
        step_type: Option<&str>,
        index: Option<usize>,
        event: EventType,
        message: Option<String>,
    ) -> &LogEntry {
        let offset_ms = self.base_offset_ms + self.start_time.elapsed().as_millis() as u64;
        self.entries.push(LogEntry {
            step: step.to_string(),
            step_type: step_type.map(str::to_string),
            index,
            event,
            timestamp: Utc::now(),
            offset_ms,
            message,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Returns all recorded entries in order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries for one step.
    pub fn events_for<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.entries.iter().filter(move |e| e.step == step)
    }

    /// Time since this log instance was created (not counting earlier attempts).
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns step durations in milliseconds, from each step's last start
    /// to its completion or failure.
    pub fn durations(&self) -> HashMap<String, u64> {
        let mut starts: HashMap<&str, u64> = HashMap::new();
        let mut durations = HashMap::new();

        for entry in &self.entries {
            match entry.event {
                EventType::Started => {
                    starts.insert(entry.step.as_str(), entry.offset_ms);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(entry.step.as_str()) {
                        durations.insert(entry.step.clone(), entry.offset_ms.saturating_sub(*start));
                    }
                }
                _ => {}
            }
        }

        durations
    }

    /// Generates an ASCII Gantt chart of step execution.
    ///
    /// Each executed step is shown as a bar indicating when it ran relative
    /// to the whole log; skipped steps are listed without a bar.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.entries.last().map(|e| e.offset_ms).unwrap_or(0).max(1);

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut spans: Vec<(String, u64, u64, bool)> = Vec::new();
        for entry in &self.entries {
            match entry.event {
                EventType::Started => spans.push((entry.step.clone(), entry.offset_ms, entry.offset_ms, false)),
                EventType::Completed | EventType::Failed => {
                    if let Some(span) = spans.iter_mut().rev().find(|s| s.0 == entry.step) {
                        span.2 = entry.offset_ms;
                        span.3 = entry.event == EventType::Failed;
                    }
                }
                EventType::Skipped => {
                    output.push_str(&format!("{} | (skipped)\n", truncate(&entry.step, 12)));
                }
                _ => {}
            }
        }

        for (step, start, end, failed) in spans {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&(if failed { "x" } else { "#" }).repeat(width));

            output.push_str(&format!("{} |{}| ({} ms)\n", truncate(&step, 12), bar, end - start));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Equality compares entries only.
impl PartialEq for ExecutionLog {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl From<Vec<LogEntry>> for ExecutionLog {
    fn from(entries: Vec<LogEntry>) -> Self {
        let base_offset_ms = entries.last().map(|e| e.offset_ms).unwrap_or(0);
        Self {
            entries,
            start_time: Instant::now(),
            base_offset_ms,
        }
    }
}

impl From<ExecutionLog> for Vec<LogEntry> {
    fn from(log: ExecutionLog) -> Self {
        log.entries
    }
}

/// Pads or truncates a step name to a fixed column width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_log_creation() {
        let log = ExecutionLog::new();
        assert!(log.is_empty());
    }

    #[test]
    fn test_record_events() {
        let mut log = ExecutionLog::new();
        log.record("step1", Some("llm"), Some(0), EventType::Started, None);
        thread::sleep(Duration::from_millis(10));
        let entry = log.record("step1", Some("llm"), Some(0), EventType::Completed, None);
        assert!(entry.offset_ms >= 10);

        assert_eq!(log.len(), 2);
        assert_eq!(log.events_for("step1").count(), 2);
    }

    #[test]
    fn test_durations() {
        let mut log = ExecutionLog::new();
        log.record("step1", None, None, EventType::Started, None);
        thread::sleep(Duration::from_millis(50));
        log.record("step1", None, None, EventType::Completed, None);
        log.record("step2", None, None, EventType::Started, None);

        let durations = log.durations();
        assert!(durations["step1"] >= 50);
        assert!(!durations.contains_key("step2"));
    }

    #[test]
    fn test_serializes_as_list() {
        let mut log = ExecutionLog::new();
        log.record("a", Some("set"), Some(0), EventType::Skipped, Some("reason".into()));

        let value = serde_json::to_value(&log).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["event"], "skipped");

        let back: ExecutionLog = serde_json::from_value(value).unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn test_restored_log_keeps_offsets_increasing() {
        let mut log = ExecutionLog::new();
        log.record("a", None, None, EventType::Started, None);
        thread::sleep(Duration::from_millis(20));
        log.record("a", None, None, EventType::Completed, None);
        let last = log.entries()[1].offset_ms;

        let mut restored: ExecutionLog = serde_json::from_str(&serde_json::to_string(&log).unwrap()).unwrap();
        let entry = restored.record("wf", None, None, EventType::Resumed, None);
        assert!(entry.offset_ms >= last);
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut log = ExecutionLog::new();
        log.record("step1", None, None, EventType::Started, None);
        thread::sleep(Duration::from_millis(20));
        log.record("step1", None, None, EventType::Completed, None);
        log.record("step2", None, None, EventType::Skipped, None);
        log.record("step3", None, None, EventType::Started, None);
        thread::sleep(Duration::from_millis(20));
        log.record("step3", None, None, EventType::Failed, None);

        let chart = log.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("(skipped)"));
        assert!(chart.contains('x'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionLog::new().gantt_chart();
        assert!(chart.contains("Timeline"));
    }

    #[test]
    fn test_truncate_long_names() {
        assert_eq!(truncate("a_very_long_step_name", 12), "a_very_lo...");
        assert_eq!(truncate("short", 8), "short   ");
    }
}
