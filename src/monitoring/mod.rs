//! Monitoring Module
//!
//! Tracks what happened during a workflow run.
//!
//! # Components
//!
//! - [`ExecutionLog`]: Append-only per-step event log with timing reports

pub mod timeline;

pub use timeline::{EventType, ExecutionLog, LogEntry};
