//! Error Types
//!
//! Each layer of the engine raises its own error enum. Handler failures are
//! collected into [`HandlerError`], and every failure that leaves
//! [`Engine::execute`](crate::execution::Engine::execute) is reshaped into a
//! single [`ExecutionError`] carrying enough context to diagnose the run
//! without re-executing it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::client::ClientError;
use crate::store::schema::SchemaError;
use crate::store::session::SessionError;
use crate::workflow::condition::ConditionError;

/// Failure raised by a step handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The step configuration is missing a field or has the wrong shape.
    #[error("invalid step configuration: {0}")]
    Config(String),

    /// The step names another step that does not exist in the workflow.
    #[error("step '{step}' references unknown step '{reference}'")]
    DanglingReference { step: String, reference: String },

    /// The model client rejected or failed the request.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A session operation failed (including turn-limit violations).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Structured output did not satisfy its schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A loop or nested condition could not be parsed.
    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// A prompt or value template failed to render.
    #[error("template error: {0}")]
    Template(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Generic handler failure with a human-readable reason.
    #[error("{0}")]
    Failed(String),

    /// A nested step (loop body, fan-out task, retried call) failed.
    #[error("{context}: {source}")]
    Nested {
        context: String,
        source: Box<HandlerError>,
    },
}

impl From<minijinja::Error> for HandlerError {
    fn from(e: minijinja::Error) -> Self {
        HandlerError::Template(e.to_string())
    }
}

impl HandlerError {
    /// Wraps `source` with the position it failed at, keeping its kind.
    pub fn nested(context: impl Into<String>, source: HandlerError) -> Self {
        Self::Nested {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Maps the failure onto the run-level error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Nested { source, .. } => source.kind(),
            Self::Config(_) | Self::DanglingReference { .. } | Self::Condition(_) => {
                ErrorKind::Configuration
            }
            Self::Session(SessionError::Bounds { .. }) => ErrorKind::SessionBounds,
            Self::Schema(_) => ErrorKind::SchemaValidation,
            _ => ErrorKind::StepExecution,
        }
    }
}

/// Category of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed workflow, unknown step type or dangling reference.
    Configuration,
    /// A handler failed or reported failure; also used for internal faults.
    StepExecution,
    /// Step output failed its declared schema and was not stored.
    SchemaValidation,
    /// A session was continued past its turn limit.
    SessionBounds,
    /// The latest checkpoint could not be read back.
    CheckpointCorruption,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "ConfigurationError",
            Self::StepExecution => "StepExecutionError",
            Self::SchemaValidation => "SchemaValidationError",
            Self::SessionBounds => "SessionBoundsError",
            Self::CheckpointCorruption => "CheckpointCorruptionError",
        };
        f.write_str(name)
    }
}

/// Structured failure returned by the engine.
///
/// Completed results are never rolled back; the error only describes where
/// and why the run stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub workflow: String,
    pub step: Option<String>,
    pub step_type: Option<String>,
    /// Zero-based index of the failing step.
    pub position: Option<usize>,
    pub total_steps: usize,
    pub elapsed: Duration,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, workflow: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            workflow: workflow.into(),
            step: None,
            step_type: None,
            position: None,
            total_steps: 0,
            elapsed: Duration::ZERO,
            message: message.into(),
        }
    }

    /// Attaches the failing step.
    pub fn at_step(mut self, name: &str, step_type: &str, position: usize) -> Self {
        self.step = Some(name.to_string());
        self.step_type = Some(step_type.to_string());
        self.position = Some(position);
        self
    }

    pub fn with_total_steps(mut self, total: usize) -> Self {
        self.total_steps = total;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in workflow '{}'", self.kind, self.workflow)?;
        if let (Some(step), Some(position)) = (&self.step, self.position) {
            write!(
                f,
                " at step '{}' ({}, {}/{})",
                step,
                self.step_type.as_deref().unwrap_or("unknown"),
                position + 1,
                self.total_steps
            )?;
        }
        write!(f, " after {:.2?}: {}", self.elapsed, self.message)
    }
}

impl std::error::Error for ExecutionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_step_context() {
        let err = ExecutionError::new(ErrorKind::StepExecution, "review", "model unavailable")
            .at_step("summarize", "llm", 1)
            .with_total_steps(3)
            .with_elapsed(Duration::from_millis(1500));

        let text = err.to_string();
        assert!(text.contains("StepExecutionError"));
        assert!(text.contains("'review'"));
        assert!(text.contains("'summarize' (llm, 2/3)"));
        assert!(text.contains("model unavailable"));
    }

    #[test]
    fn test_display_without_step() {
        let err = ExecutionError::new(ErrorKind::CheckpointCorruption, "wf", "bad json");
        let text = err.to_string();
        assert!(text.starts_with("CheckpointCorruptionError in workflow 'wf' after"));
        assert!(!text.contains("at step"));
    }

    #[test]
    fn test_handler_error_kinds() {
        assert_eq!(
            HandlerError::Config("missing prompt".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            HandlerError::DanglingReference {
                step: "b".into(),
                reference: "a".into()
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            HandlerError::Session(SessionError::Bounds {
                id: "s".into(),
                max_turns: 2
            })
            .kind(),
            ErrorKind::SessionBounds
        );
        assert_eq!(
            HandlerError::Failed("boom".into()).kind(),
            ErrorKind::StepExecution
        );
    }

    #[test]
    fn test_nested_error_keeps_inner_kind() {
        let bounds = HandlerError::Session(SessionError::Bounds {
            id: "s".into(),
            max_turns: 2,
        });
        let err = HandlerError::nested(
            "iteration 2 of loop 'chat' failed",
            HandlerError::nested("task 'a' failed", bounds),
        );
        assert_eq!(err.kind(), ErrorKind::SessionBounds);
        assert!(err.to_string().starts_with("iteration 2 of loop 'chat' failed: task 'a' failed: "));

        let config = HandlerError::nested("retry", HandlerError::Config("bad".into()));
        assert_eq!(config.kind(), ErrorKind::Configuration);
    }
}
