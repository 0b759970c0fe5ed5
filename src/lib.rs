//! FlowRunner - Resumable Workflow Engine for AI Pipelines
//!
//! Runs declarative multi-step workflows (model calls, data transforms,
//! loops, fan-outs, file operations) one step at a time, storing every
//! step's normalized result and checkpointing progress so an interrupted
//! run resumes where it stopped.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`workflow`]: Workflow definitions, parsing, validation, conditions and templates
//! - [`execution`]: Execution engine, step dispatcher and built-in handlers
//! - [`store`]: Result, checkpoint and session stores
//! - [`monitoring`]: Per-run execution log
//! - [`error`]: Handler and run-level error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrunner::execution::{EchoClient, StepDispatcher};
//! use flowrunner::workflow::RunOptions;
//! use flowrunner::{load_workflow, Engine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("research.yaml")?;
//!
//!     // Create execution engine with the built-in step types
//!     let dispatcher = StepDispatcher::with_builtin_handlers(Arc::new(EchoClient::new()));
//!     let engine = Engine::new(dispatcher);
//!
//!     // Execute, resuming from the latest checkpoint if there is one
//!     let report = engine.execute(&workflow, &RunOptions::new().with_resume(true)).await?;
//!     println!("{:?}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use error::{ErrorKind, ExecutionError, HandlerError};
pub use execution::engine::{Engine, RunReport};
pub use workflow::model::{Step, WorkflowDefinition};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FlowRunner");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("draft", "llm").with_config("prompt", "Hello");
        assert_eq!(step.name, "draft");
        assert_eq!(step.step_type, "llm");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::new("empty");
        assert!(workflow.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
