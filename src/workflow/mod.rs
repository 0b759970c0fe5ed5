//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating workflows, plus the expression and template languages steps
//! are written in.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, WorkflowDefinition)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Structural validation and reference checking
//! - [`condition`]: Boolean conditions over step results
//! - [`template`]: Prompt and value templating
//! - [`config`]: Run settings and their precedence

pub mod condition;
pub mod config;
pub mod model;
pub mod parser;
pub mod template;
pub mod validator;

pub use condition::{evaluate, explain, Condition, ConditionError, ConditionOutcome, Lookup, Resolver};
pub use config::{ConfigError, RunOptions, RunSettings};
pub use model::{Step, StepDefaults, WorkflowDefinition};
pub use parser::{load_workflow, parse_workflow, save_workflow, WorkflowFormat};
pub use template::TemplateRenderer;
pub use validator::{validate_workflow, ValidationError, ValidationErrors};
