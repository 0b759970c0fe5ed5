//! Workflow Execution Module
//!
//! Provides the engine that runs workflow steps in order, the dispatcher
//! that routes each step to its handler, and the fan-out primitive used by
//! parallel steps.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating workflow runs
//! - [`dispatcher`]: Step type registry and the [`StepHandler`] trait
//! - [`handlers`]: Built-in step handlers
//! - [`context`]: Per-run state and the read-only view handlers receive
//! - [`parallel`]: Bounded fan-out with a join barrier
//! - [`client`]: Model provider abstraction

pub mod client;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod handlers;
pub mod parallel;

pub use client::{ClientError, EchoClient, Message, ModelClient, ModelRequest, ModelResponse, Role};
pub use context::{ExecutionContext, Services, StepContext};
pub use dispatcher::{tags, StepDispatcher, StepHandler, StepOutput};
pub use engine::{Engine, RunReport};
pub use parallel::{run_fan_out, FailurePolicy, FanOutOptions, FanOutReport, TaskOutcome};
