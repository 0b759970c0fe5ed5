//! Step Dispatch
//!
//! Maps a step's type tag to the handler that runs it. Handlers are
//! registered by tag; the built-in set is installed by
//! [`StepDispatcher::with_builtin_handlers`], and callers may add or replace
//! handlers for their own tags.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::client::ModelClient;
use super::context::StepContext;
use super::handlers;
use crate::error::HandlerError;
use crate::store::codec::Variable;
use crate::workflow::Step;

/// Built-in step type tags.
pub mod tags {
    pub const LLM: &str = "llm";
    pub const PARALLEL: &str = "parallel";
    pub const SCHEMA: &str = "schema";
    pub const SMART: &str = "smart";
    pub const SESSION: &str = "session";
    pub const EXTRACT: &str = "extract";
    pub const BATCH: &str = "batch";
    pub const ROBUST: &str = "robust";
    pub const LOOP: &str = "loop";
    pub const TRANSFORM: &str = "transform";
    pub const FILE: &str = "file";
    pub const SET: &str = "set";
}

/// What a handler hands back to the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutput {
    /// Raw output; normalized by the result store.
    pub value: Value,
    /// Variables to merge into the run's variable state.
    pub variables: Vec<(String, Variable)>,
    /// Session ids the step used.
    pub sessions: Vec<String>,
}

impl StepOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, variable: Variable) -> Self {
        self.variables.push((name.into(), variable));
        self
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.sessions.push(id.into());
        self
    }
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// A handler for one step type.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The type tag this handler is registered under by default.
    fn step_type(&self) -> &str;

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError>;
}

/// Registry of step handlers keyed by type tag.
#[derive(Default)]
pub struct StepDispatcher {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dispatcher with every built-in handler, using `client` for
    /// model calls.
    pub fn with_builtin_handlers(client: Arc<dyn ModelClient>) -> Self {
        let mut dispatcher = Self::new();
        handlers::register_builtins(&mut dispatcher, client);
        dispatcher
    }

    /// Registers a handler under its own type tag, replacing any previous one.
    pub fn register<H: StepHandler + 'static>(&mut self, handler: H) {
        let tag = handler.step_type().to_string();
        self.register_as(tag, Arc::new(handler));
    }

    /// Registers a handler under an explicit tag.
    pub fn register_as(&mut self, tag: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let tag = tag.into();
        debug!("Registered handler for step type '{}'", tag);
        self.handlers.insert(tag, handler);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(tag).cloned()
    }

    pub fn has(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn known_types(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Runs `step` with the handler registered for its type.
    pub async fn dispatch(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let handler = self.get(&step.step_type).ok_or_else(|| {
            HandlerError::Config(format!(
                "unknown step type '{}' for step '{}'",
                step.step_type, step.name
            ))
        })?;
        handler.execute(step, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::client::EchoClient;
    use crate::execution::context::Services;
    use crate::store::ResultStore;
    use crate::workflow::{RunOptions, RunSettings, WorkflowDefinition};
    use serde_json::{json, Map};
    use std::collections::BTreeMap;

    struct Constant;

    #[async_trait]
    impl StepHandler for Constant {
        fn step_type(&self) -> &str {
            "constant"
        }

        async fn execute(&self, step: &Step, _ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
            Ok(StepOutput::new(json!({"from": step.name})))
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let mut dispatcher = StepDispatcher::new();
        dispatcher.register(Constant);
        assert!(dispatcher.has("constant"));

        let workflow = WorkflowDefinition::new("wf");
        let settings = RunSettings::resolve_with(&RunOptions::new(), &workflow, |_| None).unwrap();
        let results = ResultStore::new();
        let variables = BTreeMap::new();
        let services = Services::default();
        let ctx = StepContext {
            workflow: &workflow,
            results: &results,
            variables: &variables,
            locals: Map::new(),
            settings: &settings,
            services: &services,
            dispatcher: &dispatcher,
        };

        let output = dispatcher.dispatch(&Step::new("a", "constant"), &ctx).await.unwrap();
        assert_eq!(output.value, json!({"from": "a"}));

        let err = dispatcher.dispatch(&Step::new("b", "teleport"), &ctx).await.unwrap_err();
        assert!(matches!(err, HandlerError::Config(_)));
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn test_builtin_tags() {
        let dispatcher = StepDispatcher::with_builtin_handlers(Arc::new(EchoClient::new()));
        let expected = [
            tags::BATCH,
            tags::EXTRACT,
            tags::FILE,
            tags::LLM,
            tags::LOOP,
            tags::PARALLEL,
            tags::ROBUST,
            tags::SCHEMA,
            tags::SESSION,
            tags::SET,
            tags::SMART,
            tags::TRANSFORM,
        ];
        assert_eq!(dispatcher.known_types(), expected.to_vec());
    }
}
