//! Execution Context
//!
//! [`ExecutionContext`] is the mutable record of one run, owned by the
//! engine for the duration of [`Engine::execute`](super::Engine::execute).
//! Handlers never see it directly; they get a read-only [`StepContext`]
//! borrowing from it, plus the shared [`Services`].

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::dispatcher::StepDispatcher;
use crate::error::HandlerError;
use crate::monitoring::ExecutionLog;
use crate::store::codec::{self, CodecError, Variable, Variables};
use crate::store::{Checkpoint, FileCache, ResultStore, SessionStore};
use crate::workflow::condition::{lookup_path, Lookup, Resolver};
use crate::workflow::{RunSettings, TemplateRenderer, WorkflowDefinition};

/// Stores shared by every run of an engine.
#[derive(Clone)]
pub struct Services {
    pub sessions: Arc<Mutex<SessionStore>>,
    pub cache: Arc<FileCache>,
    pub templates: Arc<TemplateRenderer>,
}

impl Services {
    pub fn new(sessions: SessionStore, cache: Arc<FileCache>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(sessions)),
            cache,
            templates: Arc::new(TemplateRenderer::new()),
        }
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new(SessionStore::in_memory(), Arc::new(FileCache::new()))
    }
}

/// Mutable state of a single run.
#[derive(Debug)]
pub struct ExecutionContext {
    pub workflow_name: String,
    /// Index of the next step to run.
    pub current_step: usize,
    pub results: ResultStore,
    pub log: ExecutionLog,
    pub variables: Variables,
    pub settings: RunSettings,
    /// Ids of sessions touched by this run.
    pub sessions: BTreeSet<String>,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    /// Step index restored from a checkpoint, if this run resumed.
    pub resumed_from: Option<usize>,
}

impl ExecutionContext {
    pub fn new(workflow: &WorkflowDefinition, settings: RunSettings, max_text_bytes: usize) -> Self {
        let variables = workflow
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), Variable::Value(v.clone())))
            .collect();
        Self {
            workflow_name: workflow.name.clone(),
            current_step: 0,
            results: ResultStore::with_text_limit(max_text_bytes),
            log: ExecutionLog::new(),
            variables,
            settings,
            sessions: BTreeSet::new(),
            started_at: Instant::now(),
            started_wall: Utc::now(),
            resumed_from: None,
        }
    }

    /// Restores progress from a checkpoint.
    ///
    /// Checkpointed variables override the workflow's initial values.
    pub fn hydrate(&mut self, checkpoint: Checkpoint) -> Result<(), CodecError> {
        let restored = codec::decode_variables(&checkpoint.variable_state)?;
        self.variables.extend(restored);
        self.current_step = checkpoint.step_index;
        self.results = checkpoint.results;
        self.log = checkpoint.execution_log;
        self.sessions.extend(checkpoint.sessions);
        self.resumed_from = Some(checkpoint.step_index);
        Ok(())
    }

    /// Checkpoint of the current state.
    pub fn snapshot(&self) -> Checkpoint {
        Checkpoint::new(self.workflow_name.clone(), self.current_step, self.results.clone())
            .with_log(self.log.clone())
            .with_variable_state(codec::encode_variables(&self.variables))
            .with_sessions(self.sessions.iter().cloned().collect())
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Read-only view handed to step handlers.
#[derive(Clone)]
pub struct StepContext<'a> {
    pub workflow: &'a WorkflowDefinition,
    pub results: &'a ResultStore,
    pub variables: &'a Variables,
    /// Loop and fan-out scoped names (`item`, `loop`, `index`, `last`).
    pub locals: Map<String, Value>,
    pub settings: &'a RunSettings,
    pub services: &'a Services,
    pub dispatcher: &'a StepDispatcher,
}

impl<'a> StepContext<'a> {
    /// A child context with extra scoped names layered over this one.
    pub fn child(&self, locals: Map<String, Value>) -> StepContext<'a> {
        let mut merged = self.locals.clone();
        merged.extend(locals);
        StepContext {
            locals: merged,
            ..self.clone()
        }
    }

    /// Template context: step payloads by name, `steps`, `vars`, then locals.
    pub fn template_context(&self) -> Value {
        let mut context = self.results.template_context();
        context.insert("vars".to_string(), codec::template_view(self.variables));
        for (key, value) in &self.locals {
            context.insert(key.clone(), value.clone());
        }
        Value::Object(context)
    }

    pub fn render(&self, template: &str) -> Result<String, HandlerError> {
        if !TemplateRenderer::is_template(template) {
            return Ok(template.to_string());
        }
        Ok(self.services.templates.render(template, &self.template_context())?)
    }

    pub fn render_value(&self, value: &Value) -> Result<Value, HandlerError> {
        Ok(self.services.templates.render_value(value, &self.template_context())?)
    }

    /// Resolves a dotted reference such as `fetch.content` or `vars.topic`.
    pub fn lookup(&self, reference: &str) -> Option<Value> {
        let path: Vec<String> = reference
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        match self.resolve(&path) {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }

    /// Resolves a path relative to the workspace directory.
    pub fn workspace_path(&self, path: &str) -> PathBuf {
        let candidate = PathBuf::from(path);
        if candidate.is_absolute() {
            candidate
        } else {
            self.settings.workspace_dir.join(candidate)
        }
    }
}

impl Resolver for StepContext<'_> {
    fn resolve(&self, path: &[String]) -> Lookup {
        let Some((root, rest)) = path.split_first() else {
            return Lookup::MissingRoot;
        };
        if let Some(local) = self.locals.get(root) {
            return match lookup_path(local, rest) {
                Some(found) => Lookup::Found(found.clone()),
                None => Lookup::MissingField,
            };
        }
        if root == "vars" {
            let Some((name, field)) = rest.split_first() else {
                return Lookup::Found(codec::template_view(self.variables));
            };
            return match self.variables.get(name) {
                None => Lookup::MissingRoot,
                Some(variable) => match lookup_path(&variable.to_template_value(), field) {
                    Some(found) => Lookup::Found(found.clone()),
                    None => Lookup::MissingField,
                },
            };
        }
        self.results.resolve(path)
    }
}
