//! Workflow Execution Engine
//!
//! The core engine that drives a workflow run:
//! - Steps run one at a time in declared order
//! - Conditions decide skip or execute; skipped steps still get a result
//! - Handler output is normalized (and optionally schema-checked) before storage
//! - A checkpoint is written after every completed or skipped step
//! - Resume restarts at the first step the latest checkpoint has not covered
//!
//! Every failure leaves the engine as one [`ExecutionError`]; handler panics
//! are caught and reported the same way.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Map;
use tokio::sync::Mutex;

use super::context::{ExecutionContext, Services, StepContext};
use super::dispatcher::StepDispatcher;
use super::parallel::panic_message;
use crate::error::{ErrorKind, ExecutionError, HandlerError};
use crate::monitoring::{EventType, ExecutionLog};
use crate::store::codec::Variables;
use crate::store::result::normalize;
use crate::store::results::result_document;
use crate::store::{CheckpointStore, FileCache, ResultStore, ResultSummary, SessionStore, StepResult};
use crate::store::DEFAULT_MAX_TEXT_BYTES;
use crate::workflow::condition::explain;
use crate::workflow::{validate_workflow, RunOptions, RunSettings, Step, WorkflowDefinition};

/// Why a single step stopped the run.
#[derive(Debug)]
struct StepFailure {
    kind: ErrorKind,
    message: String,
}

impl StepFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<HandlerError> for StepFailure {
    fn from(e: HandlerError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub workflow: String,
    pub results: ResultStore,
    pub log: ExecutionLog,
    pub variables: Variables,
    /// Ids of sessions touched by the run, including before a resume.
    pub sessions: Vec<String>,
    pub elapsed: Duration,
    /// Step index the run resumed from, if it did.
    pub resumed_from: Option<usize>,
}

impl RunReport {
    pub fn summary(&self) -> ResultSummary {
        self.results.summary()
    }
}

/// Workflow execution engine.
///
/// Holds the step dispatcher and the stores shared across runs (sessions,
/// file cache). Per-run state lives in an [`ExecutionContext`] created by
/// [`execute`](Engine::execute), so one engine may run several workflows
/// concurrently.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrunner::execution::{EchoClient, Engine, StepDispatcher};
/// use flowrunner::workflow::{load_workflow, RunOptions};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let workflow = load_workflow("research.yaml")?;
/// let engine = Engine::new(StepDispatcher::with_builtin_handlers(Arc::new(EchoClient::new())));
///
/// let report = engine.execute(&workflow, &RunOptions::new().with_resume(true)).await?;
/// println!("{} steps stored", report.results.len());
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    dispatcher: Arc<StepDispatcher>,
    services: Services,
    max_text_bytes: usize,
}

impl Engine {
    /// Creates an engine with an in-memory session store and a fresh file cache.
    pub fn new(dispatcher: StepDispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            services: Services::default(),
            max_text_bytes: DEFAULT_MAX_TEXT_BYTES,
        }
    }

    pub fn with_session_store(mut self, sessions: SessionStore) -> Self {
        self.services.sessions = Arc::new(Mutex::new(sessions));
        self
    }

    pub fn with_file_cache(mut self, cache: Arc<FileCache>) -> Self {
        self.services.cache = cache;
        self
    }

    /// Sets the per-string byte limit applied to stored results.
    pub fn with_text_limit(mut self, max_text_bytes: usize) -> Self {
        self.max_text_bytes = max_text_bytes;
        self
    }

    pub fn dispatcher(&self) -> &StepDispatcher {
        &self.dispatcher
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Checks `workflow` against the registered step types.
    pub fn validate(&self, workflow: &WorkflowDefinition) -> Result<(), ExecutionError> {
        let known = self.dispatcher.known_types();
        validate_workflow(workflow, Some(known.as_slice())).map_err(|e| {
            ExecutionError::new(ErrorKind::Configuration, &workflow.name, e.to_string())
                .with_total_steps(workflow.len())
        })
    }

    /// Executes the workflow.
    ///
    /// 1. Resolves run settings and validates the workflow
    /// 2. Restores the latest checkpoint when `options.resume` is set
    /// 3. Runs every remaining step in order
    /// 4. Checkpoints after each completed or skipped step
    ///
    /// The file cache is cleared when the run ends, whatever the outcome.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - Every step completed or was skipped
    /// * `Err(ExecutionError)` - The run stopped; earlier results are kept
    ///   in the latest checkpoint
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        options: &RunOptions,
    ) -> Result<RunReport, ExecutionError> {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.run(workflow, options, started))
            .catch_unwind()
            .await;
        self.services.cache.clear();

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = format!("internal fault: {}", panic_message(panic));
                error!("Workflow '{}' aborted: {}", workflow.name, message);
                Err(ExecutionError::new(ErrorKind::StepExecution, &workflow.name, message)
                    .with_total_steps(workflow.len())
                    .with_elapsed(started.elapsed()))
            }
        }
    }

    async fn run(
        &self,
        workflow: &WorkflowDefinition,
        options: &RunOptions,
        started: Instant,
    ) -> Result<RunReport, ExecutionError> {
        let total = workflow.len();
        let fail = |kind: ErrorKind, message: String| {
            ExecutionError::new(kind, &workflow.name, message)
                .with_total_steps(total)
                .with_elapsed(started.elapsed())
        };

        let settings = RunSettings::resolve(options, workflow)
            .map_err(|e| fail(ErrorKind::Configuration, e.to_string()))?;
        self.validate(workflow)
            .map_err(|e| fail(ErrorKind::Configuration, e.message))?;
        settings
            .create_directories()
            .map_err(|e| fail(ErrorKind::Configuration, e.to_string()))?;

        let checkpoints = CheckpointStore::new(&settings.checkpoint_dir);
        let mut ctx = ExecutionContext::new(workflow, settings, self.max_text_bytes);

        if options.resume {
            match checkpoints.load_latest(&workflow.name) {
                Ok(Some(checkpoint)) if checkpoint.step_index > total => {
                    return Err(fail(
                        ErrorKind::CheckpointCorruption,
                        format!(
                            "checkpoint is at step {} but the workflow has only {} steps",
                            checkpoint.step_index, total
                        ),
                    ));
                }
                Ok(Some(checkpoint)) => {
                    ctx.hydrate(checkpoint)
                        .map_err(|e| fail(ErrorKind::CheckpointCorruption, e.to_string()))?;
                    let resumed_at = workflow
                        .steps
                        .get(ctx.current_step)
                        .map(|s| s.name.as_str())
                        .unwrap_or("end");
                    info!(
                        "Resuming '{}' at step {}/{} ({})",
                        workflow.name,
                        ctx.current_step + 1,
                        total,
                        resumed_at
                    );
                    let index = ctx.current_step;
                    ctx.log.record(resumed_at, None, Some(index), EventType::Resumed, None);
                }
                Ok(None) => info!("No checkpoint for '{}' - starting fresh", workflow.name),
                Err(e) => {
                    error!("Cannot resume '{}': {}", workflow.name, e);
                    return Err(fail(ErrorKind::CheckpointCorruption, e.to_string()));
                }
            }
        }

        info!(
            "Starting workflow '{}' ({} steps, checkpoints: {})",
            workflow.name,
            total,
            if ctx.settings.checkpoint_enabled { "on" } else { "off" }
        );

        for (index, step) in workflow.steps.iter().enumerate().skip(ctx.current_step) {
            if let Err(failure) = self.run_step(workflow, &mut ctx, &checkpoints, index, step).await {
                error!("Step '{}' failed: {}", step.name, failure.message);
                return Err(fail(failure.kind, failure.message).at_step(&step.name, &step.step_type, index));
            }
        }

        let elapsed = started.elapsed();
        let summary = ctx.results.summary();
        info!(
            "Workflow '{}' completed in {:.2?} ({} succeeded, {} skipped)",
            workflow.name, elapsed, summary.succeeded, summary.skipped
        );

        Ok(RunReport {
            workflow: workflow.name.clone(),
            results: ctx.results,
            log: ctx.log,
            variables: ctx.variables,
            sessions: ctx.sessions.into_iter().collect(),
            elapsed,
            resumed_from: ctx.resumed_from,
        })
    }

    fn step_context<'a>(&'a self, workflow: &'a WorkflowDefinition, ctx: &'a ExecutionContext) -> StepContext<'a> {
        StepContext {
            workflow,
            results: &ctx.results,
            variables: &ctx.variables,
            locals: Map::new(),
            settings: &ctx.settings,
            services: &self.services,
            dispatcher: &self.dispatcher,
        }
    }

    /// Runs one step to completion: condition, dispatch, storage, output
    /// file and checkpoint.
    async fn run_step(
        &self,
        workflow: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
        checkpoints: &CheckpointStore,
        index: usize,
        step: &Step,
    ) -> Result<(), StepFailure> {
        let step_type = step.step_type.as_str();

        if let Some(expression) = &step.condition {
            let outcome = explain(expression, &self.step_context(workflow, ctx))
                .map_err(|e| StepFailure::new(ErrorKind::Configuration, e.to_string()))?;
            if !outcome.result {
                let reason = outcome.skip_reason(expression);
                info!("Skipping step '{}': {}", step.name, reason);
                ctx.results.insert(&step.name, StepResult::skipped(reason.clone()));
                ctx.log
                    .record(&step.name, Some(step_type), Some(index), EventType::Skipped, Some(reason));
                ctx.current_step = index + 1;
                return self.checkpoint(ctx, checkpoints, &step.name, index);
            }
        }

        info!(
            "Starting step {}/{}: {} ({})",
            index + 1,
            workflow.len(),
            step.name,
            step_type
        );
        ctx.log
            .record(&step.name, Some(step_type), Some(index), EventType::Started, None);
        let step_started = Instant::now();

        let dispatched = {
            let step_ctx = self.step_context(workflow, ctx);
            AssertUnwindSafe(self.dispatcher.dispatch(step, &step_ctx))
                .catch_unwind()
                .await
        };
        let output = match dispatched {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let failure = StepFailure::from(e);
                ctx.log.record(
                    &step.name,
                    Some(step_type),
                    Some(index),
                    EventType::Failed,
                    Some(failure.message.clone()),
                );
                return Err(failure);
            }
            Err(panic) => {
                let message = format!("internal fault in handler: {}", panic_message(panic));
                ctx.log.record(
                    &step.name,
                    Some(step_type),
                    Some(index),
                    EventType::Failed,
                    Some(message.clone()),
                );
                return Err(StepFailure::new(ErrorKind::StepExecution, message));
            }
        };

        for (name, variable) in output.variables {
            ctx.variables.insert(name, variable);
        }
        ctx.sessions.extend(output.sessions);

        // A handler may report failure in-band; store it so the run record
        // shows why, then stop.
        if let StepResult::Failure { reason } = normalize(output.value.clone()) {
            ctx.results.insert(&step.name, StepResult::failure(reason.clone()));
            ctx.log.record(
                &step.name,
                Some(step_type),
                Some(index),
                EventType::Failed,
                Some(reason.clone()),
            );
            return Err(StepFailure::new(ErrorKind::StepExecution, reason));
        }

        let stored = match &step.output_schema {
            Some(schema) => match ctx.results.store_with_schema(&step.name, output.value, schema) {
                Ok(stored) => stored.clone(),
                Err(e) => {
                    ctx.log.record(
                        &step.name,
                        Some(step_type),
                        Some(index),
                        EventType::Failed,
                        Some(e.to_string()),
                    );
                    return Err(StepFailure::new(ErrorKind::SchemaValidation, e.to_string()));
                }
            },
            None => ctx.results.store(&step.name, output.value).clone(),
        };

        if let Some(file) = &step.output_file {
            let path = write_output_file(&ctx.settings, &step.name, file, &stored)
                .await
                .map_err(|e| {
                    StepFailure::new(
                        ErrorKind::StepExecution,
                        format!("cannot write output file '{}': {}", file, e),
                    )
                })?;
            debug!("Wrote '{}' output to {}", step.name, path.display());
        }

        let took = step_started.elapsed();
        info!("Step '{}' completed in {:.2?}", step.name, took);
        ctx.log.record(
            &step.name,
            Some(step_type),
            Some(index),
            EventType::Completed,
            Some(format!("{:.2?}", took)),
        );
        ctx.current_step = index + 1;
        self.checkpoint(ctx, checkpoints, &step.name, index)
    }

    fn checkpoint(
        &self,
        ctx: &mut ExecutionContext,
        checkpoints: &CheckpointStore,
        step: &str,
        index: usize,
    ) -> Result<(), StepFailure> {
        if !ctx.settings.checkpoint_enabled {
            return Ok(());
        }
        match checkpoints.save(&ctx.snapshot()) {
            Ok(path) => {
                ctx.log.record(
                    step,
                    None,
                    Some(index),
                    EventType::CheckpointSaved,
                    Some(path.display().to_string()),
                );
                Ok(())
            }
            Err(e) => {
                warn!("Checkpoint after step '{}' failed: {}", step, e);
                Err(StepFailure::new(
                    ErrorKind::StepExecution,
                    format!("cannot save checkpoint: {}", e),
                ))
            }
        }
    }
}

/// Writes a stored result under the output directory: pretty JSON for
/// `.json` targets, plain text otherwise.
async fn write_output_file(
    settings: &RunSettings,
    name: &str,
    file: &str,
    result: &StepResult,
) -> std::io::Result<PathBuf> {
    let path = settings.output_dir.join(file);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let content = if is_json {
        serde_json::to_string_pretty(&result_document(name, result))?
    } else {
        result.text()
    };
    tokio::fs::write(&path, content).await?;
    Ok(path)
}
