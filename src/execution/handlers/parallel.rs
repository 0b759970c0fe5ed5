//! `parallel` steps: nested sub-steps fanned out behind one join barrier.
//!
//! ```yaml
//! - name: research
//!   type: parallel
//!   policy: best_effort
//!   timeout_secs: 60
//!   tasks:
//!     - id: pros
//!       type: llm
//!       prompt: "List the pros of {{ vars.topic }}"
//!     - id: cons
//!       type: llm
//!       prompt: "List the cons of {{ vars.topic }}"
//! ```

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::{config_secs, config_u32};
use crate::error::{ErrorKind, HandlerError};
use crate::execution::context::StepContext;
use crate::execution::dispatcher::{tags, StepHandler, StepOutput};
use crate::execution::parallel::{run_fan_out, FailurePolicy, FanOutOptions};
use crate::store::codec::Variable;
use crate::store::{normalize, StepResult};
use crate::workflow::Step;

pub struct ParallelHandler;

/// Side outputs gathered from sub-tasks while they run.
#[derive(Default)]
struct Collected {
    cost: f64,
    variables: Vec<(String, Variable)>,
    sessions: Vec<String>,
    /// Handler errors by task id, kept so their kind survives the fan-out.
    errors: Vec<(String, HandlerError)>,
}

fn fan_out_options(step: &Step) -> Result<FanOutOptions, HandlerError> {
    let mut options = FanOutOptions::default();
    if let Some(policy) = step.config_value("policy") {
        let policy: FailurePolicy = serde_json::from_value(policy.clone()).map_err(|_| {
            HandlerError::Config(format!(
                "step '{}' has unknown policy {} (expected all_or_nothing or best_effort)",
                step.name, policy
            ))
        })?;
        options = options.with_policy(policy);
    }
    if let Some(timeout) = config_secs(step, "timeout_secs")? {
        options = options.with_timeout(timeout);
    }
    if let Some(max) = config_u32(step, "max_concurrency")? {
        options = options.with_max_concurrency(max.max(1) as usize);
    }
    Ok(options)
}

/// Declared sub-tasks as steps named by their `id`.
fn sub_tasks(step: &Step) -> Result<Vec<Step>, HandlerError> {
    let Some(Value::Array(items)) = step.config_value("tasks") else {
        return Err(HandlerError::Config(format!(
            "step '{}' needs a 'tasks' list",
            step.name
        )));
    };

    let mut tasks: Vec<Step> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Value::Object(raw) = item else {
            return Err(HandlerError::Config(format!(
                "task {} of step '{}' is not a mapping",
                index, step.name
            )));
        };
        let mut raw = raw.clone();
        let id = match raw.remove("id") {
            Some(Value::String(id)) => id,
            _ => format!("task_{}", index),
        };
        if tasks.iter().any(|t| t.name == id) {
            return Err(HandlerError::Config(format!(
                "step '{}' declares task id '{}' twice",
                step.name, id
            )));
        }
        raw.insert("name".to_string(), Value::String(id.clone()));
        let task: Step = serde_json::from_value(Value::Object(raw))
            .map_err(|e| HandlerError::Config(format!("task '{}' of step '{}': {}", id, step.name, e)))?;
        tasks.push(task);
    }
    Ok(tasks)
}

async fn run_task(
    task: &Step,
    index: usize,
    ctx: &StepContext<'_>,
    collected: &Mutex<Collected>,
) -> Result<Value, String> {
    let mut locals = Map::new();
    locals.insert("task".to_string(), json!({"id": task.name, "index": index}));
    let child = ctx.child(locals);

    let output = match ctx.dispatcher.dispatch(task, &child).await {
        Ok(output) => output,
        Err(e) => {
            let message = e.to_string();
            collected.lock().errors.push((task.name.clone(), e));
            return Err(message);
        }
    };

    let result = normalize(output.value);
    {
        let mut collected = collected.lock();
        collected.cost += result.cost();
        collected.variables.extend(output.variables);
        collected.sessions.extend(output.sessions);
    }

    match result {
        StepResult::Failure { reason } => Err(reason),
        success => Ok(success.payload().cloned().unwrap_or(Value::Null)),
    }
}

#[async_trait]
impl StepHandler for ParallelHandler {
    fn step_type(&self) -> &str {
        tags::PARALLEL
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let options = fan_out_options(step)?;
        let tasks = sub_tasks(step)?;
        let collected = Mutex::new(Collected::default());

        let futures = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| (task.name.clone(), run_task(task, index, ctx, &collected)))
            .collect();
        let report = run_fan_out(futures, &options).await;

        info!(
            "  Fan-out '{}': {}/{} sub-tasks completed",
            step.name,
            report.completed(),
            report.outcomes.len()
        );

        let mut collected = collected.into_inner();
        if !report.is_success() {
            // Under all-or-nothing, a sub-task error of another category
            // (session bounds, schema, configuration) fails the step with
            // that kind instead of an in-band failure.
            let raised = report.failed_ids().into_iter().find_map(|id| {
                collected
                    .errors
                    .iter()
                    .position(|(task, e)| task == id && e.kind() != ErrorKind::StepExecution)
            });
            if let Some(position) = raised {
                let (id, source) = collected.errors.swap_remove(position);
                return Err(HandlerError::nested(
                    format!("task '{}' of step '{}' failed", id, step.name),
                    source,
                ));
            }
        }
        let mut value = report.to_value();
        if report.is_success() {
            value["cost"] = json!(collected.cost);
        }
        let mut output = StepOutput::new(value);
        output.variables = collected.variables;
        output.sessions = collected.sessions;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::*;
    use crate::store::Variable;

    fn fan_step(policy: &str) -> Step {
        Step::new("fan", "parallel").with_config("policy", policy).with_config(
            "tasks",
            json!([
                {"id": "upper", "type": "transform", "input": "abc", "operation": "uppercase"},
                {"id": "broken", "type": "transform", "input": "{not json", "operation": "json_parse"},
                {"id": "echo", "type": "llm", "prompt": "task {{ task.id }}"}
            ]),
        )
    }

    #[tokio::test]
    async fn test_best_effort_merges_by_id() {
        let fixture = Fixture::new();
        let output = ParallelHandler
            .execute(&fan_step("best_effort"), &fixture.ctx())
            .await
            .unwrap();

        let data = &output.value["data"];
        assert_eq!(output.value["success"], json!(true));
        assert_eq!(data["results"]["upper"], json!("ABC"));
        assert_eq!(data["results"]["echo"]["content"], json!("task echo"));
        assert_eq!(data["failed"], json!(["broken"]));
    }

    #[tokio::test]
    async fn test_all_or_nothing_reports_failure() {
        let fixture = Fixture::new();
        let output = ParallelHandler
            .execute(&fan_step("all_or_nothing"), &fixture.ctx())
            .await
            .unwrap();

        assert_eq!(output.value["success"], json!(false));
        assert!(output.value["error"].as_str().unwrap().contains("broken"));
        assert!(!normalize(output.value).is_success());
    }

    #[tokio::test]
    async fn test_sub_task_variables_are_collected() {
        let fixture = Fixture::new();
        let step = Step::new("fan", "parallel").with_config(
            "tasks",
            json!([{"id": "assign", "type": "set", "vars": {"answer": 42}}]),
        );
        let output = ParallelHandler.execute(&step, &fixture.ctx()).await.unwrap();
        assert_eq!(
            output.variables,
            vec![("answer".to_string(), Variable::Value(json!(42)))]
        );
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let step = Step::new("fan", "parallel")
            .with_config("policy", "sometimes")
            .with_config("tasks", json!([]));
        assert!(matches!(fan_out_options(&step), Err(HandlerError::Config(_))));
    }

    #[tokio::test]
    async fn test_all_or_nothing_keeps_sub_task_error_kind() {
        let fixture = Fixture::new();
        let step = Step::new("fan", "parallel")
            .with_config("policy", "all_or_nothing")
            .with_config(
                "tasks",
                json!([
                    {"id": "ok", "type": "transform", "input": "a", "operation": "trim"},
                    {"id": "misconfigured", "type": "transform", "input": "a", "operation": "reverse"}
                ]),
            );
        let err = ParallelHandler.execute(&step, &fixture.ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("task 'misconfigured'"));

        let best_effort = step.clone().with_config("policy", "best_effort");
        let output = ParallelHandler.execute(&best_effort, &fixture.ctx()).await.unwrap();
        assert_eq!(output.value["data"]["failed"], json!(["misconfigured"]));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let step = Step::new("fan", "parallel")
            .with_config("timeout_secs", -1)
            .with_config("tasks", json!([]));
        assert!(matches!(fan_out_options(&step), Err(HandlerError::Config(_))));
    }
}
