//! `batch` steps: several prompts sent one after another, merged by task id.

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde_json::{json, Map, Value};

use super::{build_request, call_model, resolve_prompt};
use crate::error::HandlerError;
use crate::execution::client::{ModelClient, ModelResponse};
use crate::execution::context::StepContext;
use crate::execution::dispatcher::{tags, StepHandler, StepOutput};
use crate::workflow::Step;

pub struct BatchHandler {
    client: Arc<dyn ModelClient>,
}

impl BatchHandler {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }

    async fn ask(&self, task: &Step, ctx: &StepContext<'_>) -> Result<ModelResponse, HandlerError> {
        let prompt = resolve_prompt(task, ctx)?;
        let request = build_request(task, ctx, prompt)?;
        call_model(self.client.as_ref(), &request).await
    }
}

/// Each task is a map with an `id` plus the same keys an `llm` step takes.
fn batch_tasks(step: &Step) -> Result<Vec<Step>, HandlerError> {
    let Some(Value::Array(items)) = step.config_value("tasks") else {
        return Err(HandlerError::Config(format!(
            "step '{}' needs a 'tasks' list",
            step.name
        )));
    };

    let mut tasks = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Value::Object(config) = item else {
            return Err(HandlerError::Config(format!(
                "task {} of step '{}' is not a mapping",
                index, step.name
            )));
        };
        let id = config
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("task_{}", index));
        if tasks.iter().any(|t: &Step| t.name == id) {
            return Err(HandlerError::Config(format!(
                "step '{}' declares task id '{}' twice",
                step.name, id
            )));
        }
        let mut task = Step::new(id, tags::LLM);
        task.config = config.clone();
        tasks.push(task);
    }
    Ok(tasks)
}

#[async_trait]
impl StepHandler for BatchHandler {
    fn step_type(&self) -> &str {
        tags::BATCH
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let tasks = batch_tasks(step)?;
        let fail_fast = step.config_value("fail_fast").and_then(Value::as_bool).unwrap_or(false);

        let mut results = Map::new();
        let mut errors = Map::new();
        let mut cost = 0.0;

        for task in &tasks {
            match self.ask(task, ctx).await {
                Ok(response) => {
                    cost += response.cost;
                    results.insert(task.name.clone(), Value::String(response.text));
                }
                Err(e) if fail_fast => {
                    return Err(HandlerError::nested(
                        format!("batch task '{}' failed", task.name),
                        e,
                    ));
                }
                Err(e) => {
                    warn!("Batch task '{}' of '{}' failed: {}", task.name, step.name, e);
                    errors.insert(task.name.clone(), Value::String(e.to_string()));
                }
            }
        }

        info!(
            "  Batch '{}': {}/{} tasks completed",
            step.name,
            results.len(),
            tasks.len()
        );

        if !tasks.is_empty() && results.is_empty() {
            return Ok(json!({
                "success": false,
                "error": format!("all {} batch tasks failed", tasks.len()),
            })
            .into());
        }

        let failed: Vec<&String> = errors.keys().collect();
        Ok(json!({
            "success": true,
            "data": {
                "results": results,
                "failed": failed,
                "errors": errors,
            },
            "cost": cost,
        })
        .into())
    }
}
