//! `loop` steps: run a nested `body` step once per item, or while a
//! condition holds.
//!
//! Each iteration sees these scoped names:
//!
//! | name | value |
//! |---|---|
//! | `item` | current item (for-loops only) |
//! | `index`, `iteration` | zero-based iteration number |
//! | `loop` | `{index, index1, first, last, length}` |
//! | `last` | payload of the previous iteration, or null |
//!
//! Variables assigned by the body are visible to later iterations.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Map, Value};

use super::config_u32;
use crate::error::HandlerError;
use crate::execution::context::StepContext;
use crate::execution::dispatcher::{tags, StepHandler, StepOutput};
use crate::store::codec::Variables;
use crate::store::{normalize, StepResult};
use crate::workflow::{Condition, Step};

/// Upper bound on `while` iterations when the step does not set one.
/// For-loops run once per item unless `max_iterations` is set.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

pub struct LoopHandler;

enum LoopKind {
    Items(Vec<Value>),
    While(Condition),
}

fn body_step(step: &Step) -> Result<Step, HandlerError> {
    let Some(Value::Object(raw)) = step.config_value("body") else {
        return Err(HandlerError::Config(format!(
            "step '{}' needs a 'body' step mapping",
            step.name
        )));
    };
    let mut raw = raw.clone();
    raw.entry("name")
        .or_insert_with(|| Value::String(format!("{}_body", step.name)));
    serde_json::from_value(Value::Object(raw))
        .map_err(|e| HandlerError::Config(format!("body of step '{}': {}", step.name, e)))
}

fn loop_kind(step: &Step, ctx: &StepContext<'_>) -> Result<LoopKind, HandlerError> {
    if let Some(items) = step.config_value("items") {
        let rendered = ctx.render_value(items)?;
        return match rendered {
            Value::Array(items) => Ok(LoopKind::Items(items)),
            Value::String(text) => match serde_json::from_str(&text) {
                Ok(Value::Array(items)) => Ok(LoopKind::Items(items)),
                _ => Err(HandlerError::Config(format!(
                    "step '{}': 'items' did not render to a list",
                    step.name
                ))),
            },
            _ => Err(HandlerError::Config(format!(
                "step '{}': 'items' must be a list",
                step.name
            ))),
        };
    }

    if let Some(reference) = step.config_str("items_from") {
        let value = ctx.lookup(reference).ok_or_else(|| HandlerError::DanglingReference {
            step: step.name.clone(),
            reference: reference.to_string(),
        })?;
        return match value {
            Value::Array(items) => Ok(LoopKind::Items(items)),
            Value::Object(map) => Ok(LoopKind::Items(map.into_iter().map(|(_, v)| v).collect())),
            other => Err(HandlerError::Failed(format!(
                "'{}' is not a list (found {})",
                reference, other
            ))),
        };
    }

    if let Some(expression) = step.config_str("while") {
        return Ok(LoopKind::While(Condition::parse(expression)?));
    }

    Err(HandlerError::Config(format!(
        "step '{}' needs 'items', 'items_from' or 'while'",
        step.name
    )))
}

fn iteration_locals(index: usize, length: Option<usize>, item: Option<&Value>, last: &Value) -> Map<String, Value> {
    let mut locals = Map::new();
    if let Some(item) = item {
        locals.insert("item".to_string(), item.clone());
    }
    locals.insert("index".to_string(), json!(index));
    locals.insert("iteration".to_string(), json!(index));
    locals.insert(
        "loop".to_string(),
        json!({
            "index": index,
            "index1": index + 1,
            "first": index == 0,
            "last": length.map(|n| index + 1 == n),
            "length": length,
        }),
    );
    locals.insert("last".to_string(), last.clone());
    locals
}

#[async_trait]
impl StepHandler for LoopHandler {
    fn step_type(&self) -> &str {
        tags::LOOP
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let body = body_step(step)?;
        let kind = loop_kind(step, ctx)?;
        let explicit_max = config_u32(step, "max_iterations")?.map(|n| n as usize);

        let (items, condition) = match kind {
            LoopKind::Items(items) => (Some(items), None),
            LoopKind::While(condition) => (None, Some(condition)),
        };
        let length = items.as_ref().map(Vec::len);
        if let (Some(length), Some(max)) = (length, explicit_max) {
            if length > max {
                return Err(HandlerError::Config(format!(
                    "step '{}' has {} items but max_iterations is {}",
                    step.name, length, max
                )));
            }
        }
        let max_iterations = explicit_max.unwrap_or(match length {
            Some(length) => length,
            None => DEFAULT_MAX_ITERATIONS,
        });

        let mut variables: Variables = ctx.variables.clone();
        let mut output = StepOutput::default();
        let mut results = Vec::new();
        let mut cost = 0.0;
        let mut last = Value::Null;

        for index in 0.. {
            let item = match &items {
                Some(items) => match items.get(index) {
                    Some(item) => Some(item),
                    None => break,
                },
                None => None,
            };
            if index >= max_iterations {
                warn!("Loop '{}' stopped at max_iterations ({})", step.name, max_iterations);
                break;
            }

            let body_output = {
                let scoped = StepContext {
                    variables: &variables,
                    ..ctx.child(iteration_locals(index, length, item, &last))
                };
                if let Some(condition) = &condition {
                    if !condition.evaluate(&scoped) {
                        debug!("Loop '{}' condition false after {} iterations", step.name, index);
                        break;
                    }
                }
                ctx.dispatcher.dispatch(&body, &scoped).await.map_err(|e| {
                    HandlerError::nested(format!("iteration {} of loop '{}' failed", index, step.name), e)
                })?
            };

            let result = normalize(body_output.value);
            if let StepResult::Failure { reason } = &result {
                return Err(HandlerError::Failed(format!(
                    "iteration {} of loop '{}' failed: {}",
                    index, step.name, reason
                )));
            }
            cost += result.cost();
            last = result.payload().cloned().unwrap_or(Value::Null);
            results.push(last.clone());

            for (name, variable) in body_output.variables {
                variables.insert(name.clone(), variable.clone());
                output.variables.push((name, variable));
            }
            output.sessions.extend(body_output.sessions);
        }

        info!("  Loop '{}' ran {} iterations", step.name, results.len());
        output.value = json!({
            "success": true,
            "data": {
                "iterations": results.len(),
                "results": results,
            },
            "cost": cost,
        });
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::*;
    use crate::store::Variable;

    #[tokio::test]
    async fn test_for_loop_over_items() {
        let fixture = Fixture::new();
        let step = Step::new("each", "loop")
            .with_config("items", json!(["a", "b"]))
            .with_config(
                "body",
                json!({"type": "transform", "input": "{{ loop.index1 }}:{{ item }}", "operation": "uppercase"}),
            );

        let output = LoopHandler.execute(&step, &fixture.ctx()).await.unwrap();
        assert_eq!(output.value["data"]["iterations"], json!(2));
        assert_eq!(output.value["data"]["results"], json!(["1:A", "2:B"]));
    }

    #[tokio::test]
    async fn test_items_from_previous_result() {
        let mut fixture = Fixture::new();
        fixture.results.store("list", json!({"items": ["x", "y", "z"]}));
        let step = Step::new("each", "loop")
            .with_config("items_from", "list.items")
            .with_config("body", json!({"type": "transform", "input": "{{ item }}", "operation": "length"}));

        let output = LoopHandler.execute(&step, &fixture.ctx()).await.unwrap();
        assert_eq!(output.value["data"]["results"], json!([1, 1, 1]));
    }

    #[tokio::test]
    async fn test_while_loop_sees_its_own_variables() {
        let fixture = Fixture::new();
        let step = Step::new("count", "loop")
            .with_config("while", "iteration < 3 and not vars.stop")
            .with_config("body", json!({"type": "set", "vars": {"seen": "{{ iteration }}"}}));

        let output = LoopHandler.execute(&step, &fixture.ctx()).await.unwrap();
        assert_eq!(output.value["data"]["iterations"], json!(3));
        assert_eq!(
            output.variables.last(),
            Some(&("seen".to_string(), Variable::Value(json!("2"))))
        );
    }

    #[tokio::test]
    async fn test_while_loop_respects_max_iterations() {
        let fixture = Fixture::new();
        let step = Step::new("spin", "loop")
            .with_config("while", "true")
            .with_config("max_iterations", 4)
            .with_config("body", json!({"type": "set", "vars": {"x": 1}}));

        let output = LoopHandler.execute(&step, &fixture.ctx()).await.unwrap();
        assert_eq!(output.value["data"]["iterations"], json!(4));
    }

    #[tokio::test]
    async fn test_body_failure_fails_loop() {
        let fixture = Fixture::new();
        let step = Step::new("each", "loop")
            .with_config("items", json!([1]))
            .with_config("body", json!({"type": "teleport"}));

        let err = LoopHandler.execute(&step, &fixture.ctx()).await.unwrap_err();
        assert!(err.to_string().contains("iteration 0"));
    }

    #[tokio::test]
    async fn test_missing_items_reference() {
        let fixture = Fixture::new();
        let step = Step::new("each", "loop")
            .with_config("items_from", "ghost.items")
            .with_config("body", json!({"type": "set", "vars": {}}));
        assert!(matches!(
            LoopHandler.execute(&step, &fixture.ctx()).await,
            Err(HandlerError::DanglingReference { .. })
        ));
    }

    #[tokio::test]
    async fn test_for_loop_runs_every_item() {
        let fixture = Fixture::new();
        let items: Vec<Value> = (0..150).map(|n| json!(format!(" {} ", n))).collect();
        let step = Step::new("each", "loop")
            .with_config("items", Value::Array(items))
            .with_config("body", json!({"type": "transform", "input": "{{ item }}", "operation": "trim"}));

        let output = LoopHandler.execute(&step, &fixture.ctx()).await.unwrap();
        assert_eq!(output.value["data"]["iterations"], json!(150));
        assert_eq!(output.value["data"]["results"][149], json!("149"));
    }

    #[tokio::test]
    async fn test_for_loop_over_explicit_limit_is_rejected() {
        let fixture = Fixture::new();
        let step = Step::new("each", "loop")
            .with_config("items", json!([1, 2, 3]))
            .with_config("max_iterations", 2)
            .with_config("body", json!({"type": "set", "vars": {"x": 1}}));

        assert!(matches!(
            LoopHandler.execute(&step, &fixture.ctx()).await,
            Err(HandlerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_body_error_keeps_its_kind() {
        let fixture = Fixture::new();
        let step = Step::new("chat", "loop")
            .with_config("items", json!(["a", "b", "c"]))
            .with_config(
                "body",
                json!({"type": "session", "session": "loop_chat", "prompt": "{{ item }}", "max_turns": 2}),
            );

        let err = LoopHandler.execute(&step, &fixture.ctx()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SessionBounds);
        assert!(err.to_string().contains("iteration 2"));
    }
}
