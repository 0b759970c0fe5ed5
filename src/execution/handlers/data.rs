//! Data steps that never call a model: `transform` and `set`.

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Map, Value};

use crate::error::HandlerError;
use crate::execution::context::StepContext;
use crate::execution::dispatcher::{tags, StepHandler, StepOutput};
use crate::store::codec::Variable;
use crate::workflow::condition::lookup_path;
use crate::workflow::Step;

/// Reads the step's input: `source` names a result field, `input` is a
/// literal or template.
fn step_input(step: &Step, ctx: &StepContext<'_>) -> Result<Value, HandlerError> {
    if let Some(source) = step.config_str("source") {
        return ctx.lookup(source).ok_or_else(|| HandlerError::DanglingReference {
            step: step.name.clone(),
            reference: source.to_string(),
        });
    }
    match step.config_value("input") {
        Some(input) => ctx.render_value(input),
        None => Err(HandlerError::Config(format!(
            "step '{}' needs a 'source' or an 'input'",
            step.name
        ))),
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn separator<'s>(step: &'s Step) -> &'s str {
    step.config_str("separator").unwrap_or("\n")
}

/// Applies `operation` to `input`.
fn transform(step: &Step, ctx: &StepContext<'_>, operation: &str, input: Value) -> Result<Value, HandlerError> {
    let out = match operation {
        "uppercase" => Value::String(as_text(&input).to_uppercase()),
        "lowercase" => Value::String(as_text(&input).to_lowercase()),
        "trim" => Value::String(as_text(&input).trim().to_string()),
        "length" => {
            let len = match &input {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => other.to_string().len(),
            };
            json!(len)
        }
        "json_parse" => match input {
            Value::String(text) => serde_json::from_str(text.trim())
                .map_err(|e| HandlerError::Failed(format!("input is not valid JSON: {}", e)))?,
            already => already,
        },
        "to_json" => Value::String(
            serde_json::to_string_pretty(&input).map_err(|e| HandlerError::Failed(e.to_string()))?,
        ),
        "split" => {
            let text = as_text(&input);
            let parts: Vec<Value> = text
                .split(separator(step))
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect();
            Value::Array(parts)
        }
        "join" => match &input {
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(as_text).collect();
                Value::String(parts.join(separator(step)))
            }
            other => Value::String(as_text(other)),
        },
        "pick" => {
            let fields = match step.config_value("fields") {
                Some(Value::Array(fields)) => fields,
                _ => {
                    return Err(HandlerError::Config(format!(
                        "step '{}': 'pick' needs a 'fields' list",
                        step.name
                    )))
                }
            };
            let mut picked = Map::new();
            for field in fields.iter().filter_map(Value::as_str) {
                let path: Vec<&str> = field.split('.').collect();
                let value = lookup_path(&input, &path).cloned().unwrap_or(Value::Null);
                picked.insert(field.to_string(), value);
            }
            Value::Object(picked)
        }
        "template" => {
            let template = step.config_str("template").ok_or_else(|| {
                HandlerError::Config(format!("step '{}': 'template' operation needs a 'template'", step.name))
            })?;
            let mut locals = Map::new();
            locals.insert("input".to_string(), input);
            Value::String(ctx.child(locals).render(template)?)
        }
        other => {
            return Err(HandlerError::Config(format!(
                "step '{}' has unknown transform operation '{}'",
                step.name, other
            )))
        }
    };
    Ok(out)
}

pub struct TransformHandler;

#[async_trait]
impl StepHandler for TransformHandler {
    fn step_type(&self) -> &str {
        tags::TRANSFORM
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let operation = step
            .config_str("operation")
            .ok_or_else(|| HandlerError::Config(format!("step '{}' needs an 'operation'", step.name)))?;
        let input = step_input(step, ctx)?;
        let out = transform(step, ctx, operation, input)?;
        debug!("Transform '{}' applied {}", step.name, operation);

        let mut output = StepOutput::new(json!({"success": true, "data": out.clone()}));
        if let Some(name) = step.config_str("save_as") {
            output = output.with_variable(name, Variable::Value(out));
        }
        Ok(output)
    }
}

/// Assigns every entry of `vars`, rendering string values as templates.
pub struct SetHandler;

#[async_trait]
impl StepHandler for SetHandler {
    fn step_type(&self) -> &str {
        tags::SET
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let Some(Value::Object(vars)) = step.config_value("vars") else {
            return Err(HandlerError::Config(format!(
                "step '{}' needs a 'vars' mapping",
                step.name
            )));
        };

        let mut assigned = Map::new();
        let mut output = StepOutput::default();
        for (name, raw) in vars {
            let value = ctx.render_value(raw)?;
            assigned.insert(name.clone(), value.clone());
            output = output.with_variable(name.clone(), Variable::Value(value));
        }
        debug!("Step '{}' assigned {} variables", step.name, assigned.len());

        output.value = json!({"success": true, "data": assigned});
        Ok(output)
    }
}
