//! Single-call model handlers: `llm`, `schema`, `smart` and `extract`.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Map, Value};

use super::{build_request, call_model, parse_json_response, resolve_prompt, response_value};
use crate::error::HandlerError;
use crate::execution::client::ModelClient;
use crate::execution::context::StepContext;
use crate::execution::dispatcher::{tags, StepHandler, StepOutput};
use crate::store::schema;
use crate::workflow::Step;

/// One prompt, one answer.
pub struct LlmHandler {
    client: Arc<dyn ModelClient>,
}

impl LlmHandler {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StepHandler for LlmHandler {
    fn step_type(&self) -> &str {
        tags::LLM
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let prompt = resolve_prompt(step, ctx)?;
        let request = build_request(step, ctx, prompt)?;
        let response = call_model(self.client.as_ref(), &request).await?;
        info!("  {} answered {} ({} tokens)", response.model, step.name, response.output_tokens);
        Ok(response_value(&response).into())
    }
}

/// Model call whose answer must be JSON matching `schema`.
pub struct SchemaHandler {
    client: Arc<dyn ModelClient>,
}

impl SchemaHandler {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StepHandler for SchemaHandler {
    fn step_type(&self) -> &str {
        tags::SCHEMA
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let schema = step
            .config_value("schema")
            .filter(|s| s.is_object())
            .ok_or_else(|| HandlerError::Config(format!("step '{}' needs an object 'schema'", step.name)))?;

        let prompt = resolve_prompt(step, ctx)?;
        let mut request = build_request(step, ctx, prompt)?;
        request.response_schema = Some(schema.clone());

        let response = call_model(self.client.as_ref(), &request).await?;
        let parsed = parse_json_response(&response.text)?;
        schema::validate(&parsed, schema)?;
        debug!("Structured answer for '{}' satisfies its schema", step.name);

        Ok(json!({"success": true, "data": parsed, "cost": response.cost}).into())
    }
}

/// Named bundles of system prompt and temperature.
const PRESETS: &[(&str, &str, f64)] = &[
    (
        "analysis",
        "You are a careful analyst. Reason step by step and state your conclusions plainly.",
        0.2,
    ),
    (
        "creative",
        "You are an imaginative writer. Favour vivid, original phrasing.",
        0.9,
    ),
    ("concise", "Answer as briefly as possible without losing accuracy.", 0.3),
    (
        "code",
        "You are an expert programmer. Answer with correct, idiomatic code and minimal prose.",
        0.1,
    ),
];

fn preset(name: &str) -> Option<(&'static str, f64)> {
    PRESETS
        .iter()
        .find(|(preset, _, _)| *preset == name)
        .map(|(_, system, temperature)| (*system, *temperature))
}

/// Model call configured by a named `preset`. Explicit `system` or
/// `temperature` on the step win over the preset.
pub struct SmartHandler {
    client: Arc<dyn ModelClient>,
}

impl SmartHandler {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StepHandler for SmartHandler {
    fn step_type(&self) -> &str {
        tags::SMART
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let name = step.config_str("preset").unwrap_or("analysis");
        let (system, temperature) = preset(name).ok_or_else(|| {
            let known: Vec<&str> = PRESETS.iter().map(|(n, _, _)| *n).collect();
            HandlerError::Config(format!(
                "step '{}' uses unknown preset '{}' (known: {})",
                step.name,
                name,
                known.join(", ")
            ))
        })?;

        let prompt = resolve_prompt(step, ctx)?;
        let mut request = build_request(step, ctx, prompt)?;
        if step.config_value("system").is_none() {
            request.system = Some(system.to_string());
        }
        if step.config_value("temperature").is_none() {
            request.temperature = Some(temperature);
        }

        let response = call_model(self.client.as_ref(), &request).await?;
        let mut output = response_value(&response);
        output["preset"] = Value::String(name.to_string());
        Ok(output.into())
    }
}

/// Pulls named `fields` out of free text.
pub struct ExtractHandler {
    client: Arc<dyn ModelClient>,
}

impl ExtractHandler {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }

    fn input_text(step: &Step, ctx: &StepContext<'_>) -> Result<String, HandlerError> {
        if let Some(input) = step.config_str("input") {
            return ctx.render(input);
        }
        if let Some(source) = step.config_str("source") {
            let value = ctx.lookup(source).ok_or_else(|| HandlerError::DanglingReference {
                step: step.name.clone(),
                reference: source.to_string(),
            })?;
            return Ok(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }
        Err(HandlerError::Config(format!(
            "step '{}' needs an 'input' or a 'source'",
            step.name
        )))
    }
}

#[async_trait]
impl StepHandler for ExtractHandler {
    fn step_type(&self) -> &str {
        tags::EXTRACT
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let fields: Vec<String> = match step.config_value("fields") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            _ => Vec::new(),
        };
        if fields.is_empty() {
            return Err(HandlerError::Config(format!(
                "step '{}' needs a non-empty 'fields' list",
                step.name
            )));
        }

        let text = Self::input_text(step, ctx)?;
        let prompt = format!(
            "Extract the following fields from the text below and answer with a JSON object \
             using exactly these keys: {}. Use null for anything not present.\n\nText:\n{}",
            fields.join(", "),
            text
        );

        let mut properties = Map::new();
        for field in &fields {
            properties.insert(field.clone(), json!({"type": ["string", "null"]}));
        }
        let mut request = build_request(step, ctx, prompt)?;
        request.response_schema = Some(json!({"type": "object", "properties": properties}));

        let response = call_model(self.client.as_ref(), &request).await?;
        let parsed = parse_json_response(&response.text)?;

        let mut extracted = Map::new();
        for field in &fields {
            extracted.insert(field.clone(), parsed.get(field).cloned().unwrap_or(Value::Null));
        }
        let found = extracted.values().filter(|v| !v.is_null()).count();
        debug!("Extracted {}/{} fields for '{}'", found, fields.len(), step.name);

        Ok(json!({"success": true, "data": extracted, "cost": response.cost}).into())
    }
}
