//! Built-in Step Handlers
//!
//! One handler per built-in type tag. Model-backed handlers share the
//! request-building helpers below so workflow `defaults` apply uniformly.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::{json, Value};

use super::client::{ClientError, ModelClient, ModelRequest, ModelResponse};
use super::context::StepContext;
use super::dispatcher::StepDispatcher;
use crate::error::HandlerError;
use crate::workflow::Step;

pub mod batch;
pub mod control;
pub mod data;
pub mod file;
pub mod llm;
pub mod parallel;
pub mod robust;
pub mod session;

/// Installs every built-in handler.
pub(crate) fn register_builtins(dispatcher: &mut StepDispatcher, client: Arc<dyn ModelClient>) {
    dispatcher.register(llm::LlmHandler::new(client.clone()));
    dispatcher.register(llm::SchemaHandler::new(client.clone()));
    dispatcher.register(llm::SmartHandler::new(client.clone()));
    dispatcher.register(llm::ExtractHandler::new(client.clone()));
    dispatcher.register(batch::BatchHandler::new(client.clone()));
    dispatcher.register(robust::RobustHandler::new(client.clone()));
    dispatcher.register(session::SessionHandler::new(client));
    dispatcher.register(parallel::ParallelHandler);
    dispatcher.register(control::LoopHandler);
    dispatcher.register(data::TransformHandler);
    dispatcher.register(data::SetHandler);
    dispatcher.register(file::FileHandler);
}

/// Rendered prompt text from `prompt` or `prompt_file` (workspace-relative,
/// read through the file cache).
pub(crate) fn resolve_prompt(step: &Step, ctx: &StepContext<'_>) -> Result<String, HandlerError> {
    if let Some(prompt) = step.config_str("prompt") {
        return ctx.render(prompt);
    }
    if let Some(file) = step.config_str("prompt_file") {
        let path = ctx.workspace_path(&ctx.render(file)?);
        let template = ctx.services.cache.read_to_string(&path)?;
        return ctx.render(&template);
    }
    Err(HandlerError::Config(format!(
        "step '{}' needs a 'prompt' or 'prompt_file'",
        step.name
    )))
}

/// Reads `key` as a number of seconds; negative, NaN or overflowing
/// values are configuration errors.
pub(crate) fn config_secs(step: &Step, key: &str) -> Result<Option<Duration>, HandlerError> {
    let Some(value) = step.config_value(key) else {
        return Ok(None);
    };
    let secs = value.as_f64().ok_or_else(|| {
        HandlerError::Config(format!("step '{}': '{}' must be a number of seconds", step.name, key))
    })?;
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| HandlerError::Config(format!("step '{}': '{}' is invalid ({}): {}", step.name, key, secs, e)))
}

/// Reads `key` as a `u32`, rejecting negative or out-of-range values.
pub(crate) fn config_u32(step: &Step, key: &str) -> Result<Option<u32>, HandlerError> {
    let Some(value) = step.config_value(key) else {
        return Ok(None);
    };
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| {
            HandlerError::Config(format!(
                "step '{}': '{}' must be an integer between 0 and {}, got {}",
                step.name,
                key,
                u32::MAX,
                value
            ))
        })
}

/// Builds a request for `prompt`, layering step settings over workflow
/// defaults.
pub(crate) fn build_request(step: &Step, ctx: &StepContext<'_>, prompt: String) -> Result<ModelRequest, HandlerError> {
    let defaults = &ctx.workflow.defaults;
    let system = match step.config_str("system").or(defaults.system.as_deref()) {
        Some(system) => Some(ctx.render(system)?),
        None => None,
    };
    let timeout = config_secs(step, "timeout_secs")?.unwrap_or(ctx.settings.provider_timeout);

    let mut request = ModelRequest::new(prompt);
    request.model = step
        .config_str("model")
        .map(str::to_string)
        .or_else(|| defaults.model.clone());
    request.system = system;
    request.temperature = step
        .config_value("temperature")
        .and_then(Value::as_f64)
        .or(defaults.temperature);
    request.max_tokens = config_u32(step, "max_tokens")?.or(defaults.max_tokens);
    request.timeout = Some(timeout);
    Ok(request)
}

/// Sends `request`, enforcing its timeout.
pub(crate) async fn call_model(client: &dyn ModelClient, request: &ModelRequest) -> Result<ModelResponse, HandlerError> {
    debug!(
        "Calling model '{}' via {}",
        request.model.as_deref().unwrap_or("default"),
        client.name()
    );
    match request.timeout {
        Some(limit) => tokio::time::timeout(limit, client.complete(request))
            .await
            .map_err(|_| ClientError::Timeout(limit))?
            .map_err(HandlerError::from),
        None => client.complete(request).await.map_err(HandlerError::from),
    }
}

/// Standard output document for a text response.
pub(crate) fn response_value(response: &ModelResponse) -> Value {
    json!({
        "success": true,
        "content": response.text,
        "model": response.model,
        "usage": {
            "input_tokens": response.input_tokens,
            "output_tokens": response.output_tokens,
        },
        "cost": response.cost,
    })
}

/// Parses a JSON answer, tolerating Markdown code fences and prose around
/// the document.
pub(crate) fn parse_json_response(text: &str) -> Result<Value, HandlerError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let unfenced = trimmed
        .split("```")
        .nth(1)
        .map(|block| block.trim_start_matches("json").trim())
        .unwrap_or(trimmed);
    if let Ok(value) = serde_json::from_str(unfenced) {
        return Ok(value);
    }

    let start = unfenced.find(['{', '[']);
    let end = unfenced.rfind(['}', ']']);
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&unfenced[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(HandlerError::Failed(format!(
        "response is not valid JSON: {}",
        trimmed.chars().take(120).collect::<String>()
    )))
}


#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use crate::workflow::StepDefaults;

    #[test]
    fn test_parse_json_response_variants() {
        assert_eq!(parse_json_response(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(
            parse_json_response("```json\n{\"a\": 2}\n```").unwrap(),
            json!({"a": 2})
        );
        assert_eq!(
            parse_json_response("Sure! Here it is: [1, 2] hope that helps").unwrap(),
            json!([1, 2])
        );
        assert!(parse_json_response("no json here").is_err());
    }

    #[test]
    fn test_build_request_layers_defaults() {
        let mut fixture = Fixture::new();
        fixture.workflow.defaults = StepDefaults {
            model: Some("base".into()),
            temperature: Some(0.5),
            system: Some("Be brief.".into()),
            max_tokens: Some(100),
        };
        let step = Step::new("a", "llm")
            .with_config("model", "override")
            .with_config("timeout_secs", 3);

        let request = build_request(&step, &fixture.ctx(), "hi".into()).unwrap();
        assert_eq!(request.model.as_deref(), Some("override"));
        assert_eq!(request.temperature, Some(0.5));
        assert_eq!(request.system.as_deref(), Some("Be brief."));
        assert_eq!(request.max_tokens, Some(100));
        assert_eq!(request.timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_resolve_prompt_from_file() {
        let mut fixture = Fixture::new();
        fixture.workflow = fixture.workflow.clone().with_variable("name", "Ada");
        fixture.variables.insert(
            "name".into(),
            crate::store::Variable::Value(json!("Ada")),
        );
        let path = fixture.settings.workspace_dir.join("greet.txt");
        std::fs::write(&path, "Hello {{ vars.name }}").unwrap();

        let step = Step::new("a", "llm").with_config("prompt_file", "greet.txt");
        assert_eq!(resolve_prompt(&step, &fixture.ctx()).unwrap(), "Hello Ada");

        let missing = Step::new("b", "llm");
        assert!(matches!(
            resolve_prompt(&missing, &fixture.ctx()),
            Err(HandlerError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_timeout_is_config_error() {
        let fixture = Fixture::new();
        for bad in [json!(-1), json!(1e300), json!("soon")] {
            let step = Step::new("a", "llm").with_config("timeout_secs", bad);
            assert!(matches!(
                build_request(&step, &fixture.ctx(), "hi".into()),
                Err(HandlerError::Config(_))
            ));
        }
    }

    #[test]
    fn test_config_u32_rejects_out_of_range() {
        let step = Step::new("a", "llm")
            .with_config("max_tokens", 4_294_967_296u64)
            .with_config("ok", 7)
            .with_config("negative", -3);
        assert!(matches!(config_u32(&step, "max_tokens"), Err(HandlerError::Config(_))));
        assert!(matches!(config_u32(&step, "negative"), Err(HandlerError::Config(_))));
        assert_eq!(config_u32(&step, "ok").unwrap(), Some(7));
        assert_eq!(config_u32(&step, "absent").unwrap(), None);
    }
}
