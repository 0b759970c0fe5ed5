//! Model Client
//!
//! The seam between step handlers and whatever model provider answers
//! prompts. Providers live outside this crate; they implement
//! [`ModelClient`] and are handed to
//! [`StepDispatcher::with_builtin_handlers`](super::StepDispatcher::with_builtin_handlers).
//! [`EchoClient`] is an offline implementation used by the CLI and tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A single completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// When set, the provider should answer with JSON matching this schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            ..Self::default()
        }
    }

    /// Content of the last user message.
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// A provider's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("model request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Failures worth retrying in `robust` steps.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::Provider(_))
    }
}

/// A model provider.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider name used in logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError>;
}

/// Offline client that echoes the prompt back.
///
/// With a `response_schema` it instead produces a JSON document with a
/// placeholder for each declared property, so structured steps can be
/// exercised end to end without a provider.
#[derive(Debug, Clone, Default)]
pub struct EchoClient {
    /// Cost reported per call.
    pub cost_per_call: f64,
}

impl EchoClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelClient for EchoClient {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError> {
        let prompt = request.prompt();
        let text = match &request.response_schema {
            Some(schema) => skeleton(schema, prompt).to_string(),
            None => prompt.to_string(),
        };
        Ok(ModelResponse {
            output_tokens: text.split_whitespace().count() as u32,
            input_tokens: prompt.split_whitespace().count() as u32,
            text,
            model: request.model.clone().unwrap_or_else(|| "echo".to_string()),
            cost: self.cost_per_call,
        })
    }
}

/// Placeholder value satisfying the shape of `schema`.
fn skeleton(schema: &Value, prompt: &str) -> Value {
    if let Some(Value::Array(options)) = schema.get("enum") {
        if let Some(first) = options.first() {
            return first.clone();
        }
    }
    let declared = match schema.get("type") {
        Some(Value::String(t)) => t.as_str(),
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).next().unwrap_or("object"),
        _ => "object",
    };
    match declared {
        "object" => {
            let mut map = Map::new();
            if let Some(Value::Object(properties)) = schema.get("properties") {
                for (key, sub) in properties {
                    map.insert(key.clone(), skeleton(sub, prompt));
                }
            }
            Value::Object(map)
        }
        "array" => match schema.get("items") {
            Some(items) if schema.get("minItems").and_then(Value::as_u64).unwrap_or(0) > 0 => {
                Value::Array(vec![skeleton(items, prompt)])
            }
            _ => Value::Array(Vec::new()),
        },
        "integer" | "number" => schema.get("minimum").cloned().unwrap_or(Value::from(0)),
        "boolean" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::String(prompt.chars().take(80).collect()),
    }
}
