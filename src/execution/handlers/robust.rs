//! `robust` steps: a model call retried with exponential backoff.
//!
//! Only transient client failures (timeouts, rate limits, provider errors)
//! are retried; configuration and template errors surface immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{build_request, call_model, config_u32, resolve_prompt, response_value};
use crate::error::HandlerError;
use crate::execution::client::ModelClient;
use crate::execution::context::StepContext;
use crate::execution::dispatcher::{tags, StepHandler, StepOutput};
use crate::workflow::Step;

/// Retry settings read from the step configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    fn from_step(step: &Step) -> Result<Self, HandlerError> {
        let mut config = Self::default();
        let read_u64 = |key: &str| -> Result<Option<u64>, HandlerError> {
            match step.config_value(key) {
                None => Ok(None),
                Some(v) => v
                    .as_u64()
                    .map(Some)
                    .ok_or_else(|| HandlerError::Config(format!("'{}' must be a non-negative integer", key))),
            }
        };
        if let Some(n) = config_u32(step, "max_attempts")? {
            config.max_attempts = n.max(1);
        }
        if let Some(ms) = read_u64("initial_delay_ms")? {
            config.initial_delay_ms = ms;
        }
        if let Some(ms) = read_u64("max_delay_ms")? {
            config.max_delay_ms = ms;
        }
        if let Some(m) = step.config_value("backoff_multiplier") {
            config.backoff_multiplier = m
                .as_f64()
                .filter(|m| *m >= 1.0)
                .ok_or_else(|| HandlerError::Config("'backoff_multiplier' must be a number >= 1".into()))?;
        }
        Ok(config)
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }
}

pub struct RobustHandler {
    client: Arc<dyn ModelClient>,
}

impl RobustHandler {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StepHandler for RobustHandler {
    fn step_type(&self) -> &str {
        tags::ROBUST
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let retry = RetryConfig::from_step(step)?;
        let prompt = resolve_prompt(step, ctx)?;
        let request = build_request(step, ctx, prompt)?;

        let mut attempt = 1;
        loop {
            match call_model(self.client.as_ref(), &request).await {
                Ok(response) => {
                    let mut output = response_value(&response);
                    output["attempts"] = Value::from(attempt);
                    return Ok(output.into());
                }
                Err(HandlerError::Client(e)) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        "Step '{}' attempt {}/{} failed ({}), retrying in {:?}",
                        step.name, attempt, retry.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e @ HandlerError::Client(_)) => {
                    return Err(HandlerError::nested(
                        format!("gave up after {} attempt(s)", attempt),
                        e,
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Fixture, ScriptedClient};
    use super::*;
    use crate::execution::client::ClientError;
    use serde_json::json;

    fn robust_step(max_attempts: u32) -> Step {
        Step::new("steady", "robust")
            .with_config("prompt", "try")
            .with_config("max_attempts", max_attempts)
            .with_config("initial_delay_ms", 1)
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let retry = RetryConfig {
            max_delay_ms: 1500,
            ..RetryConfig::default()
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(2), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::RateLimited("slow down".into())),
            Err(ClientError::Provider("502".into())),
            Ok("finally".into()),
        ]));
        let fixture = Fixture::with_client(client.clone());

        let output = RobustHandler::new(client.clone())
            .execute(&robust_step(3), &fixture.ctx())
            .await
            .unwrap();
        assert_eq!(output.value["content"], json!("finally"));
        assert_eq!(output.value["attempts"], json!(3));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::Provider("a".into())),
            Err(ClientError::Provider("b".into())),
        ]));
        let fixture = Fixture::with_client(client.clone());

        let err = RobustHandler::new(client.clone())
            .execute(&robust_step(2), &fixture.ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 attempt"));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_invalid_requests() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ClientError::InvalidRequest(
            "bad".into(),
        ))]));
        let fixture = Fixture::with_client(client.clone());

        assert!(RobustHandler::new(client.clone())
            .execute(&robust_step(5), &fixture.ctx())
            .await
            .is_err());
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_configuration_errors_pass_through() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let fixture = Fixture::with_client(client.clone());

        let bad_timeout = robust_step(3).with_config("timeout_secs", -5);
        let err = RobustHandler::new(client.clone())
            .execute(&bad_timeout, &fixture.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Config(_)));

        let huge = robust_step(3).with_config("max_attempts", 4_294_967_297u64);
        assert!(matches!(RetryConfig::from_step(&huge), Err(HandlerError::Config(_))));
        assert_eq!(client.calls(), 0);
    }
}
