//! `session` steps: one turn of a named, turn-bounded conversation.
//!
//! The session is looked up by name (newest active one wins) and created on
//! first use. Earlier turns are replayed to the client as message history.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};

use super::{build_request, call_model, config_u32, resolve_prompt};
use crate::error::HandlerError;
use crate::execution::client::{Message, ModelClient};
use crate::execution::context::StepContext;
use crate::execution::dispatcher::{tags, StepHandler, StepOutput};
use crate::store::SessionOptions;
use crate::workflow::Step;

pub struct SessionHandler {
    client: Arc<dyn ModelClient>,
}

impl SessionHandler {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

fn session_options(step: &Step) -> Result<SessionOptions, HandlerError> {
    let mut options = SessionOptions::default();
    if step.config_value("persist").and_then(Value::as_bool).unwrap_or(false) {
        options = options.persisted();
    }
    if let Some(max) = config_u32(step, "max_turns")? {
        options = options.with_max_turns(max);
    }
    if let Some(interval) = config_u32(step, "checkpoint_interval")? {
        options = options.with_checkpoint_interval(interval);
    }
    Ok(options)
}

#[async_trait]
impl StepHandler for SessionHandler {
    fn step_type(&self) -> &str {
        tags::SESSION
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let name = match step.config_str("session") {
            Some(name) => ctx.render(name)?,
            None => step.name.clone(),
        };
        let prompt = resolve_prompt(step, ctx)?;
        let options = session_options(step)?;
        let mut request = build_request(step, ctx, prompt.clone())?;

        // Start the turn and copy out the history without holding the lock
        // across the model call.
        let (id, outcome, history) = {
            let mut sessions = ctx.services.sessions.lock().await;
            let existing = sessions.find_by_name(&name)?.map(|s| s.id.clone());
            let id = match existing {
                Some(id) => id,
                None => sessions.create(&name, options)?.id.clone(),
            };
            let history: Vec<(String, String)> = sessions
                .get(&id)
                .map(|s| s.history().map(|(p, r)| (p.to_string(), r.to_string())).collect())
                .unwrap_or_default();
            let outcome = sessions.continue_session(&id, &prompt)?;
            (id, outcome, history)
        };

        let mut messages = Vec::with_capacity(history.len() * 2 + 1);
        for (past_prompt, past_response) in history {
            messages.push(Message::user(past_prompt));
            messages.push(Message::assistant(past_response));
        }
        messages.append(&mut request.messages);
        request.messages = messages;

        let response = call_model(self.client.as_ref(), &request).await?;

        let total_cost = {
            let mut sessions = ctx.services.sessions.lock().await;
            sessions.record_response(&id, &response.text, response.cost)?.total_cost
        };
        info!(
            "  Session '{}' turn {} ({} remaining)",
            name, outcome.turn_count, outcome.remaining
        );

        let value = json!({
            "success": true,
            "content": response.text,
            "session_id": id,
            "turn": outcome.turn_count,
            "remaining": outcome.remaining,
            "session_cost": total_cost,
            "cost": response.cost,
        });
        Ok(StepOutput::new(value).with_session(id))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Fixture, ScriptedClient};
    use super::*;
    use crate::execution::client::Role;
    use crate::store::SessionError;

    fn chat_step(prompt: &str) -> Step {
        Step::new("chat", "session")
            .with_config("session", "tutor")
            .with_config("prompt", prompt)
            .with_config("max_turns", 2)
    }

    #[tokio::test]
    async fn test_session_replays_history() {
        let client = Arc::new(ScriptedClient::new(vec![Ok("hello".into()), Ok("again".into())]));
        let fixture = Fixture::with_client(client.clone());
        let handler = SessionHandler::new(client.clone());

        let first = handler.execute(&chat_step("hi"), &fixture.ctx()).await.unwrap();
        let second = handler.execute(&chat_step("more"), &fixture.ctx()).await.unwrap();

        assert_eq!(first.value["session_id"], second.value["session_id"]);
        assert_eq!(second.value["turn"], json!(2));
        assert_eq!(second.value["remaining"], json!(0));
        assert_eq!(second.sessions.len(), 1);

        let requests = client.requests.lock().unwrap();
        let roles: Vec<Role> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(requests[1].messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_session_bounds_error() {
        let client = Arc::new(ScriptedClient::new(Vec::new()));
        let fixture = Fixture::with_client(client.clone());
        let handler = SessionHandler::new(client.clone());

        handler.execute(&chat_step("1"), &fixture.ctx()).await.unwrap();
        handler.execute(&chat_step("2"), &fixture.ctx()).await.unwrap();
        let err = handler.execute(&chat_step("3"), &fixture.ctx()).await.unwrap_err();

        assert!(matches!(err, HandlerError::Session(SessionError::Bounds { .. })));
        assert_eq!(client.calls(), 2);

        let sessions = fixture.services.sessions.lock().await;
        let session = sessions.list()[0];
        assert_eq!(session.turn_count, 2);
    }

    #[tokio::test]
    async fn test_oversized_max_turns_rejected() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let fixture = Fixture::with_client(client.clone());
        let step = chat_step("hi").with_config("max_turns", 4_294_967_296u64);

        let err = SessionHandler::new(client.clone())
            .execute(&step, &fixture.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Config(_)));
        assert!(fixture.services.sessions.lock().await.list().is_empty());
        assert_eq!(client.calls(), 0);
    }
}
