//! `file` steps: workspace file operations.
//!
//! Paths are rendered as templates and resolved against the workspace
//! directory. Text reads go through the shared [`FileCache`](crate::store::FileCache).

use std::path::Path;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use crate::error::HandlerError;
use crate::execution::context::StepContext;
use crate::execution::dispatcher::{tags, StepHandler, StepOutput};
use crate::store::codec::Variable;
use crate::workflow::Step;

pub struct FileHandler;

impl FileHandler {
    fn content(step: &Step, ctx: &StepContext<'_>) -> Result<String, HandlerError> {
        match step.config_value("content") {
            Some(Value::String(template)) => ctx.render(template),
            Some(other) => Ok(serde_json::to_string_pretty(&ctx.render_value(other)?)
                .map_err(|e| HandlerError::Failed(e.to_string()))?),
            None => Err(HandlerError::Config(format!(
                "step '{}' needs 'content' to write",
                step.name
            ))),
        }
    }

    async fn ensure_parent(path: &Path) -> Result<(), HandlerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn list(path: &Path) -> Result<Vec<Value>, HandlerError> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names.into_iter().map(Value::String).collect())
    }
}

#[async_trait]
impl StepHandler for FileHandler {
    fn step_type(&self) -> &str {
        tags::FILE
    }

    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutput, HandlerError> {
        let operation = step.config_str("operation").unwrap_or("read");
        let raw_path = step
            .config_str("path")
            .ok_or_else(|| HandlerError::Config(format!("step '{}' needs a 'path'", step.name)))?;
        let path = ctx.workspace_path(&ctx.render(raw_path)?);
        let display = path.display().to_string();
        debug!("File step '{}': {} {}", step.name, operation, display);

        let (data, variable) = match operation {
            "read" => {
                let text = ctx.services.cache.read_to_string(&path)?;
                let value = json!({"content": &*text, "path": display, "bytes": text.len()});
                (value, Variable::Value(Value::String(text.to_string())))
            }
            "read_bytes" => {
                let bytes = tokio::fs::read(&path).await?;
                let value = json!({"path": display, "bytes": bytes.len()});
                (value, Variable::Bytes(bytes))
            }
            "write" | "append" => {
                let content = Self::content(step, ctx)?;
                Self::ensure_parent(&path).await?;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(operation == "append")
                    .truncate(operation == "write")
                    .open(&path)
                    .await?;
                file.write_all(content.as_bytes()).await?;
                file.flush().await?;
                let value = json!({"path": display, "bytes": content.len()});
                (value, Variable::Path(path.clone()))
            }
            "exists" => {
                let exists = tokio::fs::try_exists(&path).await?;
                (json!({"path": display, "exists": exists}), Variable::Value(Value::Bool(exists)))
            }
            "list" => {
                let entries = Self::list(&path).await?;
                (
                    json!({"path": display, "entries": entries.clone()}),
                    Variable::Value(Value::Array(entries)),
                )
            }
            other => {
                return Err(HandlerError::Config(format!(
                    "step '{}' has unknown file operation '{}'",
                    step.name, other
                )))
            }
        };

        let mut output = StepOutput::new(json!({"success": true, "data": data}));
        if let Some(name) = step.config_str("save_as") {
            output = output.with_variable(name, variable);
        }
        Ok(output)
    }
}
