//! Workflow Data Model
//!
//! Core data structures describing a workflow and its steps.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: research
//! defaults:
//!   model: small-model
//!   temperature: 0.3
//! steps:
//!   - name: outline
//!     type: llm
//!     prompt: "Outline an article about {{ vars.topic }}"
//!
//!   - name: review
//!     type: schema
//!     condition: outline.success == true
//!     prompt: "Rate this outline: {{ outline.content }}"
//!     schema:
//!       type: object
//!       required: [score]
//!     output_file: review.json
//! ```

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Config keys whose value names another step (optionally followed by a
/// dotted field path).
pub const REFERENCE_KEYS: &[&str] = &["source", "items_from", "input_from"];

/// Config keys holding nested step definitions.
const NESTED_KEYS: &[&str] = &["body", "tasks"];

/// A single declared unit of work.
///
/// Everything that is not one of the common fields below is kept in
/// `config` and interpreted by the handler registered for `step_type`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique name within the workflow; results are keyed by it.
    pub name: String,

    /// Type tag selecting the handler (e.g. "llm", "parallel", "transform").
    #[serde(rename = "type")]
    pub step_type: String,

    /// Boolean expression; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// File under the output directory receiving the normalized result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,

    /// Schema the step's payload must satisfy before it is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    /// Type-specific configuration.
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl Step {
    /// Creates a new step with an empty configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::Step;
    ///
    /// let step = Step::new("summarize", "llm")
    ///     .with_config("prompt", "Summarize {{ fetch.content }}")
    ///     .with_condition("fetch.success")
    ///     .with_output_file("summary.md");
    /// assert_eq!(step.config_str("prompt"), Some("Summarize {{ fetch.content }}"));
    /// ```
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            step_type: step_type.into().trim().to_string(),
            condition: None,
            output_file: None,
            output_schema: None,
            config: Map::new(),
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_output_file(mut self, path: impl Into<String>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Sets one configuration key.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Deserializes the whole configuration into a handler-specific type.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.config.clone()))
    }

    /// Names of other steps this step reads from, including nested steps.
    pub fn references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        collect_references(&self.config, &mut refs);
        refs.sort();
        refs.dedup();
        refs
    }
}

fn collect_references(config: &Map<String, Value>, refs: &mut Vec<String>) {
    for key in REFERENCE_KEYS {
        if let Some(Value::String(target)) = config.get(*key) {
            if let Some(root) = target.split('.').next().filter(|r| !r.is_empty()) {
                refs.push(root.to_string());
            }
        }
    }

    for key in NESTED_KEYS {
        match config.get(*key) {
            Some(Value::Object(nested)) => collect_references(nested, refs),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::Object(nested) = item {
                        collect_references(nested, refs);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Model-call defaults applied to every step unless overridden.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StepDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A complete workflow definition. Read-only once execution starts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// Workflow name; checkpoints are keyed by it.
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub defaults: StepDefaults,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_enabled: Option<bool>,

    /// Initial variables visible to templates as `vars.*`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,

    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Creates a new empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            defaults: StepDefaults::default(),
            workspace_dir: None,
            output_dir: None,
            checkpoint_dir: None,
            checkpoint_enabled: None,
            variables: Map::new(),
            steps: Vec::new(),
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut workflow = Self::new(name);
        workflow.steps = steps;
        workflow
    }

    /// Appends a step, rejecting duplicate names.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.name == step.name) {
            return Err(format!("Step '{}' already exists", step.name));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns the position of a step in execution order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self::new("workflow")
    }
}
