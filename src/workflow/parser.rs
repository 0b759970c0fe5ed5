//! Workflow Parser
//!
//! Loads workflow definitions from YAML or JSON files. The format is picked
//! from the file extension (`.json` is JSON, anything else YAML). Loading
//! performs the structural validation that does not depend on which step
//! handlers are registered.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use super::validator::validate_workflow;

/// Serialization format of a workflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Yaml,
    Json,
}

impl WorkflowFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Parses a workflow from a string without validating it.
pub fn parse_workflow(content: &str, format: WorkflowFormat) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let workflow = match format {
        WorkflowFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| format!("Failed to parse workflow YAML: {}. Check the file format.", e))?,
        WorkflowFormat::Json => serde_json::from_str(content)
            .map_err(|e| format!("Failed to parse workflow JSON: {}. Check the file format.", e))?,
    };
    Ok(workflow)
}

/// Loads a workflow from a file.
///
/// This function:
/// 1. Reads and parses the file
/// 2. Defaults the workflow name to the file stem
/// 3. Validates the workflow structure
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("research.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    let mut workflow = parse_workflow(&content, WorkflowFormat::from_path(path))?;

    if workflow.name.trim().is_empty() {
        workflow.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    info!("Parsed workflow '{}' with {} steps", workflow.name, workflow.steps.len());

    validate_workflow(&workflow, None)?;

    Ok(workflow)
}

/// Saves a workflow to a file in the format implied by its extension.
pub fn save_workflow(workflow: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let path = path.as_ref();
    let content = match WorkflowFormat::from_path(path) {
        WorkflowFormat::Yaml => serde_yaml::to_string(workflow)?,
        WorkflowFormat::Json => serde_json::to_string_pretty(workflow)?,
    };
    fs::write(path, content)?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
