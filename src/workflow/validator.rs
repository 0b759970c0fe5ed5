//! Workflow Validation
//!
//! Structural checks run before execution:
//! - Workflow is not empty
//! - Step names are present and unique
//! - Step type tags are known to the dispatcher
//! - Step references point at steps declared earlier
//! - Conditions parse
//!
//! All problems are collected and reported together.

use std::collections::HashSet;
use std::fmt;

use log::{debug, info};

use super::condition::Condition;
use super::model::{Step, WorkflowDefinition};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyStepName(usize),
    DuplicateStepName(String),
    UnknownStepType { step: String, step_type: String },
    DanglingReference { step: String, reference: String },
    InvalidCondition { step: String, message: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::EmptyStepName(index) => {
                write!(f, "Step at position {} has an empty name", index + 1)
            }
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::UnknownStepType { step, step_type } => {
                write!(f, "Step '{}' has unknown type '{}'", step, step_type)
            }
            Self::DanglingReference { step, reference } => write!(
                f,
                "Step '{}' references '{}', which is not declared before it",
                step, reference
            ),
            Self::InvalidCondition { step, message } => {
                write!(f, "Step '{}' has an invalid condition: {}", step, message)
            }
        }
    }
}

/// Every problem found in a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

fn validate_step(
    index: usize,
    step: &Step,
    earlier: &HashSet<&str>,
    known_types: Option<&[&str]>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName(index));
        return errors;
    }

    if let Some(known) = known_types {
        if !known.contains(&step.step_type.as_str()) {
            errors.push(ValidationError::UnknownStepType {
                step: step.name.clone(),
                step_type: step.step_type.clone(),
            });
        }
    }

    for reference in step.references() {
        if !earlier.contains(reference.as_str()) {
            errors.push(ValidationError::DanglingReference {
                step: step.name.clone(),
                reference,
            });
        }
    }

    if let Some(condition) = &step.condition {
        match Condition::parse(condition) {
            Ok(parsed) => {
                for root in parsed.roots() {
                    if root != "vars" && !earlier.contains(root.as_str()) {
                        debug!(
                            "Step '{}' condition reads '{}', which has no earlier result; it will evaluate as missing",
                            step.name, root
                        );
                    }
                }
            }
            Err(e) => errors.push(ValidationError::InvalidCondition {
                step: step.name.clone(),
                message: e.to_string(),
            }),
        }
    }

    errors
}

/// Validates the workflow structure.
///
/// `known_types` is the list of tags registered with the dispatcher; pass
/// `None` to skip the type check (e.g. when loading a file before a
/// dispatcher exists).
pub fn validate_workflow(
    workflow: &WorkflowDefinition,
    known_types: Option<&[&str]>,
) -> Result<(), ValidationErrors> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.name,
        workflow.steps.len()
    );

    if workflow.steps.is_empty() {
        return Err(ValidationErrors(vec![ValidationError::EmptyWorkflow]));
    }

    let mut errors = Vec::new();
    let mut earlier: HashSet<&str> = HashSet::new();

    for (index, step) in workflow.steps.iter().enumerate() {
        errors.extend(validate_step(index, step, &earlier, known_types));

        if !step.name.trim().is_empty() && !earlier.insert(step.name.as_str()) {
            errors.push(ValidationError::DuplicateStepName(step.name.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TYPES: &[&str] = &["llm", "transform", "set"];

    fn wf(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition::from_steps("wf", steps)
    }

    #[test]
    fn test_valid_workflow() {
        let workflow = wf(vec![
            Step::new("a", "set").with_config("vars", json!({"x": 1})),
            Step::new("b", "transform")
                .with_config("source", "a.x")
                .with_condition("a.x == 1"),
        ]);
        assert!(validate_workflow(&workflow, Some(TYPES)).is_ok());
    }

    #[test]
    fn test_empty_workflow() {
        let err = validate_workflow(&wf(vec![]), None).unwrap_err();
        assert_eq!(err.0, vec![ValidationError::EmptyWorkflow]);
    }

    #[test]
    fn test_duplicate_names() {
        let workflow = wf(vec![Step::new("a", "llm"), Step::new("a", "llm")]);
        let err = validate_workflow(&workflow, Some(TYPES)).unwrap_err();
        assert!(err.0.contains(&ValidationError::DuplicateStepName("a".into())));
    }

    #[test]
    fn test_unknown_type() {
        let workflow = wf(vec![Step::new("a", "teleport")]);
        let err = validate_workflow(&workflow, Some(TYPES)).unwrap_err();
        assert_eq!(
            err.0,
            vec![ValidationError::UnknownStepType {
                step: "a".into(),
                step_type: "teleport".into()
            }]
        );

        // Without a type list the tag is not checked.
        assert!(validate_workflow(&workflow, None).is_ok());
    }

    #[test]
    fn test_dangling_and_forward_references() {
        let workflow = wf(vec![
            Step::new("a", "transform").with_config("source", "b.text"),
            Step::new("b", "llm"),
            Step::new("c", "transform").with_config("source", "ghost"),
        ]);
        let err = validate_workflow(&workflow, Some(TYPES)).unwrap_err();
        assert_eq!(err.0.len(), 2);
        assert!(err.to_string().contains("'a' references 'b'"));
        assert!(err.to_string().contains("'c' references 'ghost'"));
    }

    #[test]
    fn test_invalid_condition() {
        let workflow = wf(vec![Step::new("a", "llm").with_condition("x ==")]);
        let err = validate_workflow(&workflow, Some(TYPES)).unwrap_err();
        assert!(matches!(err.0[0], ValidationError::InvalidCondition { .. }));
    }

    #[test]
    fn test_condition_on_unknown_step_is_allowed() {
        let workflow = wf(vec![Step::new("a", "llm").with_condition("later.ok")]);
        assert!(validate_workflow(&workflow, Some(TYPES)).is_ok());
    }

    #[test]
    fn test_empty_step_name() {
        let workflow = wf(vec![Step::new("  ", "llm")]);
        let err = validate_workflow(&workflow, Some(TYPES)).unwrap_err();
        assert_eq!(err.0, vec![ValidationError::EmptyStepName(0)]);
    }
}
