//! Output Schema Validation
//!
//! Validates step payloads against the JSON-Schema subset workflows use to
//! describe structured output: `type` (single or list), `required`,
//! `properties`, `additionalProperties: false`, `items`, `enum`,
//! `minLength`/`maxLength`, `minimum`/`maximum` and `minItems`/`maxItems`.
//! Unknown keywords are ignored.

use std::fmt;

use serde_json::{Map, Value};

/// A single validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// JSON-pointer-like location (`$`, `$.items[2].name`).
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every violation found in one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaError {
    pub violations: Vec<Violation>,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
        write!(f, "schema validation failed: {}", joined.join("; "))
    }
}

impl std::error::Error for SchemaError {}

impl SchemaError {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            violations: vec![Violation {
                path: path.into(),
                message: message.into(),
            }],
        }
    }
}

/// Validates `value` against `schema`.
pub fn validate(value: &Value, schema: &Value) -> Result<(), SchemaError> {
    let mut violations = Vec::new();
    check(value, schema, "$", &mut violations);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(SchemaError { violations })
    }
}

/// The declared top-level `type`, when it is a single string.
pub fn declared_type(schema: &Value) -> Option<&str> {
    schema.get("type").and_then(Value::as_str)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false),
            _ => false,
        },
        other => type_name(value) == other,
    }
}

fn push(violations: &mut Vec<Violation>, path: &str, message: String) {
    violations.push(Violation {
        path: path.to_string(),
        message,
    });
}

fn check(value: &Value, schema: &Value, path: &str, violations: &mut Vec<Violation>) {
    let Some(schema) = schema.as_object() else {
        // `true`/`{}` style schemas accept anything.
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(value, t)) {
            push(
                violations,
                path,
                format!("expected {}, found {}", allowed.join(" or "), type_name(value)),
            );
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            push(violations, path, format!("value {} is not one of {}", value, Value::Array(options.clone())));
        }
    }

    match value {
        Value::Object(map) => check_object(map, schema, path, violations),
        Value::Array(items) => check_array(items, schema, path, violations),
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    push(violations, path, format!("string shorter than {} characters", min));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    push(violations, path, format!("string longer than {} characters", max));
                }
            }
        }
        Value::Number(n) => {
            let Some(n) = n.as_f64() else { return };
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    push(violations, path, format!("{} is less than minimum {}", n, min));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    push(violations, path, format!("{} is greater than maximum {}", n, max));
                }
            }
        }
        _ => {}
    }
}

fn check_object(map: &Map<String, Value>, schema: &Map<String, Value>, path: &str, violations: &mut Vec<Violation>) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(key) {
                push(violations, path, format!("missing required property '{}'", key));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, sub_schema) in properties {
            if let Some(item) = map.get(key) {
                check(item, sub_schema, &format!("{}.{}", path, key), violations);
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        for key in map.keys() {
            if !properties.map(|p| p.contains_key(key)).unwrap_or(false) {
                push(violations, path, format!("unexpected property '{}'", key));
            }
        }
    }
}

fn check_array(items: &[Value], schema: &Map<String, Value>, path: &str, violations: &mut Vec<Violation>) {
    let len = items.len() as u64;
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if len < min {
            push(violations, path, format!("expected at least {} items, found {}", min, len));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if len > max {
            push(violations, path, format!("expected at most {} items, found {}", max, len));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            check(item, item_schema, &format!("{}[{}]", path, i), violations);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review_schema() -> Value {
        json!({
            "type": "object",
            "required": ["score", "verdict"],
            "properties": {
                "score": {"type": "number", "minimum": 0, "maximum": 10},
                "verdict": {"type": "string", "enum": ["accept", "reject"]},
                "notes": {"type": "array", "items": {"type": "string"}, "maxItems": 3}
            }
        })
    }

    #[test]
    fn test_valid_payload() {
        let value = json!({"score": 7.5, "verdict": "accept", "notes": ["tight", "clear"]});
        assert!(validate(&value, &review_schema()).is_ok());
    }

    #[test]
    fn test_missing_required_and_wrong_enum() {
        let value = json!({"verdict": "maybe"});
        let err = validate(&value, &review_schema()).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.to_string().contains("missing required property 'score'"));
        assert!(err.violations.iter().any(|v| v.path == "$.verdict"));
    }

    #[test]
    fn test_type_mismatch_stops_descent() {
        let err = validate(&json!("text"), &review_schema()).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].message, "expected object, found string");
    }

    #[test]
    fn test_nested_item_paths() {
        let value = json!({"score": 11, "verdict": "accept", "notes": ["ok", 3]});
        let err = validate(&value, &review_schema()).unwrap_err();
        let paths: Vec<&str> = err.violations.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"$.score"));
        assert!(paths.contains(&"$.notes[1]"));
    }

    #[test]
    fn test_additional_properties_false() {
        let schema = json!({"type": "object", "properties": {"a": {}}, "additionalProperties": false});
        assert!(validate(&json!({"a": 1}), &schema).is_ok());
        assert!(validate(&json!({"a": 1, "b": 2}), &schema).is_err());
    }

    #[test]
    fn test_integer_and_union_types() {
        assert!(validate(&json!(3), &json!({"type": "integer"})).is_ok());
        assert!(validate(&json!(3.5), &json!({"type": "integer"})).is_err());
        assert!(validate(&json!(null), &json!({"type": ["string", "null"]})).is_ok());
    }

    #[test]
    fn test_string_length() {
        let schema = json!({"type": "string", "minLength": 2, "maxLength": 4});
        assert!(validate(&json!("abc"), &schema).is_ok());
        assert!(validate(&json!("a"), &schema).is_err());
        assert!(validate(&json!("abcde"), &schema).is_err());
    }
}
