//! Canonical Step Results
//!
//! Handlers return whatever shape is natural to them: a bare string, an
//! object with a `success` flag, an object wrapping `data`. [`normalize`]
//! converts all of them into one [`StepResult`] at the store boundary so
//! nothing downstream branches on representation.
//!
//! On disk (and in checkpoints) a result is an object that always carries
//! `success`:
//!
//! ```json
//! {"success": true, "data": {"content": "..."}, "cost": 0.002}
//! {"success": true, "skipped": true, "skip_reason": "condition 'a.ok' evaluated to false"}
//! {"success": false, "error": "model timed out"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::condition::lookup_path;

/// Default byte limit for any single string inside a stored payload.
pub const DEFAULT_MAX_TEXT_BYTES: usize = 100_000;

/// Keys that describe a result rather than belong to its payload.
pub const BOOKKEEPING_KEYS: &[&str] = &["success", "skipped", "skip_reason", "error", "cost"];

/// The outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ResultDocument", from = "ResultDocument")]
pub enum StepResult {
    Success {
        payload: Value,
        cost: f64,
        /// Set when the step did not run because its condition was false.
        skip_reason: Option<String>,
    },
    Failure {
        reason: String,
    },
}

impl StepResult {
    pub fn success(payload: Value) -> Self {
        Self::Success {
            payload,
            cost: 0.0,
            skip_reason: None,
        }
    }

    pub fn success_with_cost(payload: Value, cost: f64) -> Self {
        Self::Success {
            payload,
            cost,
            skip_reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Success {
            payload: Value::Null,
            cost: 0.0,
            skip_reason: Some(reason.into()),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Success { skip_reason: Some(_), .. })
    }

    /// The payload of a successful, executed step.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Success { payload, .. } => Some(payload),
            Self::Failure { .. } => None,
        }
    }

    pub fn cost(&self) -> f64 {
        match self {
            Self::Success { cost, .. } => *cost,
            Self::Failure { .. } => 0.0,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Failure { reason } => Some(reason),
            Self::Success { .. } => None,
        }
    }

    /// Resolves a dotted field path against this result.
    ///
    /// Bookkeeping fields (`success`, `skipped`, `skip_reason`, `error`,
    /// `cost`) are answered first, then the payload is walked. `data` is an
    /// alias for the payload itself so `step.data.x` and `step.x` agree.
    /// A skipped step has no payload fields.
    pub fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Option<Value> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self.to_value());
        };
        let first = first.as_ref();

        let bookkeeping = match (first, self) {
            ("success", _) => Some(Value::Bool(self.is_success())),
            ("skipped", _) => Some(Value::Bool(self.is_skipped())),
            ("skip_reason", Self::Success { skip_reason, .. }) => {
                Some(skip_reason.clone().map(Value::String).unwrap_or(Value::Null))
            }
            ("error", Self::Failure { reason }) => Some(Value::String(reason.clone())),
            ("cost", _) => serde_json::Number::from_f64(self.cost()).map(Value::Number),
            _ => None,
        };
        if let Some(value) = bookkeeping {
            return if rest.is_empty() { Some(value) } else { None };
        }

        let payload = match self {
            Self::Success { skip_reason: Some(_), .. } | Self::Failure { .. } => return None,
            Self::Success { payload, .. } => payload,
        };

        if let Some(found) = lookup_path(payload, path) {
            return Some(found.clone());
        }
        if first == "data" {
            return lookup_path(payload, rest).cloned();
        }
        None
    }

    /// The canonical document form.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(ResultDocument::from(self.clone())).unwrap_or(Value::Null)
    }

    /// Text suitable for embedding in a prompt: strings verbatim, a
    /// `content`/`text`/`response` field when present, otherwise JSON.
    pub fn text(&self) -> String {
        match self {
            Self::Failure { reason } => format!("[failed: {}]", reason),
            Self::Success { skip_reason: Some(reason), .. } => format!("[skipped: {}]", reason),
            Self::Success { payload, .. } => payload_text(payload),
        }
    }

    /// Applies the text limit to every string in the payload.
    pub fn bounded(self, max_bytes: usize) -> Self {
        match self {
            Self::Success {
                payload,
                cost,
                skip_reason,
            } => Self::Success {
                payload: truncate_strings(payload, max_bytes),
                cost,
                skip_reason,
            },
            failure => failure,
        }
    }
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => ["content", "text", "response"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| serde_json::to_string_pretty(payload).unwrap_or_default()),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

/// Serialized shape of a [`StepResult`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ResultDocument {
    success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    cost: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

impl From<StepResult> for ResultDocument {
    fn from(result: StepResult) -> Self {
        match result {
            StepResult::Success {
                payload,
                cost,
                skip_reason,
            } => Self {
                success: true,
                data: payload,
                cost,
                skipped: skip_reason.is_some(),
                skip_reason,
                error: None,
            },
            StepResult::Failure { reason } => Self {
                success: false,
                error: Some(reason),
                ..Self::default()
            },
        }
    }
}

impl From<ResultDocument> for StepResult {
    fn from(doc: ResultDocument) -> Self {
        if !doc.success {
            return StepResult::Failure {
                reason: doc.error.unwrap_or_else(|| "unknown error".to_string()),
            };
        }
        let skip_reason = match (doc.skipped, doc.skip_reason) {
            (_, Some(reason)) => Some(reason),
            (true, None) => Some("skipped".to_string()),
            (false, None) => None,
        };
        StepResult::Success {
            payload: doc.data,
            cost: doc.cost,
            skip_reason,
        }
    }
}

/// Converts any raw handler output into a [`StepResult`].
///
/// - An object whose `success` is a boolean is treated as already shaped:
///   `success: false` becomes a failure (reason from `error`, `reason` or
///   `message`); otherwise `cost` and `skipped`/`skip_reason` are lifted
///   out and the rest becomes the payload, unwrapping a lone `data` key.
/// - Anything else (strings, arrays, numbers, objects without a flag) is
///   a successful payload as-is.
pub fn normalize(raw: Value) -> StepResult {
    let mut map = match raw {
        Value::Object(map) if matches!(map.get("success"), Some(Value::Bool(_))) => map,
        other => return StepResult::success(other),
    };

    if map.get("success") == Some(&Value::Bool(false)) {
        let reason = ["error", "reason", "message"]
            .iter()
            .find_map(|k| map.get(*k))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "step reported failure".to_string());
        return StepResult::failure(reason);
    }

    let cost = map.get("cost").and_then(Value::as_f64).unwrap_or(0.0);
    let skipped = map.get("skipped").and_then(Value::as_bool).unwrap_or(false);
    let skip_reason = map
        .get("skip_reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| skipped.then(|| "skipped".to_string()));
    for key in BOOKKEEPING_KEYS {
        map.remove(*key);
    }

    let payload = if map.len() == 1 && map.contains_key("data") {
        map.remove("data").unwrap_or(Value::Null)
    } else if map.is_empty() {
        Value::Null
    } else {
        Value::Object(map)
    };

    StepResult::Success {
        payload: if skip_reason.is_some() { Value::Null } else { payload },
        cost,
        skip_reason,
    }
}

/// Truncates a single string to `max_bytes`, appending a marker that
/// records the original size. Cuts on a UTF-8 boundary.
pub fn truncate_text(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let total = text.len();
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = text;
    truncated.truncate(cut);
    truncated.push_str(&format!("...[TRIMMED: {} bytes total]", total));
    truncated
}

/// Applies [`truncate_text`] to every string leaf in `value`.
pub fn truncate_strings(value: Value, max_bytes: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_text(s, max_bytes)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| truncate_strings(item, max_bytes))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, truncate_strings(v, max_bytes)))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_raw_string() {
        let result = normalize(json!("hello"));
        assert_eq!(result, StepResult::success(json!("hello")));
        assert_eq!(result.to_value(), json!({"success": true, "data": "hello"}));
    }

    #[test]
    fn test_normalize_shaped_success() {
        let result = normalize(json!({"success": true, "content": "hi", "cost": 0.5}));
        assert_eq!(result, StepResult::success_with_cost(json!({"content": "hi"}), 0.5));

        let wrapped = normalize(json!({"success": true, "data": [1, 2]}));
        assert_eq!(wrapped.payload(), Some(&json!([1, 2])));
    }

    #[test]
    fn test_normalize_failure() {
        let result = normalize(json!({"success": false, "error": "boom"}));
        assert_eq!(result, StepResult::failure("boom"));

        let result = normalize(json!({"success": false}));
        assert!(!result.is_success());
    }

    #[test]
    fn test_normalize_non_bool_success_is_payload() {
        let raw = json!({"success": "yes", "n": 1});
        assert_eq!(normalize(raw.clone()).payload(), Some(&raw));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for result in [
            StepResult::success_with_cost(json!({"a": 1}), 0.25),
            StepResult::skipped("condition 'x' evaluated to false"),
            StepResult::failure("nope"),
        ] {
            assert_eq!(normalize(result.to_value()), result);
        }
    }

    #[test]
    fn test_serde_document_shape() {
        let skipped = StepResult::skipped("because");
        let doc = serde_json::to_value(&skipped).unwrap();
        assert_eq!(doc, json!({"success": true, "skipped": true, "skip_reason": "because"}));

        let back: StepResult = serde_json::from_value(doc).unwrap();
        assert_eq!(back, skipped);
    }

    #[test]
    fn test_lookup_fields() {
        let result = StepResult::success(json!({"should_run": false, "items": [{"id": 7}]}));
        assert_eq!(result.lookup(&["success"]), Some(json!(true)));
        assert_eq!(result.lookup(&["should_run"]), Some(json!(false)));
        assert_eq!(result.lookup(&["items", "0", "id"]), Some(json!(7)));
        assert_eq!(result.lookup(&["data", "should_run"]), Some(json!(false)));
        assert_eq!(result.lookup(&["missing"]), None);
    }

    #[test]
    fn test_lookup_on_skipped_has_no_payload() {
        let result = StepResult::skipped("r");
        assert_eq!(result.lookup(&["skipped"]), Some(json!(true)));
        assert_eq!(result.lookup(&["anything"]), None);
    }

    #[test]
    fn test_truncate_exact_marker() {
        let text = "x".repeat(100_001);
        let out = truncate_text(text, DEFAULT_MAX_TEXT_BYTES);
        assert_eq!(out.len(), 100_000 + "...[TRIMMED: 100001 bytes total]".len());
        assert!(out.starts_with(&"x".repeat(100_000)));
        assert!(out.ends_with("...[TRIMMED: 100001 bytes total]"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let out = truncate_text("ééé".to_string(), 3);
        assert!(out.starts_with('é'));
        assert!(out.ends_with("[TRIMMED: 6 bytes total]"));
    }

    #[test]
    fn test_bounded_recurses() {
        let result = StepResult::success(json!({"a": ["long text", "ok"]})).bounded(4);
        assert_eq!(
            result.payload(),
            Some(&json!({"a": ["long...[TRIMMED: 9 bytes total]", "ok"]}))
        );
    }

    #[test]
    fn test_text_prefers_content() {
        assert_eq!(StepResult::success(json!({"content": "body", "x": 1})).text(), "body");
        assert_eq!(StepResult::success(json!("plain")).text(), "plain");
    }
}
