//! Result Store
//!
//! Per-run map of step name to [`StepResult`], kept in insertion order.
//! Every value passes through [`normalize`] and the text limit before it is
//! stored, and [`ResultStore::store_with_schema`] only writes when the
//! payload validates.
//!
//! # Example
//!
//! ```
//! use flowrunner::store::{PromptFormat, PromptOptions, ResultStore};
//! use serde_json::json;
//!
//! let mut results = ResultStore::new();
//! results.store("fetch", json!({"success": true, "content": "hello", "meta": {"lang": "en"}}));
//!
//! assert_eq!(results.extract_field("fetch", "meta.lang"), Some(json!("en")));
//! assert_eq!(results.to_prompt_text("fetch", &PromptOptions::default()), Some("hello".to_string()));
//! # let _ = PromptFormat::Json;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::result::{normalize, StepResult, BOOKKEEPING_KEYS, DEFAULT_MAX_TEXT_BYTES};
use super::schema::{self, SchemaError};
use crate::workflow::condition::{Lookup, Resolver};

/// Keys tried, in order, when picking the meaningful part of a payload.
const PAYLOAD_KEYS: &[&str] = &["data", "content", "text", "response"];

/// How [`ResultStore::to_prompt_text`] renders a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFormat {
    #[default]
    Text,
    Json,
    Markdown,
}

/// Options for [`ResultStore::to_prompt_text`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOptions {
    #[serde(default)]
    pub format: PromptFormat,
    /// Dotted path inside the result to render instead of the whole payload.
    #[serde(default)]
    pub field: Option<String>,
}

/// Aggregate counts over the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_cost: f64,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreMetadata {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    max_text_bytes: usize,
}

/// Serialized form of the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    metadata: StoreMetadata,
    order: Vec<String>,
    results: BTreeMap<String, StepResult>,
}

/// Normalized, validated step outputs keyed by step name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "StoreDocument", from = "StoreDocument")]
pub struct ResultStore {
    entries: HashMap<String, StepResult>,
    order: Vec<String>,
    max_text_bytes: usize,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::with_text_limit(DEFAULT_MAX_TEXT_BYTES)
    }

    /// Creates a store that trims strings longer than `max_text_bytes`.
    pub fn with_text_limit(max_text_bytes: usize) -> Self {
        let now = Utc::now();
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            max_text_bytes,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn max_text_bytes(&self) -> usize {
        self.max_text_bytes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Normalizes `raw` and stores it under `name`, replacing any previous
    /// result for that name.
    pub fn store(&mut self, name: &str, raw: Value) -> &StepResult {
        self.insert(name, normalize(raw))
    }

    /// Stores an already-normalized result (after applying the text limit).
    pub fn insert(&mut self, name: &str, result: StepResult) -> &StepResult {
        let result = result.bounded(self.max_text_bytes);
        if !self.entries.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.updated_at = Utc::now();
        debug!(
            "Stored result for '{}' (success: {}, skipped: {})",
            name,
            result.is_success(),
            result.is_skipped()
        );
        self.entries.insert(name.to_string(), result);
        &self.entries[name]
    }

    /// Stores `raw` only if its meaningful payload satisfies `schema`.
    ///
    /// On failure the store is left exactly as it was.
    pub fn store_with_schema(
        &mut self,
        name: &str,
        raw: Value,
        schema: &Value,
    ) -> Result<&StepResult, SchemaError> {
        let result = normalize(raw);
        let payload = match &result {
            StepResult::Failure { reason } => {
                return Err(SchemaError::single(
                    "$",
                    format!("step failed before validation: {}", reason),
                ));
            }
            StepResult::Success { skip_reason: Some(_), .. } => {
                return Err(SchemaError::single("$", "skipped step has no payload to validate"));
            }
            StepResult::Success { payload, .. } => meaningful_payload(payload, schema),
        };

        if let Err(e) = schema::validate(&payload, schema) {
            warn!("Result for '{}' failed schema validation: {}", name, e);
            return Err(e);
        }

        Ok(self.insert(name, result))
    }

    pub fn get(&self, name: &str) -> Option<&StepResult> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<StepResult> {
        let removed = self.entries.remove(name);
        if removed.is_some() {
            self.order.retain(|n| n != name);
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Reads a dotted field path (`"a.b.0.c"`) out of a stored result.
    pub fn extract_field(&self, name: &str, field: &str) -> Option<Value> {
        let path: Vec<&str> = field.split('.').filter(|s| !s.is_empty()).collect();
        self.get(name)?.lookup(&path)
    }

    /// Renders a stored result for inclusion in a prompt.
    pub fn to_prompt_text(&self, name: &str, options: &PromptOptions) -> Option<String> {
        let result = self.get(name)?;
        let value = match &options.field {
            Some(field) => self.extract_field(name, field)?,
            None => match result.payload() {
                Some(payload) if !result.is_skipped() => payload.clone(),
                _ => return Some(result.text()),
            },
        };

        let text = match options.format {
            PromptFormat::Text => match &value {
                Value::String(s) => s.clone(),
                _ if options.field.is_none() => result.text(),
                other => serde_json::to_string_pretty(other).unwrap_or_default(),
            },
            PromptFormat::Json => serde_json::to_string_pretty(&value).unwrap_or_default(),
            PromptFormat::Markdown => {
                let body = match &value {
                    Value::String(s) => s.clone(),
                    other => format!(
                        "```json\n{}\n```",
                        serde_json::to_string_pretty(other).unwrap_or_default()
                    ),
                };
                format!("## {}\n\n{}", name, body)
            }
        };
        Some(text)
    }

    pub fn summary(&self) -> ResultSummary {
        let mut summary = ResultSummary {
            total: self.entries.len(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            total_cost: 0.0,
            steps: self.order.clone(),
        };
        for result in self.entries.values() {
            match result {
                StepResult::Failure { .. } => summary.failed += 1,
                r if r.is_skipped() => summary.skipped += 1,
                _ => summary.succeeded += 1,
            }
            summary.total_cost += result.cost();
        }
        summary
    }

    /// Step names in insertion order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates results in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StepResult)> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name).map(|r| (name.as_str(), r)))
    }

    /// Template context: each executed step's payload under its name, plus
    /// a `steps` map of canonical documents.
    pub fn template_context(&self) -> Map<String, Value> {
        let mut context = Map::new();
        let mut steps = Map::new();
        for (name, result) in self.iter() {
            let exposed = match result {
                StepResult::Success { payload, skip_reason: None, .. } => match payload {
                    Value::Object(_) => {
                        let mut merged = payload.clone();
                        if let Value::Object(map) = &mut merged {
                            map.entry("success").or_insert(Value::Bool(true));
                        }
                        merged
                    }
                    other => other.clone(),
                },
                other => other.to_value(),
            };
            context.insert(name.to_string(), exposed);
            steps.insert(name.to_string(), result.to_value());
        }
        context.insert("steps".to_string(), Value::Object(steps));
        context
    }

    /// Writes the store as one JSON document.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
    }

    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Equality compares contents and order, not timestamps.
impl PartialEq for ResultStore {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.entries == other.entries
    }
}

impl From<ResultStore> for StoreDocument {
    fn from(store: ResultStore) -> Self {
        Self {
            metadata: StoreMetadata {
                created_at: store.created_at,
                updated_at: store.updated_at,
                max_text_bytes: store.max_text_bytes,
            },
            order: store.order,
            results: store.entries.into_iter().collect(),
        }
    }
}

impl From<StoreDocument> for ResultStore {
    fn from(doc: StoreDocument) -> Self {
        let mut order: Vec<String> = doc
            .order
            .into_iter()
            .filter(|name| doc.results.contains_key(name))
            .collect();
        for name in doc.results.keys() {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        Self {
            entries: doc.results.into_iter().collect(),
            order,
            max_text_bytes: doc.metadata.max_text_bytes,
            created_at: doc.metadata.created_at,
            updated_at: doc.metadata.updated_at,
        }
    }
}

impl Resolver for ResultStore {
    fn resolve(&self, path: &[String]) -> Lookup {
        let Some((root, rest)) = path.split_first() else {
            return Lookup::MissingRoot;
        };
        match self.get(root) {
            None => Lookup::MissingRoot,
            Some(result) => match result.lookup(rest) {
                Some(value) => Lookup::Found(value),
                None => Lookup::MissingField,
            },
        }
    }
}

/// Picks the part of a payload a schema describes: the first of
/// `data`/`content`/`text`/`response` that is present, else the payload
/// minus bookkeeping keys. A JSON string is parsed when the schema expects
/// an object or array.
fn meaningful_payload(payload: &Value, schema: &Value) -> Value {
    let picked = match payload {
        Value::Object(map) => PAYLOAD_KEYS
            .iter()
            .find_map(|k| map.get(*k).cloned())
            .unwrap_or_else(|| {
                let mut rest = map.clone();
                for key in BOOKKEEPING_KEYS {
                    rest.remove(*key);
                }
                Value::Object(rest)
            }),
        other => other.clone(),
    };

    match (&picked, schema::declared_type(schema)) {
        (Value::String(s), Some("object" | "array")) => serde_json::from_str(s).unwrap_or(picked),
        _ => picked,
    }
}

/// Canonical document for a result, used in output files.
pub fn result_document(name: &str, result: &StepResult) -> Value {
    let mut doc = result.to_value();
    if let Value::Object(map) = &mut doc {
        map.insert("step".to_string(), json!(name));
    }
    doc
}
