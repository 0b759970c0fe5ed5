//! Variable State Codec
//!
//! Step handlers may leave behind variables that are not plain JSON: raw
//! bytes read from a file or paths into the workspace. The codec turns the
//! variable map into a tagged JSON document for checkpoints and back.
//!
//! ```json
//! {
//!   "topic": {"kind": "value", "value": "rust"},
//!   "logo":  {"kind": "bytes", "base64": "iVBORw0KGgo="},
//!   "draft": {"kind": "path", "path": "workspace/draft.md"}
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A runtime variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Value(Value),
    Bytes(Vec<u8>),
    Path(PathBuf),
}

impl Variable {
    /// View used in templates and conditions: bytes become their length
    /// and a lossy preview, paths become strings.
    pub fn to_template_value(&self) -> Value {
        match self {
            Variable::Value(v) => v.clone(),
            Variable::Bytes(bytes) => serde_json::json!({
                "len": bytes.len(),
                "text": String::from_utf8_lossy(bytes),
            }),
            Variable::Path(path) => Value::String(path.display().to_string()),
        }
    }
}

impl From<Value> for Variable {
    fn from(value: Value) -> Self {
        Variable::Value(value)
    }
}

/// Named variables, ordered for stable checkpoints.
pub type Variables = BTreeMap<String, Variable>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("variable state must be an object, found {0}")]
    NotAnObject(String),

    #[error("variable '{name}' is malformed: {message}")]
    Malformed { name: String, message: String },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Encoded {
    Value { value: Value },
    Bytes { base64: String },
    Path { path: PathBuf },
}

/// Encodes variables into a JSON document.
pub fn encode_variables(variables: &Variables) -> Value {
    let mut doc = Map::new();
    for (name, variable) in variables {
        let encoded = match variable {
            Variable::Value(value) => Encoded::Value { value: value.clone() },
            Variable::Bytes(bytes) => Encoded::Bytes {
                base64: STANDARD.encode(bytes),
            },
            Variable::Path(path) => Encoded::Path { path: path.clone() },
        };
        // Encoded only holds JSON-representable data.
        if let Ok(value) = serde_json::to_value(encoded) {
            doc.insert(name.clone(), value);
        }
    }
    Value::Object(doc)
}

/// Decodes a document produced by [`encode_variables`]. `null` decodes to
/// an empty map.
pub fn decode_variables(doc: &Value) -> Result<Variables, CodecError> {
    let map = match doc {
        Value::Null => return Ok(Variables::new()),
        Value::Object(map) => map,
        other => return Err(CodecError::NotAnObject(other.to_string())),
    };

    let mut variables = Variables::new();
    for (name, raw) in map {
        let malformed = |message: String| CodecError::Malformed {
            name: name.clone(),
            message,
        };
        let encoded: Encoded = serde_json::from_value(raw.clone()).map_err(|e| malformed(e.to_string()))?;
        let variable = match encoded {
            Encoded::Value { value } => Variable::Value(value),
            Encoded::Bytes { base64 } => {
                Variable::Bytes(STANDARD.decode(base64).map_err(|e| malformed(e.to_string()))?)
            }
            Encoded::Path { path } => Variable::Path(path),
        };
        variables.insert(name.clone(), variable);
    }
    Ok(variables)
}

/// Template view of all variables.
pub fn template_view(variables: &Variables) -> Value {
    Value::Object(
        variables
            .iter()
            .map(|(k, v)| (k.clone(), v.to_template_value()))
            .collect(),
    )
}
