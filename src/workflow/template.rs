//! Prompt Templating
//!
//! Renders `{{ step.field }}`-style templates with minijinja. The context is
//! assembled by the caller (see `StepContext::template_context`); undefined
//! values render as empty strings.

use minijinja::{Environment, UndefinedBehavior, Value as TemplateValue};
use serde_json::Value;

/// Jinja-compatible renderer with a few workflow-oriented filters.
#[derive(Debug)]
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.add_filter("json", filter_json);
        env.add_filter("tojson", filter_json);
        env.add_filter("truncate_bytes", filter_truncate_bytes);
        Self { env }
    }

    /// Check if a string contains template syntax.
    pub fn is_template(s: &str) -> bool {
        s.contains("{{") || s.contains("{%")
    }

    /// Renders a template string against `context`.
    pub fn render(&self, template: &str, context: &Value) -> Result<String, minijinja::Error> {
        if !Self::is_template(template) {
            return Ok(template.to_string());
        }
        self.env.render_str(template, context)
    }

    /// Renders every string inside `value`, leaving other types untouched.
    pub fn render_value(&self, value: &Value, context: &Value) -> Result<Value, minijinja::Error> {
        match value {
            Value::String(s) => Ok(Value::String(self.render(s, context)?)),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    rendered.insert(key.clone(), self.render_value(item, context)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn filter_json(value: TemplateValue) -> Result<String, minijinja::Error> {
    serde_json::to_string(&value).map_err(|e| {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
    })
}

fn filter_truncate_bytes(value: String, limit: usize) -> String {
    if value.len() <= limit {
        return value;
    }
    let mut cut = limit;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value[..cut].to_string()
}
