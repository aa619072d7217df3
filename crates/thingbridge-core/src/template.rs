//! Topic and payload templates.
//!
//! Templates are plain strings with `{{ .Path.To.Field }}` actions. Actions
//! are resolved against a [`TemplateContext`], a JSON object built from the
//! thing, the property and any extra bindings a caller adds (`value`,
//! `current`, ...).
//!
//! Field lookup tries the exact key first and then an ASCII case-insensitive
//! match, so `{{.Thing.ID}}` and `{{.thing.id}}` both address the `id` member
//! of a serialized thing. A reference to a field that does not exist is an
//! error; it never renders as an empty string.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Bindings a template is rendered against.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    root: Map<String, Value>,
}

impl TemplateContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` under `key`, replacing any previous binding.
    pub fn bind(&mut self, key: impl Into<String>, value: Value) {
        self.root.insert(key.into(), value);
    }

    /// Builder form of [`bind`](Self::bind).
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.bind(key, value);
        self
    }

    /// Render `template` against this context.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open.find(CLOSE).ok_or_else(|| {
                Error::Templating(format!("unclosed action in template '{}'", template))
            })?;

            let action = after_open[..end].trim();
            let value = self.resolve(action, template)?;
            push_value(&mut out, value);

            rest = &after_open[end + CLOSE.len()..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, action: &str, template: &str) -> Result<&Value> {
        let path = action.strip_prefix('.').ok_or_else(|| {
            Error::Templating(format!(
                "unsupported action '{}' in template '{}'",
                action, template
            ))
        })?;

        if path.is_empty() {
            return Err(Error::Templating(format!(
                "empty field reference in template '{}'",
                template
            )));
        }

        let mut segments = path.split('.');
        // the first segment is never empty here
        let first = segments.next().unwrap_or_default();
        let mut current = lookup(&self.root, first)
            .ok_or_else(|| unknown_field(action, template))?;

        for segment in segments {
            if segment.is_empty() || segment.contains(char::is_whitespace) {
                return Err(Error::Templating(format!(
                    "malformed field reference '{}' in template '{}'",
                    action, template
                )));
            }

            current = match current {
                Value::Object(map) => {
                    lookup(map, segment).ok_or_else(|| unknown_field(action, template))?
                }
                other => {
                    return Err(Error::Templating(format!(
                        "can't evaluate field {} in {} value (action '{}')",
                        segment,
                        kind_of(other),
                        action
                    )))
                }
            };
        }

        Ok(current)
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn unknown_field(action: &str, template: &str) -> Error {
    Error::Templating(format!(
        "unknown field reference '{}' in template '{}'",
        action, template
    ))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}
