//! Runtime values exchanged with the data store and produced by bindings.
//!
//! `Value` is the one payload type that flows everywhere: store reads,
//! binding slots, script locals, transform inputs and notification pushes.
//! JSON conversion is explicit (`to_json`/`from_json`) so the on-wire shape
//! stays stable; entity references serialize as `{"$ref": "<entity id>"}`.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Payload carried by binding slots, store fields and script evaluation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(Arc<str>),
    /// Reference to another entity; what indirection hops resolve through.
    Reference(Arc<str>),
    List(Vec<Value>),
    Object(IndexMap<Arc<str>, Value>),
}

impl Value {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Value::Text(text.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness used by script conditionals.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(t) => !t.is_empty(),
            Value::Reference(_) => true,
            Value::List(items) => !items.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Arc<str>> {
        match self {
            Value::Reference(id) => Some(id),
            _ => None,
        }
    }

    /// Convert to display string for text concatenation and formatting.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Text(t) => t.to_string(),
            Value::Reference(id) => id.to_string(),
            Value::List(_) => "[list]".to_string(),
            Value::Object(_) => "{object}".to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Null => json!(null),
            Value::Bool(b) => json!(b),
            Value::Number(n) => json!(n),
            Value::Text(t) => json!(t.as_ref()),
            Value::Reference(id) => json!({ "$ref": id.as_ref() }),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::text(s.as_str()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => {
                if fields.len() == 1 {
                    if let Some(serde_json::Value::String(id)) = fields.get("$ref") {
                        return Value::Reference(Arc::from(id.as_str()));
                    }
                }
                Value::Object(
                    fields
                        .iter()
                        .map(|(name, value)| (Arc::from(name.as_str()), Value::from_json(value)))
                        .collect(),
                )
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

/// Parse an expression as a self-contained literal: numbers, quoted text,
/// `true`/`false`/`null`. Anything else is not a literal (and a binding
/// expression that fails this check defaults to field mode).
pub fn parse_literal(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    match trimmed {
        "" => return None,
        "null" => return Some(Value::Null),
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Some(quoted) = trimmed
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .or_else(|| {
            trimmed
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
        })
    {
        return Some(Value::text(quoted));
    }
    // Reject alphabetic words that f64::from_str would accept ("inf", "NaN").
    if trimmed
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+' || c == '.')
    {
        if let Ok(number) = trimmed.parse::<f64>() {
            if number.is_finite() {
                return Some(Value::Number(number));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_parsing() {
        assert_eq!(parse_literal("42"), Some(Value::Number(42.0)));
        assert_eq!(parse_literal(" -3.5 "), Some(Value::Number(-3.5)));
        assert_eq!(parse_literal("'on'"), Some(Value::text("on")));
        assert_eq!(parse_literal("\"off\""), Some(Value::text("off")));
        assert_eq!(parse_literal("true"), Some(Value::Bool(true)));
        assert_eq!(parse_literal("null"), Some(Value::Null));
        assert_eq!(parse_literal("Temperature"), None);
        assert_eq!(parse_literal("inf"), None);
        assert_eq!(parse_literal("Tank->Level"), None);
    }

    #[test]
    fn reference_json_roundtrip() {
        let value = Value::Reference(Arc::from("Tank2"));
        let json = value.to_json();
        assert_eq!(Value::from_json(&json), value);
    }

    #[test]
    fn object_json_roundtrip() {
        let mut fields = IndexMap::new();
        fields.insert(Arc::from("level"), Value::Number(7.0));
        fields.insert(Arc::from("label"), Value::text("Tank A"));
        let value = Value::Object(fields);
        assert_eq!(Value::from_json(&value.to_json()), value);
    }
}
