//! Free-form rule options.
//!
//! Every rule carries an `options` object that is handed to its action
//! untouched. The engine only ever compares options for equality (to decide
//! whether a cached rule still describes the same work).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A JSON-like option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    /// Name of the variant, for option errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(b) = self { Some(*b) } else { None }
    }

    pub fn as_i64(&self) -> Option<i64> {
        if let Value::Int(n) = self { Some(*n) } else { None }
    }

    /// Integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(n) => Some(n),
            Value::Int(n) => Some(n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = self { Some(s) } else { None }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from!(bool => Bool, i64 => Int, f64 => Float, String => String, &str => String);

/// The options object of a rule.
///
/// Equality ignores key order, so a rule re-read from the cache compares
/// equal to the one parsed from its rule file.
pub type Options = IndexMap<String, Value>;

/// Extension trait for building and reading Options ergonomically.
pub trait OptionsExt {
    fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self;

    /// String option, if present and a string.
    fn str_option(&self, key: &str) -> Option<&str>;

    /// Boolean option, falling back to `default` when absent or mistyped.
    fn bool_option(&self, key: &str, default: bool) -> bool;
}

impl OptionsExt for Options {
    fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key.into(), value.into());
        self
    }

    fn str_option(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn bool_option(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}
