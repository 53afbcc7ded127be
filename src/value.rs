//! Generic value model and call arguments
//!
//! Values crossing the wire are plain JSON: numbers, strings, booleans,
//! ordered sequences, string-keyed mappings and null. An argument is either a
//! literal value or a back-reference to a result bound earlier in the same
//! scope (see [`crate::store::ValueStore`]).

use serde::{Deserialize, Serialize};

/// A value exchanged with remote agents
pub type Value = serde_json::Value;

/// String-keyed mapping of values (keyword arguments)
pub type Map = serde_json::Map<String, Value>;

/// Prefix marking a back-reference in user-facing text input
pub const REFERENCE_MARKER: char = '$';

/// One argument of a remote call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    /// Sent as-is
    Literal(Value),
    /// Replaced by the value bound under this name before sending
    Reference(String),
}

impl Arg {
    /// Literal argument
    pub fn literal(value: impl Into<Value>) -> Self {
        Arg::Literal(value.into())
    }

    /// Back-reference argument
    pub fn reference(name: impl Into<String>) -> Self {
        Arg::Reference(name.into())
    }

    /// Interpret user-facing text: `$name` is a back-reference, anything else
    /// a literal string.
    ///
    /// Only call this where the `$` convention is wanted (e.g. CLI input);
    /// string literals passed through `Arg::literal` are never reinterpreted.
    pub fn from_marker(text: &str) -> Self {
        match text.strip_prefix(REFERENCE_MARKER) {
            Some(name) if !name.is_empty() => Arg::Reference(name.to_string()),
            _ => Arg::Literal(Value::String(text.to_string())),
        }
    }

    /// Name of the referenced binding, if this is a back-reference
    pub fn reference_name(&self) -> Option<&str> {
        match self {
            Arg::Reference(name) => Some(name),
            Arg::Literal(_) => None,
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Literal(value)
    }
}

macro_rules! impl_literal_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Arg {
                fn from(value: $t) -> Self {
                    Arg::Literal(Value::from(value))
                }
            }
        )*
    };
}

impl_literal_from!(bool, i32, i64, u32, u64, f64, String, &str);

impl<T: Into<Value>> From<Vec<T>> for Arg {
    fn from(values: Vec<T>) -> Self {
        Arg::Literal(Value::Array(values.into_iter().map(Into::into).collect()))
    }
}

/// Wrap literal values as arguments
pub fn literals<I, T>(values: I) -> Vec<Arg>
where
    I: IntoIterator<Item = T>,
    T: Into<Value>,
{
    values.into_iter().map(|v| Arg::Literal(v.into())).collect()
}
