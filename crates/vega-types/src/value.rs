//! Runtime typing for script values.
//!
//! The interpreter keeps a recorded type next to every variable and
//! refuses assignments that would change it. [`determine_type`] is the
//! single source of truth for classifying a JSON value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime type of a script variable.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use vega_types::{determine_type, VariableType};
///
/// assert_eq!(determine_type(&json!(123)), VariableType::Number);
/// assert_eq!(determine_type(&json!("test")), VariableType::String);
/// assert_eq!(determine_type(&json!(true)), VariableType::Boolean);
/// assert_eq!(determine_type(&json!({"key": "value"})), VariableType::Json);
/// assert_eq!(determine_type(&json!(null)), VariableType::Unknown);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    /// Integer or floating-point number.
    Number,
    /// Text.
    String,
    /// `true` / `false`.
    Boolean,
    /// Structured JSON (object or array).
    Json,
    /// Null or otherwise unclassifiable.
    Unknown,
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Number => "number",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Classifies a JSON value into a [`VariableType`].
#[must_use]
pub fn determine_type(value: &Value) -> VariableType {
    match value {
        Value::Number(_) => VariableType::Number,
        Value::String(_) => VariableType::String,
        Value::Bool(_) => VariableType::Boolean,
        Value::Object(_) | Value::Array(_) => VariableType::Json,
        Value::Null => VariableType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification() {
        assert_eq!(determine_type(&json!(1.5)), VariableType::Number);
        assert_eq!(determine_type(&json!(-3)), VariableType::Number);
        assert_eq!(determine_type(&json!("")), VariableType::String);
        assert_eq!(determine_type(&json!(false)), VariableType::Boolean);
        assert_eq!(determine_type(&json!([1, 2])), VariableType::Json);
        assert_eq!(determine_type(&json!({})), VariableType::Json);
        assert_eq!(determine_type(&Value::Null), VariableType::Unknown);
    }

    #[test]
    fn display_names() {
        assert_eq!(VariableType::Number.to_string(), "number");
        assert_eq!(VariableType::Json.to_string(), "json");
    }

    #[test]
    fn serde_round_trip() {
        let ty: VariableType =
            serde_json::from_str("\"boolean\"").expect("type name should parse");
        assert_eq!(ty, VariableType::Boolean);
        assert_eq!(
            serde_json::to_string(&VariableType::Number).expect("should serialize"),
            "\"number\""
        );
    }
}
