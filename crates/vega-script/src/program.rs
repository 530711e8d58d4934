//! Parsed script programs.
//!
//! A script is either a bare JSON array of steps or an object
//! `{ "header": {...}, "steps": [...] }`. Labels are string-valued
//! `label` fields on any step; the top-level label index is built at
//! load time and refreshed whenever the script is reloaded.

use crate::ScriptError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Optional script metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptHeader {
    /// Human-readable script name.
    #[serde(default)]
    pub name: Option<String>,
    /// Version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Author attribution.
    #[serde(default)]
    pub author: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// When set, importing this script executes it immediately.
    #[serde(default)]
    pub auto_execute: bool,
}

/// A loaded script: header, steps and the top-level label index.
#[derive(Debug, Clone)]
pub struct Script {
    /// Parsed header, when present.
    pub header: Option<ScriptHeader>,
    /// Ordered steps.
    pub steps: Vec<Value>,
    labels: HashMap<String, usize>,
    source: Value,
}

impl Script {
    /// Parses a script from its JSON form.
    ///
    /// # Errors
    ///
    /// Fails when the JSON is neither a step array nor a
    /// `{header?, steps}` object, or when a step is not an object.
    pub fn parse(source: Value) -> Result<Self, ScriptError> {
        let (header, steps) = match &source {
            Value::Array(steps) => (None, steps.clone()),
            Value::Object(obj) => {
                let header = match obj.get("header") {
                    Some(h) => Some(
                        serde_json::from_value::<ScriptHeader>(h.clone())
                            .map_err(|e| ScriptError::InvalidScript(format!("bad header: {e}")))?,
                    ),
                    None => None,
                };
                let steps = obj
                    .get("steps")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        ScriptError::InvalidScript("missing 'steps' array".to_string())
                    })?
                    .clone();
                (header, steps)
            }
            _ => {
                return Err(ScriptError::InvalidScript(
                    "script must be a step array or {header, steps}".to_string(),
                ))
            }
        };

        for (index, step) in steps.iter().enumerate() {
            if !step.is_object() {
                return Err(ScriptError::InvalidScript(format!(
                    "step {index} is not an object"
                )));
            }
        }

        let labels = index_labels(&steps);
        Ok(Self {
            header,
            steps,
            labels,
            source,
        })
    }

    /// Index of the top-level step carrying `label`.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// The script's original JSON.
    #[must_use]
    pub fn source(&self) -> &Value {
        &self.source
    }

    /// Whether the header requests execution at import time.
    #[must_use]
    pub fn auto_execute(&self) -> bool {
        self.header.as_ref().is_some_and(|h| h.auto_execute)
    }
}

/// Builds a label index over one step slice; the first occurrence of a
/// label wins.
#[must_use]
pub fn index_labels(steps: &[Value]) -> HashMap<String, usize> {
    let mut labels = HashMap::new();
    for (index, step) in steps.iter().enumerate() {
        if let Some(label) = step.get("label").and_then(Value::as_str) {
            labels.entry(label.to_string()).or_insert(index);
        }
    }
    labels
}
