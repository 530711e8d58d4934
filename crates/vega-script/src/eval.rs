//! Value evaluation: literals, variable references, structured
//! operators and `$variable` interpolation.
//!
//! `evaluate` is the single entry point the step machine uses for every
//! script-supplied value:
//!
//! - numbers and booleans evaluate to themselves;
//! - a string that names a variable evaluates to its value; a string
//!   starting with `$` or containing an operator character goes through
//!   the text-expression evaluator; anything else is a literal;
//! - objects may carry one structured operator (`$`, `$eq`, `$ne`,
//!   `$gt`, `$lt`, `$gte`, `$lte`, `$add`, `$sub`, `$mul`, `$div`,
//!   `$and`, `$or`, `$if`, `$call`); other objects and arrays are
//!   JSON literals.

use crate::expr::{evaluate_expression, number_value};
use crate::interpreter::InterpreterCore;
use crate::ScriptError;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use vega_types::determine_type;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Characters that mark a string as a text expression.
const OPERATOR_CHARS: &[char] = &['+', '-', '*', '/', '%', '^', '!', '&', '|', '<', '=', '>'];

impl InterpreterCore {
    /// Evaluates one script value. See the module docs for the rules.
    pub(crate) fn evaluate<'a>(
        self: &'a Arc<Self>,
        value: &'a Value,
    ) -> BoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async move {
            match value {
                Value::Number(_) | Value::Bool(_) | Value::Null => Ok(value.clone()),
                Value::String(text) => self.evaluate_text(text),
                Value::Object(obj) => {
                    if let Some(op) = obj.keys().find(|k| k.starts_with('$')) {
                        let op = op.clone();
                        self.evaluate_operator(&op, &obj[&op]).await
                    } else {
                        Ok(value.clone())
                    }
                }
                Value::Array(_) => Ok(value.clone()),
            }
        })
    }

    fn evaluate_text(&self, text: &str) -> Result<Value, ScriptError> {
        if let Some(existing) = self.resolve_variable(text) {
            return Ok(existing);
        }
        if let Some(name) = text.strip_prefix('$') {
            if is_identifier(name) {
                return self
                    .resolve_variable(name)
                    .ok_or_else(|| ScriptError::VariableNotFound(name.to_string()));
            }
        }
        if text.starts_with('$') || text.contains(OPERATOR_CHARS) {
            let variables = self.variables.read();
            let resolve = |name: &str| variables.get(name).map(|v| v.value.clone());
            return evaluate_expression(text, &resolve);
        }
        Ok(Value::String(text.to_string()))
    }

    fn resolve_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).map(|v| v.value.clone())
    }

    async fn evaluate_operator(
        self: &Arc<Self>,
        op: &str,
        operand: &Value,
    ) -> Result<Value, ScriptError> {
        match op {
            "$" => {
                let text = operand.as_str().ok_or_else(|| {
                    ScriptError::InvalidArgument("'$' operand must be a string".to_string())
                })?;
                let variables = self.variables.read();
                let resolve = |name: &str| variables.get(name).map(|v| v.value.clone());
                evaluate_expression(text, &resolve)
            }
            "$eq" | "$ne" => {
                let (left, right) = self.evaluate_pair(op, operand).await?;
                let equal = values_equal(op, &left, &right)?;
                Ok(Value::Bool(if op == "$eq" { equal } else { !equal }))
            }
            "$gt" | "$lt" | "$gte" | "$lte" => {
                let (left, right) = self.evaluate_pair(op, operand).await?;
                let (left, right) = (expect_number(op, &left)?, expect_number(op, &right)?);
                Ok(Value::Bool(match op {
                    "$gt" => left > right,
                    "$lt" => left < right,
                    "$gte" => left >= right,
                    _ => left <= right,
                }))
            }
            "$add" | "$sub" | "$mul" | "$div" => {
                let (left, right) = self.evaluate_pair(op, operand).await?;
                let (left, right) = (expect_number(op, &left)?, expect_number(op, &right)?);
                if op == "$div" && right == 0.0 {
                    return Err(ScriptError::DivisionByZero);
                }
                Ok(number_value(match op {
                    "$add" => left + right,
                    "$sub" => left - right,
                    "$mul" => left * right,
                    _ => left / right,
                }))
            }
            "$and" | "$or" => {
                let items = operand.as_array().ok_or_else(|| {
                    ScriptError::InvalidArgument(format!("{op} operand must be an array"))
                })?;
                let mut result = op == "$and";
                for item in items {
                    let value = self.evaluate(item).await?;
                    let flag = expect_bool(op, &value)?;
                    if op == "$and" {
                        result = result && flag;
                    } else {
                        result = result || flag;
                    }
                }
                Ok(Value::Bool(result))
            }
            "$if" => {
                let condition = operand.get("condition").ok_or_else(|| {
                    ScriptError::MissingField {
                        step: "$if".to_string(),
                        field: "condition".to_string(),
                    }
                })?;
                let condition = self.evaluate(condition).await?;
                let branch = if expect_bool("$if", &condition)? {
                    operand.get("then")
                } else {
                    operand.get("else")
                };
                match branch {
                    Some(branch) => self.evaluate(branch).await,
                    None => Ok(Value::Null),
                }
            }
            "$call" => {
                let function = operand
                    .get("function")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ScriptError::MissingField {
                        step: "$call".to_string(),
                        field: "function".to_string(),
                    })?
                    .to_string();
                let params = operand.get("params").cloned().unwrap_or(Value::Null);
                let params = self.evaluate_params(&params).await?;
                self.call_function(&function, params).await
            }
            other => Err(ScriptError::InvalidArgument(format!(
                "unknown operator: {other}"
            ))),
        }
    }

    async fn evaluate_pair(
        self: &Arc<Self>,
        op: &str,
        operand: &Value,
    ) -> Result<(Value, Value), ScriptError> {
        let items = operand.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
            ScriptError::InvalidArgument(format!("{op} operand must be a two-element array"))
        })?;
        let left = self.evaluate(&items[0]).await?;
        let right = self.evaluate(&items[1]).await?;
        Ok((left, right))
    }

    /// Evaluates each value of a params object.
    pub(crate) async fn evaluate_params(
        self: &Arc<Self>,
        params: &Value,
    ) -> Result<Value, ScriptError> {
        match params {
            Value::Object(obj) => {
                let mut evaluated = serde_json::Map::with_capacity(obj.len());
                for (key, value) in obj {
                    evaluated.insert(key.clone(), self.evaluate(value).await?);
                }
                Ok(Value::Object(evaluated))
            }
            Value::Null => Ok(Value::Object(serde_json::Map::new())),
            other => self.evaluate(other).await,
        }
    }

    /// Replaces `$name` occurrences with the variable's display value.
    /// Unknown names are left as-is.
    pub(crate) fn interpolate(&self, text: &str) -> String {
        let variables = self.variables.read();
        let mut out = String::with_capacity(text.len());
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                if end > start {
                    let name = &text[start..end];
                    if let Some(variable) = variables.get(name) {
                        out.push_str(&display_value(&variable.value));
                        i = end;
                        continue;
                    }
                }
            }
            let c = text[i..].chars().next().expect("in-bounds index");
            out.push(c);
            i += c.len_utf8();
        }
        out
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Display form for interpolation: strings raw, everything else JSON.
#[must_use]
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn expect_number(op: &str, value: &Value) -> Result<f64, ScriptError> {
    value.as_f64().ok_or_else(|| {
        ScriptError::InvalidArgument(format!("{op} requires numeric operands, got {value}"))
    })
}

fn expect_bool(op: &str, value: &Value) -> Result<bool, ScriptError> {
    value.as_bool().ok_or_else(|| {
        ScriptError::InvalidArgument(format!("{op} requires a boolean, got {value}"))
    })
}

/// Equality under the type-agreement rule: both sides must classify to
/// the same `VariableType`.
fn values_equal(op: &str, left: &Value, right: &Value) -> Result<bool, ScriptError> {
    let (lt, rt) = (determine_type(left), determine_type(right));
    if lt != rt {
        return Err(ScriptError::InvalidArgument(format!(
            "{op} requires both sides to have the same type ({lt} vs {rt})"
        )));
    }
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Ok((l - r).abs() < f64::EPSILON);
    }
    Ok(left == right)
}
