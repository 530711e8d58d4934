//! Pre-execution macro expansion.
//!
//! The [`TaskGenerator`] rewrites a script's JSON before it is loaded:
//! any string of the form `${name}` or `${name(arg1,arg2)}` whose name
//! matches a registered macro is replaced by the macro's expansion.
//!
//! Macros come in three shapes:
//!
//! - **JSON**: the invocation is replaced by a JSON value;
//! - **text**: the invocation is replaced inline within the string;
//! - **callable**: a function over the argument list producing JSON.
//!
//! Strings referencing no registered macro are left untouched, so the
//! pass is idempotent on macro-free scripts.

use crate::ScriptError;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Callable macro body.
pub type MacroFn = Arc<dyn Fn(&[String]) -> Result<Value, ScriptError> + Send + Sync>;

/// A registered macro.
#[derive(Clone)]
pub enum MacroDef {
    /// Expands to a JSON value.
    Json(Value),
    /// Expands to literal text, spliced into the surrounding string.
    Text(String),
    /// Expands by calling a function over the argument list.
    Call(MacroFn),
}

/// Macro registry and expansion pass.
#[derive(Default)]
pub struct TaskGenerator {
    macros: RwLock<HashMap<String, MacroDef>>,
}

impl TaskGenerator {
    /// Creates an empty generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a JSON macro.
    pub fn add_json_macro(&self, name: &str, value: Value) {
        self.macros
            .write()
            .insert(name.to_string(), MacroDef::Json(value));
    }

    /// Registers a text macro.
    pub fn add_text_macro(&self, name: &str, text: &str) {
        self.macros
            .write()
            .insert(name.to_string(), MacroDef::Text(text.to_string()));
    }

    /// Registers a callable macro.
    pub fn add_callable_macro(
        &self,
        name: &str,
        function: impl Fn(&[String]) -> Result<Value, ScriptError> + Send + Sync + 'static,
    ) {
        self.macros
            .write()
            .insert(name.to_string(), MacroDef::Call(Arc::new(function)));
    }

    /// Removes a macro. Returns `true` when it existed.
    pub fn remove_macro(&self, name: &str) -> bool {
        self.macros.write().remove(name).is_some()
    }

    /// Registered macro names, sorted.
    #[must_use]
    pub fn macro_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.macros.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Expands macros in-place throughout a script value.
    ///
    /// # Errors
    ///
    /// Propagates faults from callable macros.
    pub fn process_script(&self, script: &mut Value) -> Result<(), ScriptError> {
        let macros = self.macros.read();
        expand(&macros, script)
    }
}

fn expand(macros: &HashMap<String, MacroDef>, value: &mut Value) -> Result<(), ScriptError> {
    match value {
        Value::String(text) => {
            if let Some(replacement) = expand_string(macros, text)? {
                *value = replacement;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                expand(macros, item)?;
            }
            Ok(())
        }
        Value::Object(obj) => {
            for item in obj.values_mut() {
                expand(macros, item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Expands macro invocations inside one string. Returns `None` when
/// nothing changed.
fn expand_string(
    macros: &HashMap<String, MacroDef>,
    text: &str,
) -> Result<Option<Value>, ScriptError> {
    // Whole-string invocation may expand to arbitrary JSON.
    if let Some(invocation) = parse_invocation_exact(text) {
        if let Some(def) = macros.get(invocation.name) {
            return Ok(Some(match def {
                MacroDef::Json(v) => v.clone(),
                MacroDef::Text(t) => Value::String(t.clone()),
                MacroDef::Call(f) => f(&invocation.args)?,
            }));
        }
        return Ok(None);
    }

    // Inline invocations splice text macros into the string.
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut changed = false;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        let end = start + end;
        out.push_str(&rest[..start]);
        let body = &rest[start + 2..end];
        match parse_body(body).and_then(|inv| {
            macros.get(inv.name).map(|def| (inv, def))
        }) {
            Some((invocation, def)) => {
                let expansion = match def {
                    MacroDef::Text(t) => t.clone(),
                    MacroDef::Json(v) => crate::eval::display_value(v),
                    MacroDef::Call(f) => crate::eval::display_value(&f(&invocation.args)?),
                };
                out.push_str(&expansion);
                changed = true;
            }
            None => out.push_str(&rest[start..=end]),
        }
        rest = &rest[end + 1..];
    }
    if !changed {
        return Ok(None);
    }
    out.push_str(rest);
    Ok(Some(Value::String(out)))
}

struct Invocation<'a> {
    name: &'a str,
    args: Vec<String>,
}

/// Parses a string that is exactly one `${...}` invocation.
fn parse_invocation_exact(text: &str) -> Option<Invocation<'_>> {
    let body = text.strip_prefix("${")?.strip_suffix('}')?;
    if body.contains('}') {
        return None;
    }
    parse_body(body)
}

fn parse_body(body: &str) -> Option<Invocation<'_>> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match body.split_once('(') {
        None => is_macro_name(body).then_some(Invocation {
            name: body,
            args: Vec::new(),
        }),
        Some((name, rest)) => {
            let name = name.trim();
            let args_text = rest.strip_suffix(')')?;
            if !is_macro_name(name) {
                return None;
            }
            let args = if args_text.trim().is_empty() {
                Vec::new()
            } else {
                args_text
                    .split(',')
                    .map(|a| a.trim().to_string())
                    .collect()
            };
            Some(Invocation { name, args })
        }
    }
}

fn is_macro_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_macro_replaces_whole_string() {
        let generator = TaskGenerator::new();
        generator.add_json_macro(
            "settle",
            json!({"type": "delay", "milliseconds": 250}),
        );
        let mut script = json!([{"step": "${settle}"}]);
        generator.process_script(&mut script).expect("expand");
        assert_eq!(
            script,
            json!([{"step": {"type": "delay", "milliseconds": 250}}])
        );
    }

    #[test]
    fn text_macro_splices_inline() {
        let generator = TaskGenerator::new();
        generator.add_text_macro("target", "M31");
        let mut script = json!([{"type": "print", "message": "slewing to ${target} now"}]);
        generator.process_script(&mut script).expect("expand");
        assert_eq!(
            script,
            json!([{"type": "print", "message": "slewing to M31 now"}])
        );
    }

    #[test]
    fn callable_macro_receives_arguments() {
        let generator = TaskGenerator::new();
        generator.add_callable_macro("repeat_exposure", |args| {
            let count: usize = args[0].parse().unwrap_or(0);
            let ms: i64 = args[1].parse().unwrap_or(0);
            Ok(json!({
                "type": "loop",
                "loop_iterations": count,
                "steps": [{"type": "delay", "milliseconds": ms}]
            }))
        });
        let mut script = json!(["${repeat_exposure(3, 100)}"]);
        generator.process_script(&mut script).expect("expand");
        assert_eq!(script[0]["type"], json!("loop"));
        assert_eq!(script[0]["loop_iterations"], json!(3));
    }

    #[test]
    fn unknown_macros_left_untouched() {
        let generator = TaskGenerator::new();
        let mut script = json!([{"type": "print", "message": "${unknown} stays"}]);
        let before = script.clone();
        generator.process_script(&mut script).expect("expand");
        assert_eq!(script, before);
    }

    #[test]
    fn idempotent_without_macros() {
        let generator = TaskGenerator::new();
        let mut script = json!([
            {"type": "assign", "variable": "x", "value": 5},
            {"type": "print", "message": "plain $x text"}
        ]);
        let before = script.clone();
        generator.process_script(&mut script).expect("expand");
        assert_eq!(script, before);
        generator.process_script(&mut script).expect("expand");
        assert_eq!(script, before);
    }

    #[test]
    fn macro_management() {
        let generator = TaskGenerator::new();
        generator.add_text_macro("a", "x");
        generator.add_json_macro("b", json!(1));
        assert_eq!(generator.macro_names(), vec!["a", "b"]);
        assert!(generator.remove_macro("a"));
        assert!(!generator.remove_macro("a"));
    }
}
