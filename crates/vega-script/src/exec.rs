//! The step machine.
//!
//! One worker walks a script's steps sequentially; control-flow steps
//! return a [`Flow`] that the enclosing block interprets. `stop` and
//! `pause` are honored at every step boundary; suspension points
//! (`delay`, event waits, retry backoff) wake promptly on stop. The one
//! exception is `finally`: it always runs, even when the run is being
//! stopped, so scripts can rely on it for device cleanup.
//!
//! Control flow is data, not errors: `break`, `continue`, `return` and
//! `goto` travel as [`Flow`] variants. Faults travel as `ScriptError`
//! and unwind toward the nearest `try` step; faults that escape the
//! script go to its registered exception handler, or fail the run.

use crate::eval::{display_value, BoxFuture};
use crate::interpreter::{
    event_key, store_variable, FunctionDef, InterpreterCore, ScriptFunction, Variable,
    DEFAULT_CHANNEL,
};
use crate::program::{index_labels, Script};
use crate::ScriptError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vega_types::{determine_type, RunId};

/// Maximum re-entries per label per execution.
const GOTO_LIMIT: u32 = 100;

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Proceed to the next step.
    Next,
    /// Leave the innermost loop.
    Break,
    /// Jump to the next loop iteration.
    Continue,
    /// Terminate the enclosing function (or script).
    Return,
    /// Jump to a label; resolved by the nearest block that has it.
    Goto(String),
    /// Cooperative stop; unwinds the whole run.
    Halt,
}

/// Per-execution state.
pub(crate) struct Ctx {
    script: String,
    run: RunId,
    goto_counts: HashMap<String, u32>,
    /// Set while a `finally` branch runs: cleanup steps are exempt from
    /// the stop checkpoint so they complete even after `stop`.
    cleanup: bool,
}

impl Ctx {
    fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            run: RunId::new(),
            goto_counts: HashMap::new(),
            cleanup: false,
        }
    }
}

/// Result of waiting for events.
enum WaitOutcome {
    Event(String, Value),
    TimedOut,
    Stopped,
}

impl InterpreterCore {
    /// Executes a loaded script to completion.
    pub(crate) async fn run_script(self: &Arc<Self>, name: &str) -> Result<(), ScriptError> {
        let script = self.script(name)?;
        let mut ctx = Ctx::new(name);
        info!(script = %name, run = %ctx.run, "Script execution started");
        self.is_running.store(true, Ordering::Release);

        let result = self.execute_block(&script.steps, &mut ctx).await;
        self.is_running.store(false, Ordering::Release);

        match result {
            Ok(Flow::Goto(label)) => self.script_fault(name, ScriptError::UnknownLabel(label)),
            Ok(Flow::Halt) => {
                info!(script = %name, run = %ctx.run, "Script execution stopped");
                Ok(())
            }
            Ok(_) => {
                info!(script = %name, run = %ctx.run, "Script execution finished");
                Ok(())
            }
            Err(e) => self.script_fault(name, e),
        }
    }

    fn script(&self, name: &str) -> Result<Arc<Script>, ScriptError> {
        self.scripts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::ScriptNotFound(name.to_string()))
    }

    /// Routes an escaped fault to the script's exception handler, or
    /// returns it. Either way the interpreter is left consistent.
    fn script_fault(&self, name: &str, fault: ScriptError) -> Result<(), ScriptError> {
        let stack = self.call_stack.lock().clone();
        error!(script = %name, error = %fault, call_stack = ?stack, "Script fault");
        let handler = self.exception_handlers.read().get(name).cloned();
        match handler {
            Some(handler) => {
                handler(&fault);
                Ok(())
            }
            None => Err(fault),
        }
    }

    /// Executes one step slice; resolves `goto` against labels declared
    /// in this slice and forwards unresolved ones outward.
    pub(crate) fn execute_block<'a>(
        self: &'a Arc<Self>,
        steps: &'a [Value],
        ctx: &'a mut Ctx,
    ) -> BoxFuture<'a, Result<Flow, ScriptError>> {
        Box::pin(async move {
            let labels = index_labels(steps);
            let mut index = 0;
            while index < steps.len() {
                if !ctx.cleanup && self.checkpoint().await {
                    return Ok(Flow::Halt);
                }
                match self.execute_step(&steps[index], ctx).await? {
                    Flow::Next => index += 1,
                    Flow::Goto(label) => match labels.get(&label) {
                        Some(&target) => {
                            let count = ctx.goto_counts.entry(label.clone()).or_insert(0);
                            *count += 1;
                            if *count > GOTO_LIMIT {
                                return Err(ScriptError::GotoDepthExceeded(label));
                            }
                            index = target;
                        }
                        None => return Ok(Flow::Goto(label)),
                    },
                    flow => return Ok(flow),
                }
            }
            Ok(Flow::Next)
        })
    }

    /// Dispatches one step by its `type` field.
    fn execute_step<'a>(
        self: &'a Arc<Self>,
        step: &'a Value,
        ctx: &'a mut Ctx,
    ) -> BoxFuture<'a, Result<Flow, ScriptError>> {
        Box::pin(async move {
            let step_type = step
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| ScriptError::MissingField {
                    step: "<step>".to_string(),
                    field: "type".to_string(),
                })?;
            debug!(script = %ctx.script, step = %step_type, "Executing step");

            match step_type {
                "call" | "function" => self.step_call(step).await,
                "condition" => self.step_condition(step, ctx).await,
                "loop" => self.step_loop(step, ctx).await,
                "while" => self.step_while(step, ctx).await,
                "goto" => Ok(Flow::Goto(
                    require_str(step, step_type, "label")?.to_string(),
                )),
                "switch" => self.step_switch(step, ctx).await,
                "delay" => self.step_delay(step).await,
                "parallel" => self.step_parallel(step, ctx).await,
                "nested_script" => self.step_nested_script(step).await,
                "assign" => self.step_assign(step).await,
                "import" => self.step_import(step).await,
                "wait_event" => self.step_wait_event(step).await,
                "listen_event" => self.step_listen_event(step, ctx).await,
                "broadcast_event" => self.step_broadcast_event(step).await,
                "print" => self.step_print(step).await,
                "message" => self.step_message(step),
                "async" => self.step_async(step, ctx),
                "try" => self.step_try(step, ctx).await,
                "function_def" => self.step_function_def(step),
                "return" => self.step_return(step).await,
                "break" => Ok(Flow::Break),
                "continue" => Ok(Flow::Continue),
                "retry" => self.step_retry(step, ctx).await,
                "schedule" => self.step_schedule(step, ctx).await,
                "scope" => self.step_scope(step, ctx).await,
                "throw" => self.step_throw(step).await,
                other => Err(ScriptError::UnknownStep(other.to_string())),
            }
        })
    }

    /// Executes a branch value: a single step object or a step array.
    async fn execute_branch(
        self: &Arc<Self>,
        branch: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        match branch {
            Value::Array(steps) => self.execute_block(steps, ctx).await,
            Value::Object(_) => self.execute_step(branch, ctx).await,
            _ => Err(ScriptError::InvalidScript(
                "branch must be a step or step array".to_string(),
            )),
        }
    }

    /// Detached execution used by `async`, `parallel` children and
    /// parallel `schedule`.
    fn spawn_block(
        self: &Arc<Self>,
        steps: Vec<Value>,
        script: String,
    ) -> JoinHandle<Result<Flow, ScriptError>> {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut ctx = Ctx::new(script);
            core.execute_block(&steps, &mut ctx).await
        })
    }

    // ------------------------------------------------------------------
    // Step implementations
    // ------------------------------------------------------------------

    async fn step_call(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let function = require_str(step, "call", "function")?;
        let params = step.get("params").cloned().unwrap_or(Value::Null);
        let params = self.evaluate_params(&params).await?;
        let value = self.call_function(function, params).await?;
        if let Some(result) = step.get("result").and_then(Value::as_str) {
            let mut variables = self.variables.write();
            store_variable(&mut variables, result, value)?;
        }
        Ok(Flow::Next)
    }

    /// Invokes a registered function by name. The interpreter lock is
    /// released before user code runs.
    pub(crate) fn call_function<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async move {
            let function = self
                .functions
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| ScriptError::FunctionNotFound(name.to_string()))?;
            self.call_stack.lock().push(name.to_string());
            let result = match function {
                ScriptFunction::Native(f) => f(&params),
                ScriptFunction::Defined(def) => self.call_defined(name, &def, &params).await,
            };
            self.call_stack.lock().pop();
            result
        })
    }

    /// Calls a `function_def` closure: binds the captured snapshot and
    /// parameters, runs the body, harvests `__return_value__` and
    /// restores prior bindings.
    async fn call_defined(
        self: &Arc<Self>,
        name: &str,
        def: &FunctionDef,
        params: &Value,
    ) -> Result<Value, ScriptError> {
        let mut merged = def.defaults.clone();
        if let Value::Object(passed) = params {
            for (key, value) in passed {
                merged.insert(key.clone(), value.clone());
            }
        }

        let mut saved: HashMap<String, Option<Variable>> = HashMap::new();
        {
            let mut variables = self.variables.write();
            let shadowed = def
                .captured
                .keys()
                .cloned()
                .chain(def.params.iter().cloned())
                .chain(std::iter::once(RETURN_SLOT.to_string()));
            for shadowed_name in shadowed {
                saved
                    .entry(shadowed_name.clone())
                    .or_insert_with(|| variables.get(&shadowed_name).cloned());
            }
            for (captured_name, captured) in &def.captured {
                variables.insert(captured_name.clone(), captured.clone());
            }
            for param in &def.params {
                let value = merged.get(param).cloned().unwrap_or(Value::Null);
                variables.insert(
                    param.clone(),
                    Variable {
                        ty: determine_type(&value),
                        value,
                    },
                );
            }
            variables.remove(RETURN_SLOT);
        }

        let mut ctx = Ctx::new(format!("fn:{name}"));
        let body = self.execute_block(&def.steps, &mut ctx).await;

        let result = match body {
            Err(e) => Err(e),
            Ok(_) => {
                let harvested = self.variables.write().remove(RETURN_SLOT);
                match harvested {
                    Some(variable) => Ok(variable.value),
                    None => match &def.ret {
                        Some(expr) => self.evaluate(expr).await,
                        None => Ok(Value::Null),
                    },
                }
            }
        };

        let mut variables = self.variables.write();
        for (saved_name, previous) in saved {
            match previous {
                Some(variable) => {
                    variables.insert(saved_name, variable);
                }
                None => {
                    variables.remove(&saved_name);
                }
            }
        }
        result
    }

    async fn step_condition(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let condition = require_field(step, "condition", "condition")?;
        let condition = self.evaluate(condition).await?;
        let Value::Bool(condition) = condition else {
            return Err(ScriptError::InvalidArgument(format!(
                "condition must be boolean, got {condition}"
            )));
        };
        let branch = if condition {
            step.get("true")
        } else {
            step.get("false")
        };
        match branch {
            Some(branch) => self.execute_branch(branch, ctx).await,
            None => Ok(Flow::Next),
        }
    }

    async fn step_loop(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let iterations = require_field(step, "loop", "loop_iterations")?;
        let iterations = self.evaluate(iterations).await?;
        let iterations = iterations.as_f64().ok_or_else(|| {
            ScriptError::InvalidArgument("loop_iterations must be numeric".to_string())
        })? as i64;
        let steps = require_steps(step, "loop", "steps")?;

        for _ in 0..iterations.max(0) {
            match self.execute_block(steps, ctx).await? {
                Flow::Next | Flow::Continue => {}
                Flow::Break => break,
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    async fn step_while(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let condition = require_field(step, "while", "condition")?;
        let steps = require_steps(step, "while", "steps")?;

        loop {
            if !ctx.cleanup && self.checkpoint().await {
                return Ok(Flow::Halt);
            }
            let value = self.evaluate(condition).await?;
            let Value::Bool(keep_going) = value else {
                return Err(ScriptError::InvalidArgument(format!(
                    "while condition must be boolean, got {value}"
                )));
            };
            if !keep_going {
                break;
            }
            match self.execute_block(steps, ctx).await? {
                Flow::Next | Flow::Continue => {}
                Flow::Break => break,
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    async fn step_switch(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let variable = require_str(step, "switch", "variable")?;
        let value = self
            .variables
            .read()
            .get(variable)
            .map(|v| v.value.clone())
            .ok_or_else(|| ScriptError::VariableNotFound(variable.to_string()))?;

        let cases = require_field(step, "switch", "cases")?
            .as_array()
            .ok_or_else(|| ScriptError::InvalidScript("switch cases must be an array".to_string()))?;

        for case in cases {
            let case_value = require_field(case, "case", "case")?;
            let case_value = self.evaluate(case_value).await?;
            if switch_matches(&value, &case_value) {
                let steps = require_steps(case, "case", "steps")?;
                return self.execute_block(steps, ctx).await;
            }
        }

        match step.get("default") {
            Some(default) => {
                let steps = match default.get("steps") {
                    Some(steps) => steps,
                    None => default,
                };
                self.execute_branch(steps, ctx).await
            }
            None => Ok(Flow::Next),
        }
    }

    async fn step_delay(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let millis = require_field(step, "delay", "milliseconds")?;
        let millis = self.evaluate(millis).await?;
        let millis = millis.as_f64().ok_or_else(|| {
            ScriptError::InvalidArgument("delay milliseconds must be numeric".to_string())
        })?;
        if self
            .interruptible_sleep(Duration::from_millis(millis.max(0.0) as u64))
            .await
        {
            Ok(Flow::Next)
        } else {
            Ok(Flow::Halt)
        }
    }

    async fn step_parallel(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let steps = require_steps(step, "parallel", "steps")?;
        let handles: Vec<JoinHandle<Result<Flow, ScriptError>>> = steps
            .iter()
            .map(|child| self.spawn_block(vec![child.clone()], ctx.script.clone()))
            .collect();

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(ScriptError::Runtime(format!(
                        "parallel child panicked: {e}"
                    )));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(Flow::Next),
        }
    }

    async fn step_nested_script(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let name = require_str(step, "nested_script", "script")?;
        let script = self.script(name)?;
        let mut ctx = Ctx::new(name);
        match self.execute_block(&script.steps, &mut ctx).await? {
            Flow::Goto(label) => Err(ScriptError::UnknownLabel(label)),
            Flow::Halt => Ok(Flow::Halt),
            _ => Ok(Flow::Next),
        }
    }

    async fn step_assign(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let variable = require_str(step, "assign", "variable")?.to_string();
        let value = require_field(step, "assign", "value")?;
        let value = self.evaluate(value).await?;

        let mut variables = self.lock_variables_for_write(&variable).await?;
        store_variable(&mut variables, &variable, value)?;
        Ok(Flow::Next)
    }

    async fn step_import(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let name = require_str(step, "import", "script")?.to_string();
        let from_file = step.get("fromFile").and_then(Value::as_bool).unwrap_or(false);
        let namespace = step.get("namespace").and_then(Value::as_str);

        let target = if from_file {
            self.import_from_file(&name, namespace).await?
        } else {
            if !self.scripts.read().contains_key(&name) {
                return Err(ScriptError::ScriptNotFound(name));
            }
            vec![name]
        };

        for script_name in target {
            let script = self.script(&script_name)?;
            if script.auto_execute() {
                info!(script = %script_name, "Auto-executing imported script");
                let mut nested = Ctx::new(script_name.clone());
                match self.execute_block(&script.steps, &mut nested).await? {
                    Flow::Halt => return Ok(Flow::Halt),
                    Flow::Goto(label) => return Err(ScriptError::UnknownLabel(label)),
                    _ => {}
                }
            }
        }
        Ok(Flow::Next)
    }

    /// Reads `<task_dir>/<name>.json` and loads the scripts it holds.
    ///
    /// The file may be a single script or an object mapping names to
    /// scripts. With a namespace, loaded names become `ns::name`.
    /// A top-level `imports` array triggers recursive file imports.
    fn import_from_file<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
        namespace: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<String>, ScriptError>> {
        Box::pin(async move {
            let mut path = self.task_dir.read().join(name);
            if path.extension().is_none() {
                path.set_extension("json");
            }
            info!(script = %name, path = %path.display(), "Importing script file");
            let text = tokio::fs::read_to_string(&path).await?;
            let value: Value = serde_json::from_str(&text)?;

            let qualified = |plain: &str| match namespace {
                Some(ns) => format!("{ns}::{plain}"),
                None => plain.to_string(),
            };

            let mut loaded = Vec::new();
            let entries: Vec<(String, Value)> = match &value {
                Value::Array(_) => vec![(qualified(name), value.clone())],
                Value::Object(obj) if obj.contains_key("steps") => {
                    vec![(qualified(name), value.clone())]
                }
                Value::Object(obj) => obj
                    .iter()
                    .map(|(key, script)| (qualified(key), script.clone()))
                    .collect(),
                _ => {
                    return Err(ScriptError::InvalidScript(format!(
                        "imported file {name} is not a script"
                    )))
                }
            };

            for (script_name, script_value) in entries {
                if let Some(imports) = script_value.get("imports").and_then(Value::as_array) {
                    for import in imports.iter().filter_map(Value::as_str) {
                        let nested = self.import_from_file(import, namespace).await?;
                        loaded.extend(nested);
                    }
                }
                let script = Script::parse(script_value)?;
                self.scripts
                    .write()
                    .insert(script_name.clone(), Arc::new(script));
                info!(script = %script_name, "Script imported");
                loaded.push(script_name);
            }
            Ok(loaded)
        })
    }

    async fn step_wait_event(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let event = require_str(step, "wait_event", "event")?;
        let keys = vec![event_key(event, DEFAULT_CHANNEL)];
        match self.wait_for_events(&keys, None).await {
            WaitOutcome::Event(key, payload) => {
                self.bind_event(&key, payload);
                Ok(Flow::Next)
            }
            WaitOutcome::TimedOut => Ok(Flow::Next),
            WaitOutcome::Stopped => Ok(Flow::Halt),
        }
    }

    async fn step_listen_event(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let names = require_field(step, "listen_event", "event_names")?
            .as_array()
            .ok_or_else(|| {
                ScriptError::InvalidScript("event_names must be an array".to_string())
            })?;
        let channel = step
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CHANNEL);
        let keys: Vec<String> = names
            .iter()
            .filter_map(Value::as_str)
            .map(|name| event_key(name, channel))
            .collect();
        if keys.is_empty() {
            return Err(ScriptError::InvalidScript(
                "event_names must contain at least one name".to_string(),
            ));
        }

        let timeout = match step.get("timeout").and_then(Value::as_f64) {
            Some(ms) if ms >= 0.0 => {
                Some(tokio::time::Instant::now() + Duration::from_millis(ms as u64))
            }
            _ => None,
        };

        loop {
            match self.wait_for_events(&keys, timeout).await {
                WaitOutcome::TimedOut => return Ok(Flow::Next),
                WaitOutcome::Stopped => return Ok(Flow::Halt),
                WaitOutcome::Event(key, payload) => {
                    let event_name = key
                        .split_once('@')
                        .map_or(key.as_str(), |(name, _)| name)
                        .to_string();
                    self.bind_event(&key, payload);

                    if let Some(filter) = step.get("filter") {
                        let keep = self.evaluate(filter).await?;
                        if keep != Value::Bool(true) {
                            debug!(event = %key, "Event rejected by filter");
                            continue;
                        }
                    }

                    let per_event = step
                        .get("event_steps")
                        .and_then(|m| m.get(event_name.as_str()));
                    let steps = per_event.or_else(|| step.get("steps"));
                    if let Some(steps) = steps {
                        return self.execute_branch(steps, ctx).await;
                    }
                    return Ok(Flow::Next);
                }
            }
        }
    }

    async fn step_broadcast_event(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let event = require_str(step, "broadcast_event", "event_name")?;
        let channel = step
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CHANNEL);
        let payload = match step.get("event_data") {
            Some(data) => self.evaluate(data).await?,
            None => Value::Null,
        };
        self.broadcast(event, channel, payload);
        Ok(Flow::Next)
    }

    async fn step_print(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let message = require_field(step, "print", "message")?;
        let text = match message {
            Value::String(s) => self.interpolate(s),
            other => display_value(&self.evaluate(other).await?),
        };
        info!(message = %text, "print");
        Ok(Flow::Next)
    }

    fn step_message(&self, step: &Value) -> Result<Flow, ScriptError> {
        let text = step
            .get("label")
            .or_else(|| step.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("");
        info!(message = %self.interpolate(text), "message");
        Ok(Flow::Next)
    }

    fn step_async(self: &Arc<Self>, step: &Value, ctx: &Ctx) -> Result<Flow, ScriptError> {
        let steps = require_steps(step, "async", "steps")?.to_vec();
        let script = ctx.script.clone();
        let handle = self.spawn_block(steps, script.clone());
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(script = %script, error = %e, "Async step failed"),
                Err(e) => warn!(script = %script, error = %e, "Async step panicked"),
            }
        });
        Ok(Flow::Next)
    }

    async fn step_try(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let body = require_field(step, "try", "try")?;
        let outcome = self.execute_branch(body, ctx).await;

        match outcome {
            Ok(Flow::Halt) => {
                // Cooperative stop still runs cleanup.
                self.run_finally(step, ctx).await?;
                Ok(Flow::Halt)
            }
            Ok(flow) => {
                if let Some(else_steps) = step.get("else") {
                    match self.execute_branch(else_steps, ctx).await? {
                        Flow::Next => {}
                        other => {
                            self.run_finally(step, ctx).await?;
                            return Ok(other);
                        }
                    }
                }
                self.run_finally(step, ctx).await?;
                Ok(flow)
            }
            Err(fault) => {
                let clause = matching_catch(step.get("catch"), &fault);
                match clause {
                    Some(steps) => {
                        info!(error = %fault, kind = %fault.kind(), "Exception caught");
                        let flow = self.execute_branch(&steps, ctx).await?;
                        self.run_finally(step, ctx).await?;
                        Ok(flow)
                    }
                    None => {
                        self.run_finally(step, ctx).await?;
                        Err(fault)
                    }
                }
            }
        }
    }

    /// Runs the `finally` branch, when present. Cleanup is exempt from
    /// the stop checkpoint; bounded waits inside it still wake early.
    async fn run_finally(self: &Arc<Self>, step: &Value, ctx: &mut Ctx) -> Result<(), ScriptError> {
        if let Some(finally) = step.get("finally") {
            let prior = ctx.cleanup;
            ctx.cleanup = true;
            let outcome = self.execute_branch(finally, ctx).await;
            ctx.cleanup = prior;
            outcome?;
        }
        Ok(())
    }

    fn step_function_def(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let name = require_str(step, "function_def", "name")?;
        let params = step
            .get("params")
            .and_then(Value::as_array)
            .map(|p| {
                p.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let defaults = step
            .get("default_values")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(Map::new);
        let steps = require_steps(step, "function_def", "steps")?.to_vec();
        let captured = self.variables.read().clone();

        let mut functions = self.functions.write();
        if matches!(functions.get(name), Some(ScriptFunction::Native(_))) {
            return Err(ScriptError::DuplicateFunction(name.to_string()));
        }
        functions.insert(
            name.to_string(),
            ScriptFunction::Defined(Arc::new(FunctionDef {
                params,
                defaults,
                steps,
                ret: step.get("return").cloned(),
                captured,
            })),
        );
        debug!(function = %name, "Function defined");
        Ok(Flow::Next)
    }

    async fn step_return(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let value = match step.get("value") {
            Some(value) => self.evaluate(value).await?,
            None => Value::Null,
        };
        self.force_set(RETURN_SLOT, value);
        Ok(Flow::Return)
    }

    async fn step_retry(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let retries = require_field(step, "retry", "retries")?;
        let retries = self
            .evaluate(retries)
            .await?
            .as_f64()
            .ok_or_else(|| ScriptError::InvalidArgument("retries must be numeric".to_string()))?
            .max(1.0) as u64;
        let mut delay = step
            .get("delay")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .max(0.0) as u64;
        let exponential = step
            .get("exponential_backoff")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let error_type = step.get("error_type").and_then(Value::as_str);
        let steps = require_steps(step, "retry", "steps")?;

        for attempt in 1..=retries {
            match self.execute_block(steps, ctx).await {
                Ok(flow) => return Ok(flow),
                Err(fault) => {
                    if let Some(error_type) = error_type {
                        if !fault.matches(error_type) {
                            return Err(fault);
                        }
                    }
                    if attempt == retries {
                        return Err(fault);
                    }
                    warn!(attempt, error = %fault, "Step failed, retrying");
                    if let Some(on_retry) = step.get("on_retry") {
                        self.execute_branch(on_retry, ctx).await?;
                    }
                    if delay > 0
                        && !self
                            .interruptible_sleep(Duration::from_millis(delay))
                            .await
                    {
                        return Ok(Flow::Halt);
                    }
                    if exponential {
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        Ok(Flow::Next)
    }

    async fn step_schedule(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let delay = require_field(step, "schedule", "delay")?;
        let delay = self
            .evaluate(delay)
            .await?
            .as_f64()
            .ok_or_else(|| ScriptError::InvalidArgument("delay must be numeric".to_string()))?
            .max(0.0) as u64;
        let parallel = step.get("parallel").and_then(Value::as_bool).unwrap_or(false);
        let steps = require_steps(step, "schedule", "steps")?;

        if parallel {
            let core = Arc::clone(self);
            let steps = steps.to_vec();
            let script = ctx.script.clone();
            tokio::spawn(async move {
                if core
                    .interruptible_sleep(Duration::from_millis(delay))
                    .await
                {
                    let mut ctx = Ctx::new(script.clone());
                    if let Err(e) = core.execute_block(&steps, &mut ctx).await {
                        warn!(script = %script, error = %e, "Scheduled steps failed");
                    }
                }
            });
            Ok(Flow::Next)
        } else {
            if !self
                .interruptible_sleep(Duration::from_millis(delay))
                .await
            {
                return Ok(Flow::Halt);
            }
            self.execute_block(steps, ctx).await
        }
    }

    async fn step_scope(
        self: &Arc<Self>,
        step: &Value,
        ctx: &mut Ctx,
    ) -> Result<Flow, ScriptError> {
        let steps = require_steps(step, "scope", "steps")?;

        // Shadow declared variables.
        let mut saved_vars: HashMap<String, Option<Variable>> = HashMap::new();
        if let Some(declared) = step.get("variables").and_then(Value::as_object) {
            for (name, initial) in declared {
                let value = self.evaluate(initial).await?;
                let mut variables = self.variables.write();
                saved_vars
                    .entry(name.clone())
                    .or_insert_with(|| variables.get(name).cloned());
                variables.insert(
                    name.clone(),
                    Variable {
                        ty: determine_type(&value),
                        value,
                    },
                );
            }
        }

        // Shadow declared functions.
        let mut saved_fns: HashMap<String, Option<ScriptFunction>> = HashMap::new();
        if let Some(declared) = step.get("functions").and_then(Value::as_object) {
            let captured = self.variables.read().clone();
            let mut functions = self.functions.write();
            for (name, spec) in declared {
                let params = spec
                    .get("params")
                    .and_then(Value::as_array)
                    .map(|p| {
                        p.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let steps = require_steps(spec, "scope function", "steps")?.to_vec();
                saved_fns
                    .entry(name.clone())
                    .or_insert_with(|| functions.get(name).cloned());
                functions.insert(
                    name.clone(),
                    ScriptFunction::Defined(Arc::new(FunctionDef {
                        params,
                        defaults: spec
                            .get("default_values")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_else(Map::new),
                        steps,
                        ret: spec.get("return").cloned(),
                        captured: captured.clone(),
                    })),
                );
            }
        }

        let outcome = self.execute_block(steps, ctx).await;

        if outcome.is_err() {
            if let Some(on_error) = step.get("on_error") {
                if let Err(secondary) = self.execute_branch(on_error, ctx).await {
                    warn!(error = %secondary, "scope on_error failed");
                }
            }
        }
        if let Some(cleanup) = step.get("cleanup") {
            if let Err(secondary) = self.execute_branch(cleanup, ctx).await {
                warn!(error = %secondary, "scope cleanup failed");
            }
        }

        {
            let mut variables = self.variables.write();
            for (name, previous) in saved_vars {
                match previous {
                    Some(variable) => {
                        variables.insert(name, variable);
                    }
                    None => {
                        variables.remove(&name);
                    }
                }
            }
        }
        {
            let mut functions = self.functions.write();
            for (name, previous) in saved_fns {
                match previous {
                    Some(function) => {
                        functions.insert(name, function);
                    }
                    None => {
                        functions.remove(&name);
                    }
                }
            }
        }

        outcome
    }

    async fn step_throw(self: &Arc<Self>, step: &Value) -> Result<Flow, ScriptError> {
        let exception_type = require_str(step, "throw", "exception_type")?;
        let message = match step.get("message") {
            Some(message) => display_value(&self.evaluate(message).await?),
            None => String::new(),
        };
        Err(match exception_type {
            "runtime_error" | "runtime" => ScriptError::Runtime(message),
            "invalid_argument" => ScriptError::InvalidArgument(message),
            "out_of_range" => ScriptError::OutOfRange(message),
            other => ScriptError::InvalidScript(format!("unknown exception type: {other}")),
        })
    }

    // ------------------------------------------------------------------
    // Suspension
    // ------------------------------------------------------------------

    /// Honors pause/stop at a step boundary. Returns `true` to halt.
    async fn checkpoint(&self) -> bool {
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return true;
            }
            if !self.pause_requested.load(Ordering::Acquire) {
                return false;
            }
            let wake = self.wake.notified();
            if self.stop_requested.load(Ordering::Acquire) {
                return true;
            }
            if !self.pause_requested.load(Ordering::Acquire) {
                return false;
            }
            wake.await;
        }
    }

    /// Sleeps for `duration`, waking early on stop. Returns `false`
    /// when stopped.
    async fn interruptible_sleep(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return false;
            }
            let wake = self.wake.notified();
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return
                    !self.stop_requested.load(Ordering::Acquire),
                () = wake => {}
            }
        }
    }

    /// Waits until an event matching `keys` arrives, the deadline
    /// passes, or the interpreter stops.
    async fn wait_for_events(
        &self,
        keys: &[String],
        deadline: Option<tokio::time::Instant>,
    ) -> WaitOutcome {
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return WaitOutcome::Stopped;
            }
            if let Some((key, payload)) = self.events.take_matching(keys) {
                return WaitOutcome::Event(key, payload);
            }
            let notified = self.events.notify.notified();
            if let Some((key, payload)) = self.events.take_matching(keys) {
                return WaitOutcome::Event(key, payload);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return WaitOutcome::TimedOut;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Binds the received event into the `__event_*` slots.
    fn bind_event(&self, key: &str, payload: Value) {
        let name = key.split_once('@').map_or(key, |(name, _)| name);
        self.force_set("__event_name__", Value::String(name.to_string()));
        self.force_set("__event_data__", payload);
    }

    /// Rebinds an internal slot, allowing its type to change.
    fn force_set(&self, name: &str, value: Value) {
        self.variables.write().insert(
            name.to_string(),
            Variable {
                ty: determine_type(&value),
                value,
            },
        );
    }
}

/// Internal variable carrying a function's return value.
pub(crate) const RETURN_SLOT: &str = "__return_value__";

fn require_field<'a>(
    step: &'a Value,
    step_type: &str,
    field: &str,
) -> Result<&'a Value, ScriptError> {
    step.get(field).ok_or_else(|| ScriptError::MissingField {
        step: step_type.to_string(),
        field: field.to_string(),
    })
}

fn require_str<'a>(step: &'a Value, step_type: &str, field: &str) -> Result<&'a str, ScriptError> {
    require_field(step, step_type, field)?
        .as_str()
        .ok_or_else(|| ScriptError::MissingField {
            step: step_type.to_string(),
            field: field.to_string(),
        })
}

fn require_steps<'a>(
    step: &'a Value,
    step_type: &str,
    field: &str,
) -> Result<&'a [Value], ScriptError> {
    require_field(step, step_type, field)?
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| ScriptError::InvalidScript(format!("{step_type} {field} must be an array")))
}

/// One catch clause's steps, when its type matches the fault.
fn matching_catch(catch: Option<&Value>, fault: &ScriptError) -> Option<Value> {
    let clauses: Vec<&Value> = match catch? {
        Value::Array(clauses) => clauses.iter().collect(),
        single @ Value::Object(_) => vec![single],
        _ => return None,
    };
    for clause in clauses {
        let clause_type = clause.get("type").and_then(Value::as_str).unwrap_or("all");
        if fault.matches(clause_type) {
            return clause.get("steps").cloned();
        }
    }
    None
}

/// Loose equality used by `switch`: numbers compare numerically,
/// everything else structurally; mismatched types never match.
fn switch_matches(value: &Value, case: &Value) -> bool {
    if determine_type(value) != determine_type(case) {
        return false;
    }
    if let (Some(l), Some(r)) = (value.as_f64(), case.as_f64()) {
        return (l - r).abs() < f64::EPSILON;
    }
    value == case
}
