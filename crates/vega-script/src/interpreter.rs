//! Interpreter state and public API.
//!
//! One [`TaskInterpreter`] holds named scripts, variables, registered
//! functions, exception handlers and the event queue. Execution runs
//! one worker per script (see `exec.rs` for the step machine); `stop`
//! and `pause` are honored at step boundaries.

use crate::program::{Script, ScriptHeader};
use crate::ScriptError;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vega_event::MessageBus;
use vega_types::{determine_type, VariableType};

/// Default capacity of the interpreter's event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// A typed variable binding.
#[derive(Debug, Clone)]
pub(crate) struct Variable {
    pub ty: VariableType,
    pub value: Value,
}

/// A native function registered into the interpreter.
pub type NativeFunction = Arc<dyn Fn(&Value) -> Result<Value, ScriptError> + Send + Sync>;

/// Handler invoked for faults that escape a script.
pub type ExceptionHandler = Arc<dyn Fn(&ScriptError) + Send + Sync>;

/// A closure created by `function_def`.
pub(crate) struct FunctionDef {
    pub params: Vec<String>,
    pub defaults: Map<String, Value>,
    pub steps: Vec<Value>,
    pub ret: Option<Value>,
    /// By-value snapshot of all variables at definition time.
    pub captured: HashMap<String, Variable>,
}

/// A callable known to the interpreter.
pub(crate) enum ScriptFunction {
    Native(NativeFunction),
    Defined(Arc<FunctionDef>),
}

impl Clone for ScriptFunction {
    fn clone(&self) -> Self {
        match self {
            Self::Native(f) => Self::Native(Arc::clone(f)),
            Self::Defined(d) => Self::Defined(Arc::clone(d)),
        }
    }
}

/// FIFO queue of `(event_name@channel, payload)` with bounded size.
pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<(String, Value)>>,
    capacity: usize,
    pub notify: Notify,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueues one event, discarding the oldest on overflow.
    pub fn push(&self, key: String, payload: Value) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            warn!(key = %key, "Event queue is full, discarding oldest event");
            queue.pop_front();
        }
        queue.push_back((key, payload));
        drop(queue);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Removes and returns the oldest event matching any of `keys`.
    pub fn take_matching(&self, keys: &[String]) -> Option<(String, Value)> {
        let mut queue = self.queue.lock();
        let index = queue.iter().position(|(key, _)| keys.contains(key))?;
        queue.remove(index)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Shared interpreter state; `exec.rs` implements the step machine on
/// top of it.
pub(crate) struct InterpreterCore {
    pub scripts: RwLock<HashMap<String, Arc<Script>>>,
    pub variables: RwLock<HashMap<String, Variable>>,
    pub functions: RwLock<HashMap<String, ScriptFunction>>,
    pub exception_handlers: RwLock<HashMap<String, ExceptionHandler>>,
    pub custom_errors: RwLock<HashMap<String, i64>>,
    pub events: EventQueue,
    pub call_stack: Mutex<Vec<String>>,
    pub stop_requested: AtomicBool,
    pub pause_requested: AtomicBool,
    pub is_running: AtomicBool,
    /// Woken on stop/resume so suspended workers re-check flags.
    pub wake: Notify,
    pub task_dir: RwLock<PathBuf>,
    pub bus: RwLock<Option<MessageBus<Value>>>,
}

/// JSON-script interpreter.
///
/// Cloning is cheap and shares all state; a clone is the natural way
/// to hand the interpreter to registered functions or other tasks.
pub struct TaskInterpreter {
    pub(crate) core: Arc<InterpreterCore>,
}

impl Clone for TaskInterpreter {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl Default for TaskInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskInterpreter {
    /// Creates an interpreter with default settings and the built-in
    /// functions (`print`, `len`, `to_int`, `to_string`) registered.
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates an interpreter with an explicit event queue capacity.
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let interpreter = Self {
            core: Arc::new(InterpreterCore {
                scripts: RwLock::new(HashMap::new()),
                variables: RwLock::new(HashMap::new()),
                functions: RwLock::new(HashMap::new()),
                exception_handlers: RwLock::new(HashMap::new()),
                custom_errors: RwLock::new(HashMap::new()),
                events: EventQueue::new(capacity),
                call_stack: Mutex::new(Vec::new()),
                stop_requested: AtomicBool::new(false),
                pause_requested: AtomicBool::new(false),
                is_running: AtomicBool::new(false),
                wake: Notify::new(),
                task_dir: RwLock::new(PathBuf::from(".")),
                bus: RwLock::new(None),
            }),
        };
        interpreter.register_builtins();
        interpreter
    }

    /// Sets the directory `import {fromFile}` reads from.
    pub fn set_task_dir(&self, dir: impl Into<PathBuf>) {
        *self.core.task_dir.write() = dir.into();
    }

    /// Attaches a message bus; every `broadcast_event` is mirrored onto
    /// it under the topic `channel::event_name`.
    pub fn attach_bus(&self, bus: MessageBus<Value>) {
        *self.core.bus.write() = Some(bus);
    }

    // ------------------------------------------------------------------
    // Scripts
    // ------------------------------------------------------------------

    /// Parses and loads a script under `name`, replacing any previous
    /// version and refreshing its label index.
    ///
    /// # Errors
    ///
    /// Fails when the JSON is not a valid script shape.
    pub fn load_script(&self, name: &str, source: Value) -> Result<(), ScriptError> {
        let script = Script::parse(source)?;
        info!(script = %name, steps = script.steps.len(), "Script loaded");
        self.core
            .scripts
            .write()
            .insert(name.to_string(), Arc::new(script));
        Ok(())
    }

    /// Parses script text and loads it under `name`.
    ///
    /// # Errors
    ///
    /// Fails on JSON syntax errors or invalid script shape.
    pub fn load_script_str(&self, name: &str, text: &str) -> Result<(), ScriptError> {
        let value: Value = serde_json::from_str(text)?;
        self.load_script(name, value)
    }

    /// Unloads a script. Returns `true` when it existed.
    pub fn unload_script(&self, name: &str) -> bool {
        self.core.scripts.write().remove(name).is_some()
    }

    /// Whether a script is loaded under `name`.
    #[must_use]
    pub fn has_script(&self, name: &str) -> bool {
        self.core.scripts.read().contains_key(name)
    }

    /// The original JSON of a loaded script.
    #[must_use]
    pub fn get_script(&self, name: &str) -> Option<Value> {
        self.core
            .scripts
            .read()
            .get(name)
            .map(|s| s.source().clone())
    }

    /// The parsed header of a loaded script.
    #[must_use]
    pub fn script_header(&self, name: &str) -> Option<ScriptHeader> {
        self.core
            .scripts
            .read()
            .get(name)
            .and_then(|s| s.header.clone())
    }

    /// Names of loaded scripts, sorted.
    #[must_use]
    pub fn script_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.core.scripts.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Functions, handlers, custom errors
    // ------------------------------------------------------------------

    /// Registers a native function.
    ///
    /// # Errors
    ///
    /// Fails when the name is already taken.
    pub fn register_function(
        &self,
        name: &str,
        function: impl Fn(&Value) -> Result<Value, ScriptError> + Send + Sync + 'static,
    ) -> Result<(), ScriptError> {
        let mut functions = self.core.functions.write();
        if functions.contains_key(name) {
            return Err(ScriptError::DuplicateFunction(name.to_string()));
        }
        functions.insert(name.to_string(), ScriptFunction::Native(Arc::new(function)));
        Ok(())
    }

    /// Whether a function (native or script-defined) exists.
    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.core.functions.read().contains_key(name)
    }

    /// Registers the handler that receives faults escaping `script`.
    pub fn register_exception_handler(
        &self,
        script: &str,
        handler: impl Fn(&ScriptError) + Send + Sync + 'static,
    ) {
        self.core
            .exception_handlers
            .write()
            .insert(script.to_string(), Arc::new(handler));
    }

    /// Registers a custom error name with its numeric code.
    pub fn register_custom_error(&self, name: &str, code: i64) {
        self.core
            .custom_errors
            .write()
            .insert(name.to_string(), code);
    }

    /// Numeric code of a registered custom error.
    #[must_use]
    pub fn custom_error_code(&self, name: &str) -> Option<i64> {
        self.core.custom_errors.read().get(name).copied()
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Binds a variable, enforcing type stability.
    ///
    /// # Errors
    ///
    /// Fails with [`ScriptError::TypeMismatch`] when the variable
    /// exists with a different recorded type.
    pub fn set_variable(&self, name: &str, value: Value) -> Result<(), ScriptError> {
        let mut variables = self.core.variables.write();
        store_variable(&mut variables, name, value)
    }

    /// Current value of a variable.
    #[must_use]
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.core.variables.read().get(name).map(|v| v.value.clone())
    }

    /// Recorded type of a variable.
    #[must_use]
    pub fn variable_type(&self, name: &str) -> Option<VariableType> {
        self.core.variables.read().get(name).map(|v| v.ty)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Enqueues an event for `wait_event`/`listen_event` steps and
    /// mirrors it onto the attached bus, when any.
    pub fn broadcast_event(&self, event_name: &str, channel: &str, payload: Value) {
        self.core.broadcast(event_name, channel, payload);
    }

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------

    /// Runs a loaded script to completion on the current task.
    ///
    /// # Errors
    ///
    /// Returns the fault that escaped the script, unless a registered
    /// exception handler for the script consumed it.
    pub async fn run(&self, name: &str) -> Result<(), ScriptError> {
        self.core.run_script(name).await
    }

    /// Spawns a background worker executing a loaded script.
    pub fn execute(&self, name: &str) -> JoinHandle<Result<(), ScriptError>> {
        let core = Arc::clone(&self.core);
        let name = name.to_string();
        tokio::spawn(async move { core.run_script(&name).await })
    }

    /// Requests cooperative termination at the next step boundary.
    pub fn stop(&self) {
        self.core.stop_requested.store(true, Ordering::Release);
        self.core.wake.notify_waiters();
        self.core.events.notify.notify_waiters();
    }

    /// Requests suspension at the next step boundary.
    pub fn pause(&self) {
        self.core.pause_requested.store(true, Ordering::Release);
    }

    /// Resumes a paused interpreter.
    pub fn resume(&self) {
        self.core.pause_requested.store(false, Ordering::Release);
        self.core.wake.notify_waiters();
    }

    /// Whether any script worker is currently executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.is_running.load(Ordering::Acquire)
    }

    /// Clears a previous stop request so new executions can run.
    pub fn reset_stop(&self) {
        self.core.stop_requested.store(false, Ordering::Release);
    }

    fn register_builtins(&self) {
        let builtins: &[(&str, fn(&Value) -> Result<Value, ScriptError>)] = &[
            ("print", builtin_print),
            ("len", builtin_len),
            ("to_int", builtin_to_int),
            ("to_string", builtin_to_string),
        ];
        for (name, function) in builtins {
            let function = *function;
            self.register_function(name, move |params| function(params))
                .expect("builtins register exactly once");
        }
    }
}

impl InterpreterCore {
    /// Enqueues an event under `name@channel`.
    pub fn broadcast(&self, event_name: &str, channel: &str, payload: Value) {
        let key = event_key(event_name, channel);
        info!(event = %key, "Event broadcast");
        self.events.push(key, payload.clone());
        if let Some(bus) = self.bus.read().as_ref() {
            if let Err(e) = bus.publish_in(channel, event_name, payload) {
                warn!(event = %event_name, error = %e, "Bus mirror failed");
            }
        }
    }

    /// Acquires the variable write lock with bounded retries.
    ///
    /// Readers holding the shared lock during evaluation can starve a
    /// writer; three attempts with 100 ms backoff bound the wait.
    pub async fn lock_variables_for_write(
        &self,
        variable: &str,
    ) -> Result<parking_lot::RwLockWriteGuard<'_, HashMap<String, Variable>>, ScriptError> {
        for attempt in 0..3 {
            if let Some(guard) = self.variables.try_write() {
                return Ok(guard);
            }
            if attempt < 2 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Err(ScriptError::LockTimeout(variable.to_string()))
    }
}

/// Composes the queue key for an event on a channel.
#[must_use]
pub(crate) fn event_key(event_name: &str, channel: &str) -> String {
    format!("{event_name}@{channel}")
}

/// Default event channel when a step names none.
pub(crate) const DEFAULT_CHANNEL: &str = "default";

/// Stores a binding, enforcing type stability against an existing one.
pub(crate) fn store_variable(
    variables: &mut HashMap<String, Variable>,
    name: &str,
    value: Value,
) -> Result<(), ScriptError> {
    let ty = determine_type(&value);
    if let Some(existing) = variables.get(name) {
        if existing.ty != ty && existing.ty != VariableType::Unknown {
            return Err(ScriptError::TypeMismatch {
                variable: name.to_string(),
                expected: existing.ty,
                actual: ty,
            });
        }
    }
    variables.insert(name.to_string(), Variable { ty, value });
    Ok(())
}

fn builtin_print(params: &Value) -> Result<Value, ScriptError> {
    let text = match params.get("message") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => params.to_string(),
    };
    info!(message = %text, "print");
    Ok(Value::Null)
}

fn builtin_len(params: &Value) -> Result<Value, ScriptError> {
    let value = params
        .get("value")
        .ok_or_else(|| ScriptError::InvalidArgument("len requires 'value'".to_string()))?;
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        _ => {
            return Err(ScriptError::InvalidArgument(
                "len requires a string, array or object".to_string(),
            ))
        }
    };
    Ok(Value::from(len as i64))
}

fn builtin_to_int(params: &Value) -> Result<Value, ScriptError> {
    let value = params
        .get("value")
        .ok_or_else(|| ScriptError::InvalidArgument("to_int requires 'value'".to_string()))?;
    match value {
        Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or(0.0) as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| ScriptError::InvalidArgument(format!("not an integer: {s:?}"))),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        _ => Err(ScriptError::InvalidArgument(
            "to_int requires a number, string or boolean".to_string(),
        )),
    }
}

fn builtin_to_string(params: &Value) -> Result<Value, ScriptError> {
    let value = params
        .get("value")
        .ok_or_else(|| ScriptError::InvalidArgument("to_string requires 'value'".to_string()))?;
    Ok(Value::String(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variable_type_stability() {
        let interpreter = TaskInterpreter::new();
        interpreter
            .set_variable("x", json!(5))
            .expect("first bind should succeed");
        interpreter
            .set_variable("x", json!(6))
            .expect("same-type rebind should succeed");
        let err = interpreter
            .set_variable("x", json!("text"))
            .expect_err("type change should fail");
        assert!(matches!(err, ScriptError::TypeMismatch { .. }));
        assert_eq!(interpreter.get_variable("x"), Some(json!(6)));
        assert_eq!(interpreter.variable_type("x"), Some(VariableType::Number));
    }

    #[test]
    fn duplicate_function_rejected() {
        let interpreter = TaskInterpreter::new();
        interpreter
            .register_function("f", |_| Ok(Value::Null))
            .expect("first registration should succeed");
        let err = interpreter
            .register_function("f", |_| Ok(Value::Null))
            .expect_err("duplicate should fail");
        assert!(matches!(err, ScriptError::DuplicateFunction(_)));
    }

    #[test]
    fn builtins_present() {
        let interpreter = TaskInterpreter::new();
        for name in ["print", "len", "to_int", "to_string"] {
            assert!(interpreter.has_function(name), "missing builtin {name}");
        }
    }

    #[test]
    fn builtin_len_and_to_int() {
        assert_eq!(
            builtin_len(&json!({"value": "abcd"})).expect("len"),
            json!(4)
        );
        assert_eq!(
            builtin_len(&json!({"value": [1, 2, 3]})).expect("len"),
            json!(3)
        );
        assert_eq!(
            builtin_to_int(&json!({"value": "42"})).expect("to_int"),
            json!(42)
        );
        assert!(builtin_to_int(&json!({"value": "4x"})).is_err());
    }

    #[test]
    fn script_management() {
        let interpreter = TaskInterpreter::new();
        interpreter
            .load_script("a", json!([{"type": "print", "message": "hi"}]))
            .expect("load should succeed");
        assert!(interpreter.has_script("a"));
        assert!(interpreter.get_script("a").is_some());
        assert_eq!(interpreter.script_names(), vec!["a"]);
        assert!(interpreter.unload_script("a"));
        assert!(!interpreter.has_script("a"));
    }

    #[test]
    fn event_queue_overflow_discards_oldest() {
        let queue = EventQueue::new(2);
        queue.push("a@default".into(), json!(1));
        queue.push("b@default".into(), json!(2));
        queue.push("c@default".into(), json!(3));
        assert_eq!(queue.len(), 2);
        assert!(queue.take_matching(&["a@default".to_string()]).is_none());
        assert!(queue.take_matching(&["b@default".to_string()]).is_some());
    }

    #[test]
    fn event_queue_fifo_per_key() {
        let queue = EventQueue::new(10);
        queue.push("e@c".into(), json!(1));
        queue.push("e@c".into(), json!(2));
        let keys = vec!["e@c".to_string()];
        assert_eq!(queue.take_matching(&keys).expect("event").1, json!(1));
        assert_eq!(queue.take_matching(&keys).expect("event").1, json!(2));
    }

    #[test]
    fn custom_error_registry() {
        let interpreter = TaskInterpreter::new();
        interpreter.register_custom_error("device_timeout", 1404);
        assert_eq!(interpreter.custom_error_code("device_timeout"), Some(1404));
        assert_eq!(interpreter.custom_error_code("other"), None);
    }
}
