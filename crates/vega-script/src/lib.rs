//! JSON-script task interpreter for Vega.
//!
//! Scripts are JSON: a sequence of steps, each an object with a string
//! `type` and per-type fields. The interpreter executes them with full
//! control flow, closures, events, exceptions, parallelism, scheduling
//! and retries, orchestrating whatever functions the host registers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TaskInterpreter                        │
//! │  scripts / variables / functions / handlers / event queue    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  step machine (exec)  │  evaluate (eval)  │  expr (text)     │
//! └──────────────────────────────────────────────────────────────┘
//!          ▲                                   ▲
//!          │ registered functions              │ broadcast mirror
//!   host components                     MessageBus (vega-event)
//! ```
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use vega_script::TaskInterpreter;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let interpreter = TaskInterpreter::new();
//! interpreter
//!     .load_script(
//!         "warmup",
//!         json!([
//!             {"type": "assign", "variable": "x", "value": 5},
//!             {"type": "assign", "variable": "y", "value": {"$add": ["$x", 7]}}
//!         ]),
//!     )
//!     .unwrap();
//! interpreter.run("warmup").await.unwrap();
//! assert_eq!(interpreter.get_variable("y"), Some(json!(12)));
//! # }
//! ```

mod error;
mod eval;
mod exec;
mod expr;
mod generator;
mod interpreter;
mod program;

pub use error::ScriptError;
pub use expr::evaluate_expression;
pub use generator::{MacroDef, MacroFn, TaskGenerator};
pub use interpreter::{
    ExceptionHandler, NativeFunction, TaskInterpreter, DEFAULT_EVENT_CAPACITY,
};
pub use program::{Script, ScriptHeader};
