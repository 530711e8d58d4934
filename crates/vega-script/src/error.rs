//! Script fault taxonomy.
//!
//! Faults fall into three user-visible categories that `try`/`catch`
//! and `retry` steps match on: `runtime_error`, `invalid_argument` and
//! `out_of_range` (see [`ScriptError::kind`]). The concrete variants
//! keep enough structure for precise logs.

use thiserror::Error;
use vega_types::{ErrorCode, VariableType};

/// Fault raised while loading or executing a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Generic runtime fault; also what `throw {"exception_type":
    /// "runtime_error"}` produces.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Invalid argument fault, from `throw` or malformed expressions.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Out-of-range fault, from `throw` or range violations.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Assignment would change a variable's recorded type.
    #[error("type mismatch for {variable}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Variable being assigned.
        variable: String,
        /// Recorded type.
        expected: VariableType,
        /// Type of the new value.
        actual: VariableType,
    },

    /// Numeric division by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Step `type` is not in the vocabulary.
    #[error("unknown step type: {0}")]
    UnknownStep(String),

    /// A step lacks a required field.
    #[error("step {step} is missing field {field}")]
    MissingField {
        /// Step type.
        step: String,
        /// Missing field name.
        field: String,
    },

    /// `goto` targets a label that does not exist.
    #[error("unknown label: {0}")]
    UnknownLabel(String),

    /// A label was re-entered more than the per-execution limit allows.
    #[error("goto depth exceeded for label: {0}")]
    GotoDepthExceeded(String),

    /// No script loaded under this name.
    #[error("script not loaded: {0}")]
    ScriptNotFound(String),

    /// No function registered under this name.
    #[error("function not registered: {0}")]
    FunctionNotFound(String),

    /// A function name is already taken.
    #[error("function already registered: {0}")]
    DuplicateFunction(String),

    /// An expression references an unknown variable.
    #[error("variable not defined: {0}")]
    VariableNotFound(String),

    /// The script itself is malformed (bad exception type, non-object
    /// step, malformed header).
    #[error("invalid script: {0}")]
    InvalidScript(String),

    /// The variable write lock stayed contended through all retries.
    #[error("failed to acquire variable lock for {0}")]
    LockTimeout(String),

    /// Reading an imported script file failed.
    #[error("script I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing an imported script failed.
    #[error("script parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ScriptError {
    /// The `try`/`catch` matching category of this fault.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Runtime(_)
            | Self::DivisionByZero
            | Self::UnknownLabel(_)
            | Self::GotoDepthExceeded(_)
            | Self::ScriptNotFound(_)
            | Self::FunctionNotFound(_)
            | Self::VariableNotFound(_)
            | Self::LockTimeout(_)
            | Self::Io(_)
            | Self::Parse(_) => "runtime_error",
            Self::InvalidArgument(_)
            | Self::TypeMismatch { .. }
            | Self::UnknownStep(_)
            | Self::MissingField { .. }
            | Self::DuplicateFunction(_)
            | Self::InvalidScript(_) => "invalid_argument",
            Self::OutOfRange(_) => "out_of_range",
        }
    }

    /// Whether a catch clause with the given type name matches.
    #[must_use]
    pub fn matches(&self, catch_type: &str) -> bool {
        catch_type == "all" || catch_type == self.kind()
    }
}

impl ErrorCode for ScriptError {
    fn code(&self) -> &'static str {
        match self {
            Self::Runtime(_) => "SCRIPT_RUNTIME",
            Self::InvalidArgument(_) => "SCRIPT_INVALID_ARGUMENT",
            Self::OutOfRange(_) => "SCRIPT_OUT_OF_RANGE",
            Self::TypeMismatch { .. } => "SCRIPT_TYPE_MISMATCH",
            Self::DivisionByZero => "SCRIPT_DIVISION_BY_ZERO",
            Self::UnknownStep(_) => "SCRIPT_UNKNOWN_STEP",
            Self::MissingField { .. } => "SCRIPT_MISSING_FIELD",
            Self::UnknownLabel(_) => "SCRIPT_UNKNOWN_LABEL",
            Self::GotoDepthExceeded(_) => "SCRIPT_GOTO_DEPTH_EXCEEDED",
            Self::ScriptNotFound(_) => "SCRIPT_NOT_FOUND",
            Self::FunctionNotFound(_) => "SCRIPT_FUNCTION_NOT_FOUND",
            Self::DuplicateFunction(_) => "SCRIPT_DUPLICATE_FUNCTION",
            Self::VariableNotFound(_) => "SCRIPT_VARIABLE_NOT_FOUND",
            Self::InvalidScript(_) => "SCRIPT_INVALID",
            Self::LockTimeout(_) => "SCRIPT_LOCK_TIMEOUT",
            Self::Io(_) => "SCRIPT_IO",
            Self::Parse(_) => "SCRIPT_PARSE",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Runtime(_) | Self::LockTimeout(_) | Self::Io(_) | Self::DivisionByZero
        )
    }
}
