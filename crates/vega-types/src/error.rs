//! Unified error interface for Vega.
//!
//! Every error enum in the workspace implements [`ErrorCode`] so that
//! the interpreter, the manager and the CLI can log and match errors
//! without knowing the concrete type.

/// Unified error code interface.
///
/// # Code Format
///
/// - **UPPER_SNAKE_CASE**: e.g. `"LOADER_NOT_FOUND"`
/// - **Crate-prefixed**: `LOADER_`, `MANAGER_`, `SCRIPT_`, `BUS_`, ...
/// - **Stable**: codes are an API contract and never change once defined
///
/// # Recoverability
///
/// An error is recoverable when retrying the operation may succeed
/// (transient conditions: timeouts, a driver that died and will be
/// restarted). Invalid input, duplicate registration and cycle errors
/// are not.
///
/// # Example
///
/// ```
/// use vega_types::ErrorCode;
///
/// #[derive(Debug)]
/// enum ProbeError {
///     Timeout,
///     BadAddress(String),
/// }
///
/// impl ErrorCode for ProbeError {
///     fn code(&self) -> &'static str {
///         match self {
///             Self::Timeout => "PROBE_TIMEOUT",
///             Self::BadAddress(_) => "PROBE_BAD_ADDRESS",
///         }
///     }
///
///     fn is_recoverable(&self) -> bool {
///         matches!(self, Self::Timeout)
///     }
/// }
///
/// assert_eq!(ProbeError::Timeout.code(), "PROBE_TIMEOUT");
/// ```
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;

    /// Returns whether retrying the failed operation may succeed.
    fn is_recoverable(&self) -> bool;
}

/// Validates that an error code follows Vega conventions.
///
/// # Panics
///
/// Panics with a descriptive message when the code is empty, has the
/// wrong prefix, or is not UPPER_SNAKE_CASE. Intended for tests.
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "Error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "Error code '{code}' must start with prefix '{expected_prefix}'"
    );
    assert!(
        is_upper_snake_case(code),
        "Error code '{code}' must be UPPER_SNAKE_CASE"
    );
}

/// Validates every variant of an error enum at once.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
