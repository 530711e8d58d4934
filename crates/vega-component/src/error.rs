//! Component lifecycle errors.
//!
//! # Error Code Convention
//!
//! | Error | Code | Recoverable |
//! |-------|------|-------------|
//! | [`InitFailed`](ComponentError::InitFailed) | `COMPONENT_INIT_FAILED` | Yes |
//! | [`DestroyFailed`](ComponentError::DestroyFailed) | `COMPONENT_DESTROY_FAILED` | No |
//! | [`NotSupported`](ComponentError::NotSupported) | `COMPONENT_NOT_SUPPORTED` | No |
//! | [`ExecutionFailed`](ComponentError::ExecutionFailed) | `COMPONENT_EXECUTION_FAILED` | Yes |

use thiserror::Error;
use vega_types::ErrorCode;

/// Error raised by a component implementation.
#[derive(Debug, Clone, Error)]
pub enum ComponentError {
    /// `initialize` could not bring the component up.
    ///
    /// **Recoverable** - a retry (possibly after reconfiguration or a
    /// device reconnect) may succeed.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// `destroy` could not complete teardown.
    #[error("destroy failed: {0}")]
    DestroyFailed(String),

    /// The component does not implement the requested capability.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// A component operation failed at runtime.
    ///
    /// **Recoverable** - transient device and I/O failures land here.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl ErrorCode for ComponentError {
    fn code(&self) -> &'static str {
        match self {
            Self::InitFailed(_) => "COMPONENT_INIT_FAILED",
            Self::DestroyFailed(_) => "COMPONENT_DESTROY_FAILED",
            Self::NotSupported(_) => "COMPONENT_NOT_SUPPORTED",
            Self::ExecutionFailed(_) => "COMPONENT_EXECUTION_FAILED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::InitFailed(_) | Self::ExecutionFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vega_types::assert_error_codes;

    fn all_variants() -> Vec<ComponentError> {
        vec![
            ComponentError::InitFailed("x".into()),
            ComponentError::DestroyFailed("x".into()),
            ComponentError::NotSupported("x".into()),
            ComponentError::ExecutionFailed("x".into()),
        ]
    }

    #[test]
    fn all_error_codes_valid() {
        assert_error_codes(&all_variants(), "COMPONENT_");
    }

    #[test]
    fn recoverability() {
        assert!(ComponentError::InitFailed("x".into()).is_recoverable());
        assert!(ComponentError::ExecutionFailed("x".into()).is_recoverable());
        assert!(!ComponentError::NotSupported("x".into()).is_recoverable());
        assert!(!ComponentError::DestroyFailed("x".into()).is_recoverable());
    }
}
