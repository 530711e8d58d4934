//! Bus errors.

use thiserror::Error;
use vega_types::ErrorCode;

/// Message bus error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus has been stopped; no further messages are accepted.
    #[error("message bus is stopped")]
    Stopped,
}

impl ErrorCode for BusError {
    fn code(&self) -> &'static str {
        match self {
            Self::Stopped => "BUS_STOPPED",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}
