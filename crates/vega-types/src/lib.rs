//! Core types for the Vega device-control runtime.
//!
//! This crate is the bottom layer of the Vega workspace:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  vega-types     : ComponentKey, ErrorCode, VariableType     │
//! │  vega-event     : MessageBus                                │
//! │  vega-component : Component trait, manifests, registry      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  vega-runtime   : loader, resolver, supervisor, manager     │
//! │  vega-script    : JSON task interpreter                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here is dependency-light and safe to use from plugins:
//!
//! - [`ComponentKey`] - fully-qualified component names (`addon.component`)
//! - [`ErrorCode`] - unified machine-readable error interface
//! - [`VariableType`] / [`determine_type`] - runtime typing for script values
//! - [`RunId`] - per-execution identifier for log attribution

mod error;
mod key;
mod value;

pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use key::{ComponentKey, KeyError, RunId};
pub use value::{determine_type, VariableType};
