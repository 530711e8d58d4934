//! Runtime layer of Vega: dynamic loading, dependency resolution,
//! process supervision and the component manager.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ComponentManager                        │
//! │   discovery → verification → ordered load → wiring → init   │
//! └──────────────────────────────────────────────────────────────┘
//!     │               │                │                │
//!     ▼               ▼                ▼                ▼
//! ┌─────────┐  ┌──────────────┐  ┌────────────┐  ┌──────────────────┐
//! │Resolver │  │ AddonRegistry│  │ModuleLoader│  │ComponentRegistry │
//! │ (order) │  │ (manifests)  │  │ (dylibs)   │  │ (live instances) │
//! └─────────┘  └──────────────┘  └────────────┘  └──────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────┐
//! │  StandaloneSupervisor: external driver processes over pipes  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager is handed its collaborators explicitly; nothing in this
//! crate is a process-wide singleton.

mod config;
mod loader;
mod manager;
mod resolver;
mod standalone;

pub use config::RuntimeConfig;
pub use loader::{ComponentCtor, LoaderError, ModuleLoader};
pub use manager::{ComponentManager, ManagerError};
pub use resolver::{
    order_modules, qualified_subdirs, resolve_directory, DependencyGraph, ResolveError,
};
pub use standalone::{
    DriverOutputHandler, LogOutputHandler, StandaloneSupervisor, SupervisorError,
};
