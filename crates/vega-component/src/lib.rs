//! Component system for Vega.
//!
//! This crate defines what a component *is* and how components are
//! declared and looked up. It sits between `vega-types` and the runtime:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ComponentManager                       │
//! │                       (vega-runtime)                         │
//! └──────────────────────────────────────────────────────────────┘
//!        │ discovers                │ publishes
//!        ▼                          ▼
//! ┌──────────────────┐      ┌────────────────────┐
//! │  AddonManifest   │      │  ComponentRegistry │
//! │  AddonRegistry   │      │  (strong + weak)   │
//! └──────────────────┘      └────────────────────┘
//!        │ declares                 │ injects Weak refs
//!        ▼                          ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Component trait: name / initialize / destroy / add_dependency │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ownership model
//!
//! Strong ownership of a live component exists in exactly one place:
//! the [`ComponentRegistry`]. Everyone else - most importantly other
//! components that depend on it - holds a [`WeakComponent`] and upgrades
//! for the duration of a call. This is what makes dependency cycles
//! between components harmless at destruction time.
//!
//! # Example
//!
//! ```
//! use vega_component::{Component, ComponentError, ComponentRegistry, WeakComponent};
//!
//! struct Focuser {
//!     name: String,
//!     ready: bool,
//! }
//!
//! impl Component for Focuser {
//!     fn name(&self) -> &str {
//!         &self.name
//!     }
//!
//!     fn initialize(&mut self) -> Result<(), ComponentError> {
//!         self.ready = true;
//!         Ok(())
//!     }
//!
//!     fn destroy(&mut self) -> Result<(), ComponentError> {
//!         self.ready = false;
//!         Ok(())
//!     }
//!
//!     fn add_dependency(&mut self, _name: &str, _dep: WeakComponent) {}
//! }
//!
//! let registry = ComponentRegistry::new();
//! let focuser = vega_component::into_shared(Box::new(Focuser {
//!     name: "zwo_eaf".into(),
//!     ready: false,
//! }));
//! registry.add("focuser.zwo_eaf", focuser).unwrap();
//! assert!(registry.contains("focuser.zwo_eaf"));
//! ```

mod component;
mod entry;
mod error;
mod manifest;
mod registry;
pub mod testing;

pub use component::{into_shared, Component, ComponentCell, SharedComponent, WeakComponent};
pub use entry::{ComponentEntry, ComponentKind};
pub use error::ComponentError;
pub use manifest::{AddonManifest, AddonRegistry, ManifestError, ModuleDecl, MANIFEST_FILE};
pub use registry::{ComponentRegistry, RegistryError};
