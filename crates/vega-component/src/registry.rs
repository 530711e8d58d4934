//! The component registry: the single strong owner of live components.

use crate::{SharedComponent, WeakComponent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use vega_types::ErrorCode;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A component with this fully-qualified name already exists.
    #[error("component already registered: {0}")]
    Duplicate(String),

    /// No component with this fully-qualified name.
    #[error("component not registered: {0}")]
    NotFound(String),

    /// Strong borrows of the component exist outside the registry.
    #[error("component still borrowed: {0}")]
    StillBorrowed(String),
}

impl ErrorCode for RegistryError {
    fn code(&self) -> &'static str {
        match self {
            Self::Duplicate(_) => "REGISTRY_DUPLICATE",
            Self::NotFound(_) => "REGISTRY_NOT_FOUND",
            Self::StillBorrowed(_) => "REGISTRY_STILL_BORROWED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::StillBorrowed(_))
    }
}

/// Maps fully-qualified component names to live instances.
///
/// The registry holds the only long-lived strong reference to each
/// component. Dependents receive [`WeakComponent`] borrows via
/// [`weak`](Self::weak) and upgrade per call, so removing a component
/// from the registry is what ends its life.
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<HashMap<String, SharedComponent>>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a component under its fully-qualified name.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::Duplicate`] when the name is taken;
    /// the registry is left unchanged.
    pub fn add(&self, fqn: impl Into<String>, instance: SharedComponent) -> Result<(), RegistryError> {
        let fqn = fqn.into();
        let mut map = self.components.write();
        if map.contains_key(&fqn) {
            return Err(RegistryError::Duplicate(fqn));
        }
        debug!(name = %fqn, "Component registered");
        map.insert(fqn, instance);
        Ok(())
    }

    /// Returns a strong handle for the duration of a call.
    #[must_use]
    pub fn get(&self, fqn: &str) -> Option<SharedComponent> {
        self.components.read().get(fqn).cloned()
    }

    /// Returns a weak borrow for dependency injection.
    #[must_use]
    pub fn weak(&self, fqn: &str) -> Option<WeakComponent> {
        self.components.read().get(fqn).map(Arc::downgrade)
    }

    /// Removes a component from the registry.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::NotFound`] when absent, or with
    /// [`RegistryError::StillBorrowed`] when a caller has upgraded a
    /// weak borrow and still holds the strong handle.
    pub fn remove(&self, fqn: &str) -> Result<SharedComponent, RegistryError> {
        let mut map = self.components.write();
        let Some(instance) = map.get(fqn) else {
            return Err(RegistryError::NotFound(fqn.to_string()));
        };
        if Arc::strong_count(instance) > 1 {
            return Err(RegistryError::StillBorrowed(fqn.to_string()));
        }
        let instance = map.remove(fqn).expect("checked above");
        debug!(name = %fqn, "Component removed");
        Ok(instance)
    }

    /// Whether a component is registered under `fqn`.
    #[must_use]
    pub fn contains(&self, fqn: &str) -> bool {
        self.components.read().contains_key(fqn)
    }

    /// Registered names, sorted lexicographically.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.components.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.read().is_empty()
    }
}
