//! The component capability trait and shared handle aliases.

use crate::ComponentError;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};

/// A named, dependency-aware unit managed by the runtime.
///
/// Components come in two flavors that both implement this trait:
///
/// - **Shared components** are loaded in-process from a dynamic library
///   via a factory symbol.
/// - **Standalone proxies** front an external driver process supervised
///   over pipes.
///
/// # Lifecycle
///
/// ```text
/// factory ──► add_dependency(..)* ──► initialize() ──► (in registry) ──► destroy()
/// ```
///
/// Dependencies are injected *before* `initialize` is called and every
/// dependency is itself initialized by that point; implementations may
/// upgrade and use them from `initialize` onward.
pub trait Component: Send + Sync {
    /// The component's own name (not the fully-qualified form).
    fn name(&self) -> &str;

    /// Brings the component to its operational state.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InitFailed`] (or any other variant) to
    /// reject the load; the manager rolls the registration back.
    fn initialize(&mut self) -> Result<(), ComponentError>;

    /// Tears the component down. Called exactly once, after the
    /// component leaves the registry.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::DestroyFailed`] when teardown could not
    /// complete; the registry entry is removed regardless.
    fn destroy(&mut self) -> Result<(), ComponentError>;

    /// Hands the component a weak reference to one of its declared
    /// dependencies, keyed by the dependency's fully-qualified name.
    fn add_dependency(&mut self, name: &str, dep: WeakComponent);
}

impl fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component").field("name", &self.name()).finish()
    }
}

/// Interior-mutable cell holding a live component.
pub type ComponentCell = RwLock<Box<dyn Component>>;

/// Strong handle to a live component. Held by the registry.
pub type SharedComponent = Arc<ComponentCell>;

/// Weak handle used for dependency injection; upgrade per call.
pub type WeakComponent = Weak<ComponentCell>;

/// Wraps a boxed component into the shared handle form.
#[must_use]
pub fn into_shared(component: Box<dyn Component>) -> SharedComponent {
    Arc::new(RwLock::new(component))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockComponent;

    #[test]
    fn shared_handle_upgrades_and_drops() {
        let shared = into_shared(Box::new(MockComponent::new("m")));
        let weak: WeakComponent = Arc::downgrade(&shared);

        assert!(weak.upgrade().is_some());
        drop(shared);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn initialize_through_cell() {
        let shared = into_shared(Box::new(MockComponent::new("m")));
        shared
            .write()
            .initialize()
            .expect("mock initialize should succeed");
        assert_eq!(shared.read().name(), "m");
    }
}
