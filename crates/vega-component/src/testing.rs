//! Test support for component-based code.
//!
//! [`MockComponent`] records lifecycle calls and injected dependencies
//! so tests across the workspace can assert on ordering invariants
//! without loading real dynamic libraries.

use crate::{into_shared, Component, ComponentError, SharedComponent, WeakComponent};

/// A scriptable in-memory component.
///
/// # Example
///
/// ```
/// use vega_component::testing::MockComponent;
/// use vega_component::Component;
///
/// let mut mock = MockComponent::new("cam");
/// assert!(!mock.initialized());
/// mock.initialize().unwrap();
/// assert!(mock.initialized());
/// ```
pub struct MockComponent {
    name: String,
    initialized: bool,
    destroyed: bool,
    fail_initialize: bool,
    dependencies: Vec<(String, WeakComponent)>,
}

impl MockComponent {
    /// Creates a mock that succeeds at everything.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initialized: false,
            destroyed: false,
            fail_initialize: false,
            dependencies: Vec::new(),
        }
    }

    /// Makes `initialize` fail.
    #[must_use]
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Wraps a fresh mock in the shared handle form.
    #[must_use]
    pub fn shared(name: impl Into<String>) -> SharedComponent {
        into_shared(Box::new(Self::new(name)))
    }

    /// Whether `initialize` has run successfully.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Whether `destroy` has run.
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.destroyed
    }

    /// Names of injected dependencies, in injection order.
    #[must_use]
    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Whether every injected dependency currently upgrades.
    #[must_use]
    pub fn dependencies_alive(&self) -> bool {
        self.dependencies.iter().all(|(_, d)| d.upgrade().is_some())
    }
}

impl Component for MockComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), ComponentError> {
        if self.fail_initialize {
            return Err(ComponentError::InitFailed("mock configured to fail".into()));
        }
        self.initialized = true;
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), ComponentError> {
        self.destroyed = true;
        self.initialized = false;
        Ok(())
    }

    fn add_dependency(&mut self, name: &str, dep: WeakComponent) {
        self.dependencies.push((name.to_string(), dep));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn records_lifecycle() {
        let mut mock = MockComponent::new("m");
        mock.initialize().expect("initialize should succeed");
        assert!(mock.initialized());
        mock.destroy().expect("destroy should succeed");
        assert!(mock.destroyed());
        assert!(!mock.initialized());
    }

    #[test]
    fn failing_initialize() {
        let mut mock = MockComponent::new("m").failing_initialize();
        assert!(mock.initialize().is_err());
        assert!(!mock.initialized());
    }

    #[test]
    fn records_dependencies() {
        let dep = MockComponent::shared("dep");
        let mut mock = MockComponent::new("m");
        mock.add_dependency("addon.dep", Arc::downgrade(&dep));

        assert_eq!(mock.dependency_names(), vec!["addon.dep"]);
        assert!(mock.dependencies_alive());
        drop(dep);
        assert!(!mock.dependencies_alive());
    }
}
