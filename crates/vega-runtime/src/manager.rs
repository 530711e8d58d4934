//! The component manager: discovery, ordered load, wiring, lifecycle.
//!
//! `initialize()` walks the module root in dependency order and brings
//! every declared component up:
//!
//! ```text
//! resolve_directory(root)            (§ resolver)
//!   └─ per addon dir, in order:
//!        AddonRegistry::add_module   (manifest validation; invalid ⇒ skip + log)
//!        order_modules               (intra-addon dependency order)
//!          └─ per module:
//!               ModuleLoader::load
//!               ModuleLoader::instance
//!               inject weak deps     (empty names ⇒ warning)
//!               Component::initialize
//!               ComponentRegistry::add
//! ```
//!
//! Any failure mid-sequence issues compensating operations so the
//! loader and registry end in their prior state.

use crate::config::normalize_separators;
use crate::{
    order_modules, resolve_directory, LoaderError, ModuleLoader, ResolveError, RuntimeConfig,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use vega_component::{
    AddonRegistry, ComponentEntry, ComponentError, ComponentRegistry, ManifestError,
    RegistryError, WeakComponent,
};
use vega_types::{ComponentKey, ErrorCode};

/// Component manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Discovery or ordering failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A module operation failed.
    #[error(transparent)]
    Loader(#[from] LoaderError),

    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A manifest operation failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// A declared dependency is not in the registry.
    #[error("{component} depends on {dependency}, which is not loaded")]
    MissingDependency {
        /// Component being loaded.
        component: String,
        /// Unresolved dependency name.
        dependency: String,
    },

    /// The component's `initialize` rejected the load.
    #[error("failed to initialize {component}: {source}")]
    InitFailed {
        /// Component being loaded.
        component: String,
        /// Component-reported failure.
        #[source]
        source: ComponentError,
    },

    /// No component loaded under this name.
    #[error("component not loaded: {0}")]
    NotLoaded(String),

    /// Unload refused because dependents are still loaded.
    #[error("component {component} has live dependents: {dependents:?}")]
    HasDependents {
        /// Target of the unload.
        component: String,
        /// Components that depend on it.
        dependents: Vec<String>,
    },

    /// The manifest declared an empty factory entry.
    #[error("component {0} declares an empty entry symbol")]
    EmptyEntry(String),
}

impl ErrorCode for ManagerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Resolve(e) => e.code(),
            Self::Loader(e) => e.code(),
            Self::Registry(e) => e.code(),
            Self::Manifest(e) => e.code(),
            Self::MissingDependency { .. } => "MANAGER_MISSING_DEPENDENCY",
            Self::InitFailed { .. } => "MANAGER_INIT_FAILED",
            Self::NotLoaded(_) => "MANAGER_NOT_LOADED",
            Self::HasDependents { .. } => "MANAGER_HAS_DEPENDENTS",
            Self::EmptyEntry(_) => "MANAGER_EMPTY_ENTRY",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Resolve(e) => e.is_recoverable(),
            Self::Loader(e) => e.is_recoverable(),
            Self::Registry(e) => e.is_recoverable(),
            Self::Manifest(e) => e.is_recoverable(),
            Self::InitFailed { .. } | Self::HasDependents { .. } => true,
            Self::MissingDependency { .. } | Self::NotLoaded(_) | Self::EmptyEntry(_) => false,
        }
    }
}

/// Orchestrates loader, manifests, resolver and registry into the
/// public load/unload/reload contract.
pub struct ComponentManager {
    loader: Arc<ModuleLoader>,
    addons: Arc<AddonRegistry>,
    registry: Arc<ComponentRegistry>,
    config: RuntimeConfig,
    entries: RwLock<HashMap<String, ComponentEntry>>,
}

impl ComponentManager {
    /// Creates a manager over explicit collaborators.
    #[must_use]
    pub fn new(
        loader: Arc<ModuleLoader>,
        addons: Arc<AddonRegistry>,
        registry: Arc<ComponentRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            loader,
            addons,
            registry,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Discovers and loads every qualified addon under the module root.
    ///
    /// A missing root or a root without qualified subdirectories is
    /// success with nothing loaded. Invalid manifests are skipped with
    /// a log entry; load faults are fatal and abort startup.
    ///
    /// # Errors
    ///
    /// Propagates resolution and load faults.
    pub fn initialize(&self) -> Result<(), ManagerError> {
        let root = self.config.resolved_module_root();
        if !root.is_dir() {
            info!(root = %root.display(), "Module root absent, skipping module loading");
            return Ok(());
        }

        let dirs = resolve_directory(&root)?;
        if dirs.is_empty() {
            info!(root = %root.display(), "No qualified modules found");
            return Ok(());
        }
        info!(root = %root.display(), count = dirs.len(), "Loading modules");

        for dir in dirs {
            let key = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Err(e) = self.addons.add_module(&dir, &key) {
                warn!(dir = %dir.display(), error = %e, "Skipping addon with invalid manifest");
                continue;
            }
            let manifest = self.addons.get_module(&key)?;
            info!(addon = %manifest.name, "Loading addon");

            let ordered = match order_modules(&manifest.name, &manifest.modules) {
                Ok(ordered) => ordered,
                Err(e) => {
                    warn!(addon = %manifest.name, error = %e, "Skipping addon with unresolvable modules");
                    self.addons.remove_module(&key);
                    continue;
                }
            };

            for module in ordered {
                let library = dir.join(format!(
                    "{}{}",
                    module.name,
                    std::env::consts::DLL_SUFFIX
                ));
                self.load_shared_component(
                    &module.name,
                    &manifest.name,
                    &library,
                    &module.entry,
                    &module.dependencies,
                )?;
            }
        }
        Ok(())
    }

    /// Loads, wires and initializes one shared component.
    ///
    /// # Errors
    ///
    /// Any fault rolls back the partial load and leaves loader and
    /// registry unchanged.
    pub fn load_shared_component(
        &self,
        component: &str,
        addon: &str,
        library: &Path,
        entry: &str,
        dependencies: &[String],
    ) -> Result<(), ManagerError> {
        let key = ComponentKey::new(addon, component);
        let fqn = key.fqn();
        if entry.is_empty() {
            return Err(ManagerError::EmptyEntry(fqn));
        }

        let library = normalize_separators(library);
        self.loader.load(&library, &fqn)?;

        let instance = match self.loader.instance(&fqn, entry) {
            Ok(instance) => instance,
            Err(e) => {
                self.rollback_module(&fqn);
                return Err(e.into());
            }
        };

        for dependency in dependencies {
            if dependency.is_empty() {
                warn!(component = %fqn, "Empty dependency name ignored");
                continue;
            }
            let Some(weak) = self.registry.weak(dependency) else {
                self.rollback_module(&fqn);
                return Err(ManagerError::MissingDependency {
                    component: fqn,
                    dependency: dependency.clone(),
                });
            };
            instance.write().add_dependency(dependency, weak);
        }

        if let Err(e) = instance.write().initialize() {
            self.rollback_module(&fqn);
            return Err(ManagerError::InitFailed {
                component: fqn,
                source: e,
            });
        }

        if let Err(e) = self.registry.add(&fqn, Arc::clone(&instance)) {
            if let Err(destroy_err) = instance.write().destroy() {
                error!(component = %fqn, error = %destroy_err, "Destroy after failed publish");
            }
            drop(instance);
            self.rollback_module(&fqn);
            return Err(e.into());
        }

        self.entries.write().insert(
            fqn.clone(),
            ComponentEntry::shared(key, entry, library, dependencies.to_vec()),
        );
        info!(component = %fqn, "Loaded shared component");
        Ok(())
    }

    /// Unloads a component.
    ///
    /// With `forced == false` the call fails while dependents are
    /// loaded. With `forced == true` dependents are torn down first, so
    /// destruction walks in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Fails when the component is unknown, has dependents (unforced),
    /// or is still borrowed; failures leave the registry unchanged.
    pub fn unload_component(&self, fqn: &str, forced: bool) -> Result<(), ManagerError> {
        if !self.entries.read().contains_key(fqn) {
            return Err(ManagerError::NotLoaded(fqn.to_string()));
        }

        let dependents = self.dependents_of(fqn);
        if !dependents.is_empty() {
            if !forced {
                return Err(ManagerError::HasDependents {
                    component: fqn.to_string(),
                    dependents,
                });
            }
            for dependent in dependents {
                self.unload_component(&dependent, true)?;
            }
        }

        let instance = self.registry.remove(fqn)?;
        if let Err(e) = instance.write().destroy() {
            error!(component = %fqn, error = %e, "Component destroy failed");
        }
        drop(instance);

        match self.loader.unload(fqn) {
            // Standalone and adopted components never had a module.
            Ok(()) | Err(LoaderError::NotLoaded(_)) => {}
            Err(e) => {
                warn!(component = %fqn, error = %e, "Module release deferred");
            }
        }

        self.entries.write().remove(fqn);
        info!(component = %fqn, "Unloaded shared component");
        Ok(())
    }

    /// Reloads a component: unload (dependents must be gone) then load
    /// with the recorded entry.
    ///
    /// # Errors
    ///
    /// Propagates unload and load faults.
    pub fn reload_component(&self, fqn: &str) -> Result<(), ManagerError> {
        let entry = self
            .entries
            .read()
            .get(fqn)
            .cloned()
            .ok_or_else(|| ManagerError::NotLoaded(fqn.to_string()))?;

        self.unload_component(fqn, false)?;
        self.load_shared_component(
            entry.key.component(),
            entry.key.addon(),
            &entry.origin_module,
            &entry.entry_symbol,
            &entry.dependencies,
        )
    }

    /// Weak borrow of a loaded component.
    #[must_use]
    pub fn component(&self, fqn: &str) -> Option<WeakComponent> {
        self.registry.weak(fqn)
    }

    /// Recorded entry descriptor of a loaded component.
    #[must_use]
    pub fn entry(&self, fqn: &str) -> Option<ComponentEntry> {
        self.entries.read().get(fqn).cloned()
    }

    /// Fully-qualified names of loaded components, sorted.
    #[must_use]
    pub fn component_list(&self) -> Vec<String> {
        let mut list: Vec<String> = self.entries.read().keys().cloned().collect();
        list.sort();
        list
    }

    /// Components whose entries declare `fqn` as a dependency.
    fn dependents_of(&self, fqn: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.depends_on(fqn))
            .map(|(name, _)| name.clone())
            .collect();
        dependents.sort();
        dependents
    }

    fn rollback_module(&self, fqn: &str) {
        if let Err(e) = self.loader.unload(fqn) {
            warn!(component = %fqn, error = %e, "Rollback unload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vega_component::testing::MockComponent;
    use vega_component::MANIFEST_FILE;

    fn manager_with_root(root: &Path) -> ComponentManager {
        ComponentManager::new(
            Arc::new(ModuleLoader::new()),
            Arc::new(AddonRegistry::new()),
            Arc::new(ComponentRegistry::new()),
            RuntimeConfig::default()
                .with_module_root(root)
                .with_module_path_env("VEGA_TEST_UNSET_MODULE_PATH"),
        )
    }

    /// Registers a mock-backed component as if it had been loaded.
    fn adopt_mock(manager: &ComponentManager, fqn: &str, dependencies: Vec<String>) {
        let key: ComponentKey = fqn.parse().expect("valid fqn");
        manager
            .registry
            .add(fqn, MockComponent::shared(key.component()))
            .expect("registry add");
        manager.entries.write().insert(
            fqn.to_string(),
            ComponentEntry::shared(key, "create", "/dev/null", dependencies),
        );
    }

    #[test]
    fn initialize_with_missing_root_succeeds() {
        let manager = manager_with_root(Path::new("/nonexistent/modules"));
        manager.initialize().expect("missing root is success");
        assert!(manager.component_list().is_empty());
    }

    #[test]
    fn initialize_with_empty_root_succeeds() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_root(root.path());
        manager.initialize().expect("empty root is success");
        assert!(manager.component_list().is_empty());
    }

    #[test]
    fn initialize_skips_invalid_manifest() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("broken");
        std::fs::create_dir(&dir).expect("mkdir");
        std::fs::write(dir.join(MANIFEST_FILE), json!({"modules": []}).to_string())
            .expect("write manifest");
        std::fs::write(
            dir.join(format!("x{}", std::env::consts::DLL_SUFFIX)),
            b"",
        )
        .expect("write library stub");

        let manager = manager_with_root(root.path());
        manager.initialize().expect("invalid manifest is skipped");
        assert!(manager.component_list().is_empty());
    }

    #[test]
    fn load_rejects_empty_entry() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_root(root.path());
        let err = manager
            .load_shared_component("cam", "addon", Path::new("/tmp/x.so"), "", &[])
            .expect_err("empty entry should fail");
        assert!(matches!(err, ManagerError::EmptyEntry(_)));
    }

    #[test]
    fn load_missing_library_leaves_state() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_root(root.path());
        let err = manager
            .load_shared_component(
                "cam",
                "addon",
                Path::new("/nonexistent/cam.so"),
                "create_cam",
                &[],
            )
            .expect_err("missing library should fail");
        assert!(matches!(err, ManagerError::Loader(_)));
        assert!(manager.component_list().is_empty());
        assert!(manager.registry.is_empty());
    }

    #[test]
    fn unload_unknown_fails() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_root(root.path());
        assert!(matches!(
            manager.unload_component("nope.nope", false),
            Err(ManagerError::NotLoaded(_))
        ));
    }

    #[test]
    fn unload_with_dependents_requires_force() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_root(root.path());
        adopt_mock(&manager, "core.env", vec![]);
        adopt_mock(&manager, "camera.qhy", vec!["core.env".into()]);
        adopt_mock(&manager, "guide.phd", vec!["camera.qhy".into()]);

        let err = manager
            .unload_component("core.env", false)
            .expect_err("dependents should block unload");
        assert!(
            matches!(err, ManagerError::HasDependents { ref dependents, .. }
                if dependents == &vec!["camera.qhy".to_string()])
        );

        manager
            .unload_component("core.env", true)
            .expect("forced unload should cascade");
        assert!(manager.component_list().is_empty());
        assert!(manager.registry.is_empty());
    }

    #[test]
    fn component_lookup_and_listing() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_root(root.path());
        adopt_mock(&manager, "mount.eq6", vec![]);
        adopt_mock(&manager, "camera.qhy", vec![]);

        assert!(manager.component("mount.eq6").is_some());
        assert!(manager.component("nope.nope").is_none());
        assert_eq!(manager.component_list(), vec!["camera.qhy", "mount.eq6"]);
        assert_eq!(
            manager.entry("mount.eq6").expect("entry").key.fqn(),
            "mount.eq6"
        );
    }

    #[test]
    fn error_codes_valid() {
        use vega_types::assert_error_codes;
        assert_error_codes(
            &[
                ManagerError::MissingDependency {
                    component: "a".into(),
                    dependency: "b".into(),
                },
                ManagerError::NotLoaded("a".into()),
                ManagerError::HasDependents {
                    component: "a".into(),
                    dependents: vec![],
                },
                ManagerError::EmptyEntry("a".into()),
            ],
            "MANAGER_",
        );
    }
}
