//! Dynamic library loading and component instantiation.
//!
//! The [`ModuleLoader`] opens shared libraries under registered logical
//! names and instantiates components through exported factory symbols.
//!
//! # Factory contract
//!
//! A component library exports one zero-argument factory per declared
//! component:
//!
//! ```ignore
//! #[no_mangle]
//! pub extern "Rust" fn create_qhy_ccd() -> Box<dyn vega_component::Component> {
//!     Box::new(QhyCcd::default())
//! }
//! ```
//!
//! # Unload safety
//!
//! Every instance produced by [`ModuleLoader::instance`] keeps the
//! library handle alive: the instance wraps an `Arc<Library>` that is
//! dropped strictly after the component it created. [`unload`]
//! (ModuleLoader::unload) refuses to drop a library while instances
//! remain.

use libloading::Library;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use vega_component::{into_shared, Component, ComponentError, SharedComponent, WeakComponent};
use vega_types::ErrorCode;

/// Factory symbol signature: a zero-argument constructor returning an
/// owning component handle.
pub type ComponentCtor = unsafe extern "Rust" fn() -> Box<dyn Component>;

/// Module loading errors.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// A module is already registered under this logical name.
    #[error("module already loaded: {0}")]
    AlreadyLoaded(String),

    /// The library file does not exist.
    #[error("module file not found: {0}")]
    FileNotFound(PathBuf),

    /// The dynamic linker rejected the library.
    #[error("failed to open module {name}: {reason}")]
    OpenFailed {
        /// Logical module name.
        name: String,
        /// Linker error text.
        reason: String,
    },

    /// The requested symbol is not exported by the module.
    #[error("symbol {symbol} not found in module {name}")]
    SymbolNotFound {
        /// Logical module name.
        name: String,
        /// Factory symbol that was looked up.
        symbol: String,
    },

    /// No module registered under this logical name.
    #[error("module not loaded: {0}")]
    NotLoaded(String),

    /// Instances created from the module are still alive.
    #[error("module still referenced: {0}")]
    StillReferenced(String),
}

impl ErrorCode for LoaderError {
    fn code(&self) -> &'static str {
        match self {
            Self::AlreadyLoaded(_) => "LOADER_ALREADY_LOADED",
            Self::FileNotFound(_) => "LOADER_FILE_NOT_FOUND",
            Self::OpenFailed { .. } => "LOADER_OPEN_FAILED",
            Self::SymbolNotFound { .. } => "LOADER_SYMBOL_NOT_FOUND",
            Self::NotLoaded(_) => "LOADER_NOT_LOADED",
            Self::StillReferenced(_) => "LOADER_STILL_REFERENCED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::StillReferenced(_))
    }
}

struct ModuleHandle {
    library: Arc<Library>,
    path: PathBuf,
}

/// Loads and unloads shared libraries by logical name.
#[derive(Default)]
pub struct ModuleLoader {
    modules: RwLock<HashMap<String, ModuleHandle>>,
}

impl ModuleLoader {
    /// Creates an empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the library at `path` under the logical name `name`.
    ///
    /// # Errors
    ///
    /// Fails when `name` is taken, `path` is missing, or the linker
    /// rejects the library. Failure leaves the loader unchanged.
    pub fn load(&self, path: &Path, name: &str) -> Result<(), LoaderError> {
        let mut modules = self.modules.write();
        if modules.contains_key(name) {
            return Err(LoaderError::AlreadyLoaded(name.to_string()));
        }
        if !path.exists() {
            return Err(LoaderError::FileNotFound(path.to_path_buf()));
        }

        info!(name = %name, path = %path.display(), "Loading module");
        // SAFETY: loading a library runs its initializers; the module
        // contract restricts libraries to component factories.
        let library = unsafe { Library::new(path) }.map_err(|e| LoaderError::OpenFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        modules.insert(
            name.to_string(),
            ModuleHandle {
                library: Arc::new(library),
                path: path.to_path_buf(),
            },
        );
        Ok(())
    }

    /// Whether a module is registered under `name`.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    /// Whether `name` exports `symbol`.
    #[must_use]
    pub fn has_symbol(&self, name: &str, symbol: &str) -> bool {
        let modules = self.modules.read();
        let Some(handle) = modules.get(name) else {
            return false;
        };
        // SAFETY: the symbol is only probed for presence, never called.
        unsafe {
            handle
                .library
                .get::<ComponentCtor>(symbol.as_bytes())
                .is_ok()
        }
    }

    /// Instantiates a component by calling the factory `entry` in `name`.
    ///
    /// The returned handle keeps the library alive until dropped.
    ///
    /// # Errors
    ///
    /// Fails when the module is not loaded or the symbol is missing.
    pub fn instance(&self, name: &str, entry: &str) -> Result<SharedComponent, LoaderError> {
        let modules = self.modules.read();
        let Some(handle) = modules.get(name) else {
            return Err(LoaderError::NotLoaded(name.to_string()));
        };

        // SAFETY: the factory contract (see module docs) guarantees the
        // symbol is a zero-argument constructor returning an owning
        // component handle.
        let component = unsafe {
            let ctor = handle
                .library
                .get::<ComponentCtor>(entry.as_bytes())
                .map_err(|_| LoaderError::SymbolNotFound {
                    name: name.to_string(),
                    symbol: entry.to_string(),
                })?;
            ctor()
        };

        debug!(name = %name, entry = %entry, "Instantiated component");
        Ok(into_shared(Box::new(PluginInstance {
            inner: component,
            _library: Arc::clone(&handle.library),
        })))
    }

    /// Releases the module registered under `name`.
    ///
    /// # Errors
    ///
    /// Fails with [`LoaderError::StillReferenced`] while instances
    /// created from the module remain alive; the module stays loaded.
    pub fn unload(&self, name: &str) -> Result<(), LoaderError> {
        let mut modules = self.modules.write();
        let Some(handle) = modules.get(name) else {
            return Err(LoaderError::NotLoaded(name.to_string()));
        };
        if Arc::strong_count(&handle.library) > 1 {
            return Err(LoaderError::StillReferenced(name.to_string()));
        }
        let handle = modules.remove(name).expect("checked above");
        info!(name = %name, path = %handle.path.display(), "Unloaded module");
        Ok(())
    }

    /// Unloads every module that is no longer referenced. Modules with
    /// live instances are skipped with a warning.
    pub fn unload_all(&self) {
        let names = self.names();
        for name in names {
            if let Err(e) = self.unload(&name) {
                warn!(name = %name, error = %e, "Skipping unload");
            }
        }
    }

    /// Logical names of loaded modules, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Path the module was loaded from.
    #[must_use]
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.modules.read().get(name).map(|h| h.path.clone())
    }
}

/// A loaded component paired with the library that produced it.
///
/// Field order matters: `inner` drops before `_library`, so component
/// code never outlives its text segment.
struct PluginInstance {
    inner: Box<dyn Component>,
    _library: Arc<Library>,
}

impl Component for PluginInstance {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn initialize(&mut self) -> Result<(), ComponentError> {
        self.inner.initialize()
    }

    fn destroy(&mut self) -> Result<(), ComponentError> {
        self.inner.destroy()
    }

    fn add_dependency(&mut self, name: &str, dep: WeakComponent) {
        self.inner.add_dependency(name, dep);
    }
}
