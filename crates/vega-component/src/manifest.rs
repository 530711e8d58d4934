//! Addon manifest parsing and the addon registry.
//!
//! Every addon directory carries a `package.json` describing the
//! components it provides:
//!
//! ```json
//! {
//!   "name": "camera",
//!   "version": "1.2.0",
//!   "modules": [
//!     { "name": "qhy_ccd", "entry": "create_qhy_ccd",
//!       "dependencies": ["core.env"] }
//!   ]
//! }
//! ```
//!
//! Validation is a hard precondition: a manifest missing `name` or
//! `modules`, with a non-array `modules`, with entries lacking
//! `name`/`entry`, or with duplicate module names is rejected and never
//! registered.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use vega_types::ErrorCode;

/// Manifest file name inside an addon directory.
pub const MANIFEST_FILE: &str = "package.json";

/// One component declaration inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDecl {
    /// Component name; also the stem of the shared library file.
    pub name: String,
    /// Factory symbol exported by the library.
    pub entry: String,
    /// Fully-qualified names of components this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Parsed addon manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonManifest {
    /// Addon name; prefix of every component's fully-qualified name.
    pub name: String,
    /// Optional semver string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Optional author attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Declared components.
    pub modules: Vec<ModuleDecl>,
}

impl AddonManifest {
    /// Parses and validates manifest text.
    ///
    /// # Errors
    ///
    /// See [`ManifestError`] for the rejection matrix.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Validates and converts an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// See [`ManifestError`] for the rejection matrix.
    pub fn from_value(value: &Value) -> Result<Self, ManifestError> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or(ManifestError::MissingName)?;
        if name.is_empty() {
            return Err(ManifestError::MissingName);
        }

        let modules = value
            .get("modules")
            .and_then(Value::as_array)
            .ok_or(ManifestError::InvalidModules)?;

        let mut decls = Vec::with_capacity(modules.len());
        for (index, module) in modules.iter().enumerate() {
            let Some(obj) = module.as_object() else {
                return Err(ManifestError::InvalidModuleEntry { index });
            };
            let (Some(mod_name), Some(entry)) = (
                obj.get("name").and_then(Value::as_str),
                obj.get("entry").and_then(Value::as_str),
            ) else {
                return Err(ManifestError::InvalidModuleEntry { index });
            };
            if mod_name.is_empty() || entry.is_empty() {
                return Err(ManifestError::InvalidModuleEntry { index });
            }
            if decls.iter().any(|d: &ModuleDecl| d.name == mod_name) {
                return Err(ManifestError::DuplicateModule(mod_name.to_string()));
            }
            let dependencies = obj
                .get("dependencies")
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            decls.push(ModuleDecl {
                name: mod_name.to_string(),
                entry: entry.to_string(),
                dependencies,
            });
        }

        Ok(Self {
            name: name.to_string(),
            version: value
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string),
            author: value
                .get("author")
                .and_then(Value::as_str)
                .map(str::to_string),
            modules: decls,
        })
    }
}

/// Manifest validation and registration errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Manifest text is not valid JSON.
    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// Manifest file could not be read.
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    /// `name` is missing, non-string or empty.
    #[error("manifest is missing a non-empty 'name'")]
    MissingName,

    /// `modules` is missing or not an array.
    #[error("manifest is missing a 'modules' array")]
    InvalidModules,

    /// A module entry lacks `name` or `entry`.
    #[error("module entry {index} lacks 'name' or 'entry'")]
    InvalidModuleEntry {
        /// Index of the offending entry in `modules`.
        index: usize,
    },

    /// Two module entries share a name.
    #[error("duplicate module name in manifest: {0}")]
    DuplicateModule(String),

    /// An addon is already registered under this key.
    #[error("addon already registered: {0}")]
    DuplicateAddon(String),

    /// No addon registered under this key.
    #[error("addon not registered: {0}")]
    UnknownAddon(String),
}

impl ErrorCode for ManifestError {
    fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "MANIFEST_PARSE",
            Self::Io(_) => "MANIFEST_IO",
            Self::MissingName => "MANIFEST_MISSING_NAME",
            Self::InvalidModules => "MANIFEST_INVALID_MODULES",
            Self::InvalidModuleEntry { .. } => "MANIFEST_INVALID_MODULE_ENTRY",
            Self::DuplicateModule(_) => "MANIFEST_DUPLICATE_MODULE",
            Self::DuplicateAddon(_) => "MANIFEST_DUPLICATE_ADDON",
            Self::UnknownAddon(_) => "MANIFEST_UNKNOWN_ADDON",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Registry of parsed manifests, keyed by addon directory key.
#[derive(Default)]
pub struct AddonRegistry {
    manifests: RwLock<HashMap<String, AddonManifest>>,
}

impl AddonRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads, validates and registers the manifest found in `dir`.
    ///
    /// # Errors
    ///
    /// Fails when the manifest cannot be read or validated, or when
    /// `key` is already registered.
    pub fn add_module(&self, dir: &Path, key: &str) -> Result<(), ManifestError> {
        if self.manifests.read().contains_key(key) {
            return Err(ManifestError::DuplicateAddon(key.to_string()));
        }
        let text = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
        let manifest = AddonManifest::parse(&text)?;
        debug!(key = %key, addon = %manifest.name, "Registered addon manifest");
        self.manifests.write().insert(key.to_string(), manifest);
        Ok(())
    }

    /// Returns the manifest registered under `key`.
    ///
    /// # Errors
    ///
    /// Fails with [`ManifestError::UnknownAddon`] when absent.
    pub fn get_module(&self, key: &str) -> Result<AddonManifest, ManifestError> {
        self.manifests
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ManifestError::UnknownAddon(key.to_string()))
    }

    /// Removes a registered manifest. Returns `true` when it existed.
    pub fn remove_module(&self, key: &str) -> bool {
        self.manifests.write().remove(key).is_some()
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.manifests.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}
