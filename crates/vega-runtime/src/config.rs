//! Runtime configuration.
//!
//! Kept deliberately small: the module root (with its environment
//! override) and queue sizing. Defaults match a checkout-local layout.

use std::path::{Path, PathBuf};

/// Environment variable consulted for the module root.
pub const MODULE_PATH_ENV: &str = "VEGA_MODULE_PATH";

/// Default module root when no override is present.
pub const DEFAULT_MODULE_ROOT: &str = "./modules";

/// Configuration for the runtime layer.
///
/// # Example
///
/// ```
/// use vega_runtime::RuntimeConfig;
///
/// let config = RuntimeConfig::default().with_module_root("/opt/vega/modules");
/// assert_eq!(config.module_root.to_str(), Some("/opt/vega/modules"));
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name of the environment variable overriding `module_root`.
    pub module_path_env: String,
    /// Directory scanned for addon subdirectories.
    pub module_root: PathBuf,
    /// Capacity of interpreter and bus event queues.
    pub event_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            module_path_env: MODULE_PATH_ENV.to_string(),
            module_root: PathBuf::from(DEFAULT_MODULE_ROOT),
            event_queue_capacity: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Overrides the module root.
    #[must_use]
    pub fn with_module_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.module_root = root.into();
        self
    }

    /// Overrides the name of the module-root environment variable.
    #[must_use]
    pub fn with_module_path_env(mut self, name: impl Into<String>) -> Self {
        self.module_path_env = name.into();
        self
    }

    /// Overrides the event queue capacity.
    #[must_use]
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// The effective module root: the configured environment variable
    /// when set, the configured path otherwise.
    #[must_use]
    pub fn resolved_module_root(&self) -> PathBuf {
        match std::env::var(&self.module_path_env) {
            Ok(value) if !value.is_empty() => PathBuf::from(value),
            _ => self.module_root.clone(),
        }
    }
}

/// Rewrites path separators for the running platform.
#[must_use]
pub(crate) fn normalize_separators(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if cfg!(windows) {
        PathBuf::from(text.replace('/', "\\"))
    } else {
        PathBuf::from(text.replace('\\', "/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.module_path_env, MODULE_PATH_ENV);
        assert_eq!(config.module_root, PathBuf::from(DEFAULT_MODULE_ROOT));
        assert_eq!(config.event_queue_capacity, 1000);
    }

    #[test]
    fn env_override_wins() {
        let config = RuntimeConfig::default().with_module_path_env("VEGA_TEST_MODULE_PATH_CFG");
        std::env::set_var("VEGA_TEST_MODULE_PATH_CFG", "/tmp/mods");
        assert_eq!(config.resolved_module_root(), PathBuf::from("/tmp/mods"));
        std::env::remove_var("VEGA_TEST_MODULE_PATH_CFG");
        assert_eq!(
            config.resolved_module_root(),
            PathBuf::from(DEFAULT_MODULE_ROOT)
        );
    }

    #[cfg(unix)]
    #[test]
    fn separator_normalization() {
        assert_eq!(
            normalize_separators(Path::new("modules\\camera\\lib.so")),
            PathBuf::from("modules/camera/lib.so")
        );
    }
}
