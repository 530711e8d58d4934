//! Immutable component descriptors.

use std::path::PathBuf;
use vega_types::ComponentKey;

/// How a component runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// Loaded in-process from a dynamic library.
    Shared,
    /// External driver process supervised over pipes.
    Standalone,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Shared => "shared",
            Self::Standalone => "standalone",
        })
    }
}

/// Descriptor produced during manifest parsing, kept for the lifetime
/// of the loaded component.
///
/// Uniquely identified by its [`ComponentKey`] (`addon.component`).
#[derive(Debug, Clone)]
pub struct ComponentEntry {
    /// Fully-qualified identity.
    pub key: ComponentKey,
    /// Factory symbol name inside the module.
    pub entry_symbol: String,
    /// Shared or standalone.
    pub kind: ComponentKind,
    /// Path of the module this component came from.
    pub origin_module: PathBuf,
    /// Fully-qualified names of declared dependencies, in declaration order.
    pub dependencies: Vec<String>,
}

impl ComponentEntry {
    /// Creates a shared-component entry.
    #[must_use]
    pub fn shared(
        key: ComponentKey,
        entry_symbol: impl Into<String>,
        origin_module: impl Into<PathBuf>,
        dependencies: Vec<String>,
    ) -> Self {
        Self {
            key,
            entry_symbol: entry_symbol.into(),
            kind: ComponentKind::Shared,
            origin_module: origin_module.into(),
            dependencies,
        }
    }

    /// Creates a standalone-driver entry.
    #[must_use]
    pub fn standalone(
        key: ComponentKey,
        command: impl Into<String>,
        origin_module: impl Into<PathBuf>,
    ) -> Self {
        Self {
            key,
            entry_symbol: command.into(),
            kind: ComponentKind::Standalone,
            origin_module: origin_module.into(),
            dependencies: Vec::new(),
        }
    }

    /// Whether this entry declares `fqn` as a dependency.
    #[must_use]
    pub fn depends_on(&self, fqn: &str) -> bool {
        self.dependencies.iter().any(|d| d == fqn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_entry() {
        let entry = ComponentEntry::shared(
            ComponentKey::new("camera", "qhy"),
            "create_qhy",
            "/modules/camera",
            vec!["core.env".into()],
        );
        assert_eq!(entry.key.fqn(), "camera.qhy");
        assert_eq!(entry.kind, ComponentKind::Shared);
        assert!(entry.depends_on("core.env"));
        assert!(!entry.depends_on("core.config"));
    }

    #[test]
    fn kind_display() {
        assert_eq!(ComponentKind::Shared.to_string(), "shared");
        assert_eq!(ComponentKind::Standalone.to_string(), "standalone");
    }
}
