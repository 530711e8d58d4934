//! Addon discovery and dependency ordering.
//!
//! A subdirectory of the module root is *qualified* when it contains a
//! `package.json` manifest and at least one dynamic library for the
//! running platform. Qualified addons are ordered so that every
//! dependency loads before its dependents; ties between independent
//! addons break lexicographically, making the load order deterministic
//! across runs and platforms.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use vega_component::{AddonManifest, ManifestError, ModuleDecl, MANIFEST_FILE};
use vega_types::ErrorCode;

/// Dependency resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Directory scan failed.
    #[error("failed to scan module root: {0}")]
    Io(#[from] std::io::Error),

    /// A manifest in a qualified directory failed validation.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The dependency graph contains a cycle through the named node.
    #[error("circular dependency detected through {0}")]
    CycleDetected(String),

    /// A declared dependency matches no known addon or component.
    #[error("{from} depends on unknown {to}")]
    UnknownDependency {
        /// Dependent node.
        from: String,
        /// Missing dependency.
        to: String,
    },
}

impl ErrorCode for ResolveError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "RESOLVE_IO",
            Self::Manifest(_) => "RESOLVE_MANIFEST",
            Self::CycleDetected(_) => "RESOLVE_CYCLE_DETECTED",
            Self::UnknownDependency { .. } => "RESOLVE_UNKNOWN_DEPENDENCY",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Directed dependency graph over string-named nodes.
///
/// Edges point from a node to the nodes it depends on. Ordering output
/// is deterministic: independent nodes sort lexicographically.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// node -> its dependencies
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node with no edges.
    pub fn add_node(&mut self, node: impl Into<String>) {
        self.deps.entry(node.into()).or_default();
    }

    /// Records that `node` depends on `dependency`. Both nodes are
    /// created when absent.
    pub fn add_dependency(&mut self, node: impl Into<String>, dependency: impl Into<String>) {
        let dependency = dependency.into();
        self.deps.entry(dependency.clone()).or_default();
        self.deps.entry(node.into()).or_default().insert(dependency);
    }

    /// Nodes that depend on `node`.
    #[must_use]
    pub fn dependents_of(&self, node: &str) -> Vec<String> {
        self.deps
            .iter()
            .filter(|(_, deps)| deps.contains(node))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Whether the graph contains a cycle.
    #[must_use]
    pub fn has_cycle(&self) -> bool {
        self.topological_order().is_err()
    }

    /// Kahn's algorithm with a lexicographic min-heap over ready nodes:
    /// every dependency precedes its dependents, independent nodes come
    /// out sorted.
    ///
    /// # Errors
    ///
    /// Fails with [`ResolveError::CycleDetected`] naming the smallest
    /// node left on a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>, ResolveError> {
        let mut remaining: HashMap<&str, usize> = self
            .deps
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<&str>> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| Reverse(*node))
            .collect();

        let mut order = Vec::with_capacity(self.deps.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node.to_string());
            for (dependent, deps) in &self.deps {
                if deps.contains(node) {
                    let count = remaining
                        .get_mut(dependent.as_str())
                        .expect("all nodes are tracked");
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(dependent.as_str()));
                    }
                }
            }
            remaining.remove(node);
        }

        if order.len() != self.deps.len() {
            let stuck = self
                .deps
                .keys()
                .find(|n| remaining.contains_key(n.as_str()))
                .expect("cycle implies a remaining node");
            return Err(ResolveError::CycleDetected(stuck.clone()));
        }
        Ok(order)
    }
}

/// Returns the qualified subdirectories of `root`, sorted by name.
///
/// Qualification requires a `package.json` and at least one file with
/// the platform dynamic-library suffix.
///
/// # Errors
///
/// Fails when the directory cannot be read.
pub fn qualified_subdirs(root: &Path) -> Result<Vec<PathBuf>, ResolveError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if is_qualified(&path)? {
            dirs.push(path);
        } else {
            debug!(dir = %path.display(), "Skipping unqualified subdirectory");
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn is_qualified(dir: &Path) -> Result<bool, ResolveError> {
    let mut has_manifest = false;
    let mut has_library = false;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == MANIFEST_FILE {
            has_manifest = true;
        } else if name.ends_with(std::env::consts::DLL_SUFFIX) {
            has_library = true;
        }
        if has_manifest && has_library {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Scans `root` and returns its qualified subdirectories in dependency
/// order: every addon a directory's components depend on appears
/// earlier.
///
/// Directories whose manifests fail validation are skipped with a
/// warning; they contribute no nodes.
///
/// # Errors
///
/// Cycles and dependencies on addons that are not present are fatal.
pub fn resolve_directory(root: &Path) -> Result<Vec<PathBuf>, ResolveError> {
    let dirs = qualified_subdirs(root)?;

    let mut graph = DependencyGraph::new();
    let mut dir_of: HashMap<String, PathBuf> = HashMap::new();
    let mut dep_edges: Vec<(String, String)> = Vec::new();

    for dir in &dirs {
        let text = std::fs::read_to_string(dir.join(MANIFEST_FILE))
            .map_err(ResolveError::Io)?;
        let manifest = match AddonManifest::parse(&text) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping addon with invalid manifest");
                continue;
            }
        };
        graph.add_node(&manifest.name);
        dir_of.insert(manifest.name.clone(), dir.clone());
        for module in &manifest.modules {
            for dep in &module.dependencies {
                let dep_addon = dep.split('.').next().unwrap_or(dep);
                if dep_addon != manifest.name {
                    dep_edges.push((manifest.name.clone(), dep_addon.to_string()));
                }
            }
        }
    }

    for (from, to) in dep_edges {
        if !dir_of.contains_key(&to) {
            return Err(ResolveError::UnknownDependency { from, to });
        }
        graph.add_dependency(from, to);
    }

    let order = graph.topological_order()?;
    Ok(order
        .into_iter()
        .filter_map(|name| dir_of.remove(&name))
        .collect())
}

/// Orders one manifest's module declarations so that intra-addon
/// dependencies come first. Dependencies on other addons are assumed
/// already loaded and do not constrain the order.
///
/// # Errors
///
/// Cycles among an addon's own components are fatal.
pub fn order_modules(
    addon: &str,
    modules: &[ModuleDecl],
) -> Result<Vec<ModuleDecl>, ResolveError> {
    let mut graph = DependencyGraph::new();
    for module in modules {
        graph.add_node(&module.name);
        for dep in &module.dependencies {
            let Some((dep_addon, dep_component)) = dep.split_once('.') else {
                continue;
            };
            if dep_addon != addon {
                continue;
            }
            if modules.iter().any(|m| m.name == dep_component) {
                graph.add_dependency(&module.name, dep_component);
            } else {
                return Err(ResolveError::UnknownDependency {
                    from: format!("{addon}.{}", module.name),
                    to: dep.clone(),
                });
            }
        }
    }

    let order = graph.topological_order()?;
    Ok(order
        .into_iter()
        .filter_map(|name| modules.iter().find(|m| m.name == name).cloned())
        .collect())
}
