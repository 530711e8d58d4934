//! Identifier types for Vega.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fully-qualified name of a component: `<addon>.<component>`.
///
/// Every component loaded into the runtime is addressed by the name of
/// the addon that declared it and its own name within that addon. The
/// pair is unique across the whole process: the component registry
/// rejects duplicates.
///
/// # Example
///
/// ```
/// use vega_types::ComponentKey;
///
/// let key = ComponentKey::new("camera", "qhy_ccd");
/// assert_eq!(key.fqn(), "camera.qhy_ccd");
/// assert_eq!(key.addon(), "camera");
/// assert_eq!(key.component(), "qhy_ccd");
///
/// let parsed: ComponentKey = "camera.qhy_ccd".parse().unwrap();
/// assert_eq!(parsed, key);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKey {
    addon: String,
    component: String,
}

impl ComponentKey {
    /// Creates a key from addon and component names.
    #[must_use]
    pub fn new(addon: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            addon: addon.into(),
            component: component.into(),
        }
    }

    /// Returns the addon part.
    #[must_use]
    pub fn addon(&self) -> &str {
        &self.addon
    }

    /// Returns the component part.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Returns the fully-qualified `addon.component` form.
    #[must_use]
    pub fn fqn(&self) -> String {
        format!("{}.{}", self.addon, self.component)
    }
}

impl std::fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.addon, self.component)
    }
}

impl std::str::FromStr for ComponentKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addon, component)) = s.split_once('.') else {
            return Err(KeyError::Malformed(s.to_string()));
        };
        if addon.is_empty() || component.is_empty() {
            return Err(KeyError::Malformed(s.to_string()));
        }
        Ok(Self::new(addon, component))
    }
}

/// Error parsing a [`ComponentKey`] from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Input is not of the `addon.component` form.
    Malformed(String),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(s) => write!(f, "malformed component key: {s:?}"),
        }
    }
}

impl std::error::Error for KeyError {}

impl crate::ErrorCode for KeyError {
    fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "KEY_MALFORMED",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Identifier for one script execution.
///
/// Each time the interpreter spawns a worker for a script, the run gets
/// a fresh id that is attached to every log line the worker emits. Runs
/// are never compared for anything other than equality.
///
/// # Example
///
/// ```
/// use vega_types::RunId;
///
/// let a = RunId::new();
/// let b = RunId::new();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Creates a new random run id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqn_round_trip() {
        let key = ComponentKey::new("mount", "eq6");
        let parsed: ComponentKey = key.fqn().parse().expect("fqn should parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_rejects_missing_dot() {
        assert!("mount".parse::<ComponentKey>().is_err());
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!(".eq6".parse::<ComponentKey>().is_err());
        assert!("mount.".parse::<ComponentKey>().is_err());
    }

    #[test]
    fn parse_splits_on_first_dot() {
        let key: ComponentKey = "indi.camera.main".parse().expect("should parse");
        assert_eq!(key.addon(), "indi");
        assert_eq!(key.component(), "camera.main");
    }

    #[test]
    fn display_matches_fqn() {
        let key = ComponentKey::new("focuser", "zwo_eaf");
        assert_eq!(key.to_string(), key.fqn());
    }
}
