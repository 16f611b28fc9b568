//! Module descriptors: the per-session view of an installed module.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Coordinate;
use crate::discovery::{ArchiveProblem, ModuleArchive};
use crate::version::VersionRange;

/// Default host range for modules that don't declare one.
pub const DEFAULT_REQUIRES_HOST: &str = "^1.0.0";

/// A declared dependency on another module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyConstraint {
    /// The module depended on.
    pub target: Coordinate,
    /// Acceptable versions of the target.
    pub range: VersionRange,
}

/// What a module offers to its dependents for scope reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeExposure {
    /// Dependents never attach to this module's scope.
    #[default]
    None,
    /// Dependents reuse the scope this module was loaded into.
    Own,
    /// A fresh child of this module's scope is created and offered.
    Child,
}

/// A module as seen by one bring-up session.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    /// Session-unique identity.
    pub coordinate: Coordinate,
    /// Installed version string.
    pub version: String,
    /// Disabled modules are skipped by discovery.
    pub enabled: bool,
    /// Declared dependencies, in declaration order.
    pub dependencies: Vec<DependencyConstraint>,
    /// Host versions this module runs on.
    pub requires_host: VersionRange,
    /// Set by the resolver: another descriptor in the session depends on
    /// this one.
    pub is_depended: bool,
    /// Where the module's code lives. `None` when the archive is missing or
    /// unusable; see `problem`.
    pub archive: Option<ModuleArchive>,
    /// Why `archive` is `None`, when known.
    pub problem: Option<ArchiveProblem>,
    /// Scope exposure declared by the manifest.
    pub expose: ScopeExposure,
    /// Capability flags declared by the manifest.
    pub flags: Vec<String>,
    /// Entry type recorded by a previous session, if any.
    pub recorded_entry_type: Option<String>,
    /// The manifest `[config]` table, passed to `on_load`.
    pub config: serde_json::Map<String, Value>,
}

impl ModuleDescriptor {
    /// An enabled descriptor with no dependencies and no archive.
    #[must_use]
    pub fn new(coordinate: Coordinate, version: impl Into<String>) -> Self {
        Self {
            coordinate,
            version: version.into(),
            enabled: true,
            dependencies: Vec::new(),
            requires_host: VersionRange::Any,
            is_depended: false,
            archive: None,
            problem: None,
            expose: ScopeExposure::None,
            flags: Vec::new(),
            recorded_entry_type: None,
            config: serde_json::Map::new(),
        }
    }

    /// Add a dependency constraint.
    #[must_use]
    pub fn with_dependency(mut self, target: Coordinate, range: VersionRange) -> Self {
        self.dependencies.push(DependencyConstraint { target, range });
        self
    }

    /// Set the archive location.
    #[must_use]
    pub fn with_archive(mut self, archive: ModuleArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Set the scope exposure policy.
    #[must_use]
    pub fn with_exposure(mut self, expose: ScopeExposure) -> Self {
        self.expose = expose;
        self
    }

    /// Declared dependency targets, deduplicated, in declaration order.
    pub fn dependency_targets(&self) -> impl Iterator<Item = &Coordinate> {
        let mut seen = Vec::with_capacity(self.dependencies.len());
        self.dependencies.iter().filter_map(move |d| {
            if seen.contains(&&d.target) {
                None
            } else {
                seen.push(&d.target);
                Some(&d.target)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> Coordinate {
        s.parse().unwrap()
    }

    #[test]
    fn test_dependency_targets_deduplicated_in_order() {
        let d = ModuleDescriptor::new(c("acme:app"), "1.0.0")
            .with_dependency(c("acme:b"), VersionRange::Any)
            .with_dependency(c("acme:a"), VersionRange::Any)
            .with_dependency(c("acme:b"), VersionRange::parse("^1").unwrap());

        let targets: Vec<_> = d.dependency_targets().cloned().collect();
        assert_eq!(targets, vec![c("acme:b"), c("acme:a")]);
    }

    #[test]
    fn test_exposure_serde() {
        let e: ScopeExposure = serde_json::from_str("\"child\"").unwrap();
        assert_eq!(e, ScopeExposure::Child);
        assert_eq!(ScopeExposure::default(), ScopeExposure::None);
    }
}
