//! Module manifest types.
//!
//! Every module archive carries an `integration.toml` describing its
//! identity, dependencies, scope exposure and configuration:
//!
//! ```toml
//! [module]
//! namespace = "acme"
//! name = "zigbee"
//! version = "1.4.0"
//! requires-host = "^1.0.0"
//!
//! [[dependencies]]
//! name = "serial"
//! version = "^2.0"
//!
//! [capabilities]
//! expose-scope = "child"
//! flags = ["polling"]
//!
//! [config]
//! poll_interval_secs = 30
//! ```

use serde::{Deserialize, Serialize};

use crate::Coordinate;
use crate::descriptor::{DEFAULT_REQUIRES_HOST, DependencyConstraint, ModuleDescriptor, ScopeExposure};
use crate::error::ModuleResult;
use crate::version::VersionRange;

/// A parsed `integration.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Identity and host requirements.
    pub module: ModuleSection,
    /// Declared dependencies, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ManifestDependency>,
    /// Scope exposure and capability flags.
    #[serde(default)]
    pub capabilities: ManifestCapabilities,
    /// Free-form configuration handed to the module on load.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// The `[module]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModuleSection {
    /// Namespace half of the coordinate.
    pub namespace: String,
    /// Name half of the coordinate.
    pub name: String,
    /// Semantic version of this build.
    pub version: String,
    /// Host versions this module runs on.
    #[serde(default = "default_requires_host")]
    pub requires_host: String,
}

fn default_requires_host() -> String {
    DEFAULT_REQUIRES_HOST.to_owned()
}

/// One `[[dependencies]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDependency {
    /// Name of the module depended on.
    pub name: String,
    /// Namespace of the module depended on. Defaults to the declaring
    /// module's own namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Acceptable versions. Absent means any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The `[capabilities]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestCapabilities {
    /// What this module offers dependents for scope reuse.
    #[serde(default)]
    pub expose_scope: ScopeExposure,
    /// Opaque capability flags, passed through to the module.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

impl ModuleManifest {
    /// Parse a manifest from TOML text.
    ///
    /// # Errors
    ///
    /// Returns the TOML deserialization error.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// The coordinate declared by `[module]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or name is malformed.
    pub fn coordinate(&self) -> ModuleResult<Coordinate> {
        Coordinate::new(&self.module.namespace, &self.module.name)
    }

    /// Build the session descriptor for this manifest.
    ///
    /// The descriptor has no archive attached; discovery sets it.
    ///
    /// # Errors
    ///
    /// Returns an error if a coordinate or version range is malformed.
    pub fn to_descriptor(&self) -> ModuleResult<ModuleDescriptor> {
        let coordinate = self.coordinate()?;
        let mut descriptor = ModuleDescriptor::new(coordinate, &self.module.version);
        descriptor.requires_host = VersionRange::parse(&self.module.requires_host)?;
        descriptor.expose = self.capabilities.expose_scope;
        descriptor.flags.clone_from(&self.capabilities.flags);
        descriptor.config.clone_from(&self.config);

        for dep in &self.dependencies {
            let namespace = dep.namespace.as_deref().unwrap_or(&self.module.namespace);
            let target = Coordinate::new(namespace, &dep.name)?;
            let range = match &dep.version {
                Some(v) => VersionRange::parse(v)?,
                None => VersionRange::Any,
            };
            descriptor
                .dependencies
                .push(DependencyConstraint { target, range });
        }
        Ok(descriptor)
    }
}
