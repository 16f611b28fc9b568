//! Module host error types.

use std::path::PathBuf;

use crate::Coordinate;
use crate::config_writer::WriteState;
use crate::integration::LifecyclePhase;
use crate::scope::ScopeId;

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from module host operations.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A coordinate string is malformed.
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// A version or version range string could not be parsed.
    #[error("invalid version '{value}': {message}")]
    InvalidVersion {
        /// The offending input.
        value: String,
        /// Parser message.
        message: String,
    },

    /// Failed to parse a module manifest file.
    #[error("manifest parse error in {path}: {message}")]
    ManifestParseError {
        /// Path to the manifest file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// Two descriptors in one session share a coordinate.
    #[error("duplicate module coordinate: {0}")]
    DuplicateCoordinate(Coordinate),

    /// A module depends on a coordinate that is not part of the session.
    #[error("module {module} depends on unknown module {target}")]
    UnknownDependency {
        /// The declaring module.
        module: Coordinate,
        /// The missing dependency target.
        target: Coordinate,
    },

    /// The dependency graph contains a cycle. No load order exists.
    #[error("dependency cycle among: {}", join(.members))]
    DependencyCycle {
        /// Coordinates whose in-degree never reached zero.
        members: Vec<Coordinate>,
    },

    /// No concrete entry type was found in a module archive.
    #[error("no entry type found in {coordinate}: {remediation}")]
    NoEntryClass {
        /// The module whose archive was scanned.
        coordinate: Coordinate,
        /// What the module author needs to change.
        remediation: String,
    },

    /// More than one concrete entry type was found in a module archive.
    #[error("multiple entry types found in {coordinate}: {}", .candidates.join(", "))]
    MultipleEntryClasses {
        /// The module whose archive was scanned.
        coordinate: Coordinate,
        /// Qualified names of every candidate.
        candidates: Vec<String>,
    },

    /// A scope handle does not belong to this arena.
    #[error("unknown scope handle: {0}")]
    UnknownScope(ScopeId),

    /// A coordinate was defined twice in the same scope.
    #[error("{coordinate} is already defined in scope {scope}")]
    AlreadyDefined {
        /// The duplicated coordinate.
        coordinate: Coordinate,
        /// The scope holding the first definition.
        scope: ScopeId,
    },

    /// A module imports from a provider that is not visible from its scope.
    #[error("{coordinate} imports from {provider}, which is not visible from scope {scope}")]
    UnresolvedImport {
        /// The importing module.
        coordinate: Coordinate,
        /// The import namespace that could not be resolved.
        provider: String,
        /// The scope the importer was loaded into.
        scope: ScopeId,
    },

    /// A module with this coordinate is already registered.
    #[error("module already registered: {0}")]
    AlreadyRegistered(Coordinate),

    /// The requested module was not found.
    #[error("module not found: {0}")]
    NotFound(Coordinate),

    /// The entry type could not be instantiated.
    #[error("module load failed: {coordinate} - {message}")]
    LoadFailed {
        /// The module that failed to load.
        coordinate: Coordinate,
        /// Failure reason.
        message: String,
    },

    /// A lifecycle callback returned an error.
    #[error("{phase} failed for {coordinate}: {message}")]
    Lifecycle {
        /// The failing module.
        coordinate: Coordinate,
        /// The callback that failed.
        phase: LifecyclePhase,
        /// Failure reason.
        message: String,
    },

    /// A transactional registry write failed and was rolled back.
    #[error("registry write to {path} failed after {failed_at} ({state}): {message}")]
    ConfigWrite {
        /// The registry file being written.
        path: PathBuf,
        /// Terminal state of the write: `RolledBack` once the backup is
        /// restored, otherwise the state the failure left behind.
        state: WriteState,
        /// Last state reached before the failure.
        failed_at: WriteState,
        /// Failure reason.
        message: String,
    },

    /// The persisted registry file could not be read or parsed.
    #[error("registry file error at {path}: {message}")]
    RegistryFile {
        /// Path to the registry file.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// The remote package registry failed.
    #[error("package registry error: {0}")]
    RegistryClient(String),

    /// A module cannot be installed or enabled because of compatibility errors.
    #[error("{coordinate} is incompatible: {}", .reasons.join("; "))]
    Incompatible {
        /// The rejected module.
        coordinate: Coordinate,
        /// Messages of the blocking issues.
        reasons: Vec<String>,
    },

    /// Bring-up was refused because the module set has compatibility errors.
    #[error("bring-up aborted on compatibility errors: {}", .reasons.join("; "))]
    BringUpAborted {
        /// Messages of the blocking issues.
        reasons: Vec<String>,
    },

    /// Other enabled modules still depend on this one.
    #[error("{coordinate} is required by: {}", join(.dependents))]
    HasDependents {
        /// The module the operation targeted.
        coordinate: Coordinate,
        /// Modules that declare a dependency on it.
        dependents: Vec<Coordinate>,
    },

    /// The module has no entry in the persisted registry.
    #[error("module not installed: {0}")]
    NotInstalled(Coordinate),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for module host operations.
pub type ModuleResult<T> = Result<T, ModuleError>;
