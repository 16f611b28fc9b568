//! Module host for the Hearth integration runtime.
//!
//! Discovers installed integration modules, orders them by their declared
//! dependencies, places each one in an isolation scope and brings it up:
//!
//! - [`resolve`]: dependency graph and topological [`LoadOrder`]
//! - [`IsolationScopeAllocator`] / [`AncestorScopeFinder`]: scope placement
//! - [`EntryPointScanner`]: finds the single concrete entry type of an archive
//! - [`CompatibilityChecker`]: advisory version and dependency issues
//! - [`ModuleRegistry`]: running modules by coordinate
//! - [`TransactionalConfigWriter`]: crash-safe updates to `modules.yaml`
//! - [`LoadOrchestrator`]: sequences all of the above for one session
//! - [`ModuleAdmin`]: install, remove, enable and disable
//!
//! # Isolation Scopes
//!
//! Scopes form a tree rooted at the core extension scope, with the shared
//! dependent scope as its child. A module sees what is defined in its own
//! scope and every ancestor. Library modules that nothing else depends on
//! share one scope; leaf modules reuse the scope exposed by their nearest
//! loaded dependency. Code loading itself is done by a [`ScopeBackend`];
//! [`WasmBackend`] runs entry types as WebAssembly plugins.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod admin;
pub mod backend;
pub mod compat;
pub mod config_writer;
pub mod coordinate;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod integration;
pub mod manifest;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod scanner;
pub mod scope;
pub mod version;

pub use admin::{ModuleAdmin, PackageInfo, RegistryClient};
pub use backend::{ScopeBackend, WasmBackend, WasmLimits};
pub use compat::{CheckResult, CompatibilityChecker, CompatibilityIssue, IssueType, Severity};
pub use config_writer::{
    PersistedConfigEntry, REGISTRY_FILE_NAME, RegistryFile, TransactionalConfigWriter, WriteMode,
    WriteState,
};
pub use coordinate::Coordinate;
pub use descriptor::{DependencyConstraint, ModuleDescriptor, ScopeExposure};
pub use discovery::{ModuleArchive, discover_descriptors, installed_descriptors};
pub use error::{ModuleError, ModuleResult};
pub use integration::{HostContext, Integration, IntegrationState, LifecyclePhase, LoadOptions};
pub use manifest::ModuleManifest;
pub use orchestrator::{
    BringUpFailure, BringUpReport, LoadOrchestrator, ModuleOutcome, OrchestratorOptions,
};
pub use registry::{ModuleRegistry, ModuleRuntimeHandle, ModuleStatus};
pub use resolver::{LoadOrder, resolve};
pub use scanner::EntryPointScanner;
pub use scope::{
    AllocationRule, AncestorScopeFinder, IsolationScopeAllocator, ScopeArena, ScopeAssignment,
    ScopeId,
};
pub use version::{VersionRange, parse_version};
