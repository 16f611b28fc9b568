//! Bring-up driver.
//!
//! A session runs: compatibility check, load order, entry point scans, then
//! one module at a time scope placement, loading and lifecycle start-up.
//! Each module is fully registered (or has definitively failed) before the
//! next one's scope lookup runs, which is what makes ancestor scope
//! discovery sound.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tracing::{debug, error, info, warn};

use crate::Coordinate;
use crate::backend::ScopeBackend;
use crate::compat::{CheckResult, CompatibilityChecker};
use crate::config_writer::{TransactionalConfigWriter, WriteMode};
use crate::descriptor::{ModuleDescriptor, ScopeExposure};
use crate::discovery::{ArchiveProblem, ModuleArchive, discover_descriptors};
use crate::error::{ModuleError, ModuleResult};
use crate::integration::{HostContext, Integration, IntegrationState, LifecyclePhase, LoadOptions};
use crate::registry::{ModuleRegistry, ModuleRuntimeHandle};
use crate::resolver::{LoadOrder, resolve};
use crate::scanner::EntryPointScanner;
use crate::scope::{
    AllocationRule, AncestorScopeFinder, IsolationScopeAllocator, ScopeArena, ScopeId,
};

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Version of the running host, checked against `requires-host`.
    pub host_version: Version,
    /// Root of per-module data directories.
    pub data_dir: PathBuf,
    /// Bound on each start-up lifecycle call. `None` waits forever.
    pub lifecycle_timeout: Option<Duration>,
    /// Refuse to bring anything up when the compatibility check has errors.
    pub abort_on_compat_errors: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            host_version: Version::new(1, 0, 0),
            data_dir: PathBuf::from("data"),
            lifecycle_timeout: None,
            abort_on_compat_errors: false,
        }
    }
}

/// Why a single module did not start.
#[derive(Debug)]
pub enum BringUpFailure {
    /// No archive exists for the module.
    MissingArchive(PathBuf),
    /// The archive's manifest is unusable.
    InvalidManifest(String),
    /// Scope placement or loading the entry type failed.
    Load(ModuleError),
    /// `on_load`, `on_init` or `on_start` returned an error.
    Lifecycle(ModuleError),
    /// A start-up callback did not finish in time.
    TimedOut {
        /// The callback that hung.
        phase: LifecyclePhase,
        /// The bound that was exceeded.
        after: Duration,
    },
    /// The started module could not be registered.
    Register(ModuleError),
}

impl fmt::Display for BringUpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArchive(path) => write!(f, "archive not found at {}", path.display()),
            Self::InvalidManifest(message) => write!(f, "invalid manifest: {message}"),
            Self::Load(e) | Self::Lifecycle(e) | Self::Register(e) => write!(f, "{e}"),
            Self::TimedOut { phase, after } => {
                write!(f, "{phase} did not finish within {}s", after.as_secs_f64())
            },
        }
    }
}

/// What happened to one module.
#[derive(Debug)]
pub enum ModuleOutcome {
    /// The module is registered and running.
    Started {
        /// The scope it was loaded into.
        scope: ScopeId,
        /// The policy row that picked the scope.
        rule: AllocationRule,
        /// The scope offered to dependents, if any.
        exposed_scope: Option<ScopeId>,
        /// The entry type that was started.
        entry_type: String,
    },
    /// The module was skipped or failed; it is not registered.
    Failed(BringUpFailure),
}

impl ModuleOutcome {
    /// Whether the module is running.
    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// Result of one bring-up session.
#[derive(Debug, Default)]
pub struct BringUpReport {
    /// Coordinates in the order they were processed.
    pub load_order: Vec<Coordinate>,
    /// One outcome per module, in load order.
    pub outcomes: Vec<(Coordinate, ModuleOutcome)>,
    /// Advisory compatibility findings.
    pub issues: CheckResult,
}

impl BringUpReport {
    /// The outcome for `coordinate`.
    #[must_use]
    pub fn outcome(&self, coordinate: &Coordinate) -> Option<&ModuleOutcome> {
        self.outcomes
            .iter()
            .find(|(c, _)| c == coordinate)
            .map(|(_, o)| o)
    }

    /// Coordinates that started, in load order.
    pub fn started(&self) -> impl Iterator<Item = &Coordinate> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_started())
            .map(|(c, _)| c)
    }

    /// Modules that did not start, with the reason.
    pub fn failed(&self) -> impl Iterator<Item = (&Coordinate, &BringUpFailure)> {
        self.outcomes.iter().filter_map(|(c, o)| match o {
            ModuleOutcome::Failed(f) => Some((c, f)),
            ModuleOutcome::Started { .. } => None,
        })
    }
}

/// Drives discovery, ordering, placement and start-up for one session.
///
/// The orchestrator owns the session's scope arena. A reload creates a fresh
/// orchestrator after shutting the old one down.
pub struct LoadOrchestrator<B: ScopeBackend> {
    backend: B,
    options: OrchestratorOptions,
    arena: ScopeArena,
    registry: Arc<ModuleRegistry>,
    started: Vec<Coordinate>,
}

impl<B: ScopeBackend> fmt::Debug for LoadOrchestrator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOrchestrator")
            .field("options", &self.options)
            .field("scopes", &self.arena.len())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl<B: ScopeBackend> LoadOrchestrator<B> {
    /// A fresh session using `backend`.
    #[must_use]
    pub fn new(backend: B, options: OrchestratorOptions) -> Self {
        Self {
            backend,
            options,
            arena: ScopeArena::new(),
            registry: Arc::new(ModuleRegistry::new()),
            started: Vec::new(),
        }
    }

    /// The running-module registry. Safe to query from other tasks.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// The session's scope tree.
    #[must_use]
    pub fn arena(&self) -> &ScopeArena {
        &self.arena
    }

    /// The code-loading backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Read the registry file, discover archives under `modules_dir` and
    /// bring every enabled module up.
    ///
    /// Scanned entry types that differ from the recorded ones are written
    /// back to the registry file; a failure to do so is only logged.
    ///
    /// # Errors
    ///
    /// Everything [`bring_up`](Self::bring_up) returns, plus
    /// [`ModuleError::RegistryFile`] if the registry cannot be read.
    pub async fn bring_up_from_disk(
        &mut self,
        modules_dir: &Path,
        writer: &TransactionalConfigWriter,
    ) -> ModuleResult<BringUpReport> {
        let persisted = writer.read()?;
        let descriptors = discover_descriptors(modules_dir, &persisted);
        let report = self.bring_up(descriptors).await?;

        let mut changed = BTreeMap::new();
        for (coordinate, outcome) in &report.outcomes {
            let ModuleOutcome::Started { entry_type, .. } = outcome else {
                continue;
            };
            if let Some(entry) = persisted.get(coordinate)
                && entry.entry_type.as_deref() != Some(entry_type.as_str())
            {
                let mut updated = entry.clone();
                updated.entry_type = Some(entry_type.clone());
                updated.last_update = chrono::Utc::now();
                changed.insert(coordinate.to_string(), updated);
            }
        }
        if !changed.is_empty()
            && let Err(e) = writer.write_atomic(changed, WriteMode::Merge)
        {
            warn!(error = %e, "Failed to record scanned entry types");
        }
        Ok(report)
    }

    /// Bring up every enabled descriptor.
    ///
    /// Per-module failures are reported in the returned report and never stop
    /// the session.
    ///
    /// # Errors
    ///
    /// Aborts before anything starts on:
    /// - [`ModuleError::BringUpAborted`] when compatibility errors exist and
    ///   `abort_on_compat_errors` is set;
    /// - any error from [`resolve`] (cycles, unknown dependencies);
    /// - [`ModuleError::NoEntryClass`] / [`ModuleError::MultipleEntryClasses`]
    ///   from an entry point scan.
    pub async fn bring_up(
        &mut self,
        descriptors: Vec<ModuleDescriptor>,
    ) -> ModuleResult<BringUpReport> {
        let enabled: Vec<ModuleDescriptor> = descriptors.into_iter().filter(|d| d.enabled).collect();

        let issues = CompatibilityChecker::new()
            .with_host_version(self.options.host_version.clone())
            .check_all(&enabled, None);
        issues.log();
        if self.options.abort_on_compat_errors && !issues.is_ok() {
            return Err(ModuleError::BringUpAborted {
                reasons: issues.errors().map(|i| i.message.clone()).collect(),
            });
        }

        let order = resolve(enabled)?;
        let entry_types = scan_entry_types(&order)?;

        info!(modules = order.len(), "Starting module bring-up");
        let mut report = BringUpReport {
            load_order: order.coordinates().cloned().collect(),
            outcomes: Vec::with_capacity(order.len()),
            issues,
        };

        for descriptor in order.modules() {
            let outcome = self
                .bring_up_one(&order, descriptor, entry_types.get(&descriptor.coordinate))
                .await;
            match &outcome {
                ModuleOutcome::Started {
                    scope,
                    rule,
                    exposed_scope,
                    ..
                } => info!(
                    coordinate = %descriptor.coordinate,
                    scope = %scope,
                    rule = %rule,
                    exposed = ?exposed_scope,
                    "Module started"
                ),
                ModuleOutcome::Failed(failure) => error!(
                    coordinate = %descriptor.coordinate,
                    error = %failure,
                    "Module failed to start"
                ),
            }
            report.outcomes.push((descriptor.coordinate.clone(), outcome));
        }

        info!(
            started = report.started().count(),
            failed = report.failed().count(),
            "Module bring-up finished"
        );
        Ok(report)
    }

    async fn bring_up_one(
        &mut self,
        order: &LoadOrder,
        descriptor: &ModuleDescriptor,
        entry_type: Option<&String>,
    ) -> ModuleOutcome {
        let coordinate = &descriptor.coordinate;
        let (Some(archive), Some(entry_type)) = (&descriptor.archive, entry_type) else {
            return ModuleOutcome::Failed(match &descriptor.problem {
                Some(ArchiveProblem::InvalidManifest(m)) => BringUpFailure::InvalidManifest(m.clone()),
                Some(ArchiveProblem::Missing(path)) => BringUpFailure::MissingArchive(path.clone()),
                None => BringUpFailure::MissingArchive(PathBuf::new()),
            });
        };
        if self.registry.contains(coordinate) {
            return ModuleOutcome::Failed(BringUpFailure::Register(
                ModuleError::AlreadyRegistered(coordinate.clone()),
            ));
        }

        let ancestor = AncestorScopeFinder::new(order, &self.registry).find(descriptor);
        let assignment = match IsolationScopeAllocator.assign(
            &mut self.arena,
            coordinate,
            descriptor.is_depended,
            ancestor,
        ) {
            Ok(a) => a,
            Err(e) => return ModuleOutcome::Failed(BringUpFailure::Load(e)),
        };
        debug!(
            coordinate = %coordinate,
            ancestor = ?ancestor,
            scope = %assignment.scope,
            rule = %assignment.rule,
            "Assigned isolation scope"
        );

        let mut integration = match self
            .backend
            .load_entry(&self.arena, assignment.scope, archive, entry_type)
            .await
        {
            Ok(i) => i,
            Err(e) => return ModuleOutcome::Failed(BringUpFailure::Load(e)),
        };

        if let Err(failure) = self
            .start(integration.as_mut(), descriptor, archive, entry_type)
            .await
        {
            self.backend.discard(coordinate);
            return ModuleOutcome::Failed(failure);
        }

        match self.publish(descriptor, entry_type, assignment.scope, integration) {
            Ok(exposed_scope) => {
                self.started.push(coordinate.clone());
                ModuleOutcome::Started {
                    scope: assignment.scope,
                    rule: assignment.rule,
                    exposed_scope,
                    entry_type: entry_type.clone(),
                }
            },
            Err(e) => {
                self.backend.discard(coordinate);
                ModuleOutcome::Failed(BringUpFailure::Register(e))
            },
        }
    }

    async fn start(
        &self,
        integration: &mut dyn Integration,
        descriptor: &ModuleDescriptor,
        archive: &ModuleArchive,
        entry_type: &str,
    ) -> Result<(), BringUpFailure> {
        let coordinate = &descriptor.coordinate;
        let data_dir = self
            .options
            .data_dir
            .join(coordinate.namespace())
            .join(coordinate.name());
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| BringUpFailure::Load(ModuleError::Io(e)))?;

        let host = HostContext {
            host_version: self.options.host_version.to_string(),
            coordinate: coordinate.clone(),
            data_dir,
        };
        let options = LoadOptions {
            entry_type: entry_type.to_owned(),
            flags: descriptor.flags.clone(),
            config: descriptor.config.clone(),
        };
        debug!(coordinate = %coordinate, root = %archive.root.display(), "Running start-up callbacks");

        for phase in [LifecyclePhase::Load, LifecyclePhase::Init, LifecyclePhase::Start] {
            let call = async {
                match phase {
                    LifecyclePhase::Load => integration.on_load(&host, &options).await,
                    LifecyclePhase::Init => integration.on_init().await,
                    _ => integration.on_start().await,
                }
            };
            let result = match self.options.lifecycle_timeout {
                Some(after) => tokio::time::timeout(after, call)
                    .await
                    .map_err(|_| BringUpFailure::TimedOut { phase, after })?,
                None => call.await,
            };
            result.map_err(|e| match e {
                ModuleError::Lifecycle { .. } => BringUpFailure::Lifecycle(e),
                other => BringUpFailure::Lifecycle(ModuleError::Lifecycle {
                    coordinate: coordinate.clone(),
                    phase,
                    message: other.to_string(),
                }),
            })?;
            debug!(
                coordinate = %coordinate,
                state = ?IntegrationState::after(phase),
                "Lifecycle phase complete"
            );
        }
        Ok(())
    }

    /// Expose, define and register a started module.
    fn publish(
        &mut self,
        descriptor: &ModuleDescriptor,
        entry_type: &str,
        scope: ScopeId,
        integration: Box<dyn Integration>,
    ) -> ModuleResult<Option<ScopeId>> {
        let coordinate = &descriptor.coordinate;
        let exposed_scope = match descriptor.expose {
            ScopeExposure::None => None,
            ScopeExposure::Own => Some(scope),
            ScopeExposure::Child => Some(self.arena.expose_child(scope, coordinate)?),
        };
        self.arena.define(scope, coordinate)?;
        self.registry.register(ModuleRuntimeHandle::new(
            coordinate.clone(),
            &descriptor.version,
            entry_type,
            scope,
            exposed_scope,
            integration,
        ))?;
        Ok(exposed_scope)
    }

    /// Pause and release every started module in reverse load order.
    ///
    /// Failures are logged and returned; they never stop the sweep.
    pub async fn shutdown(&mut self) -> Vec<(Coordinate, ModuleError)> {
        let order: Vec<Coordinate> = self.started.drain(..).rev().collect();
        info!(modules = order.len(), "Shutting down modules");
        let failures = self.registry.release_in_order(&order).await;
        for coordinate in &order {
            self.backend.discard(coordinate);
        }
        failures
    }
}

/// Scan every module that has an archive. Any scan failure is fatal.
fn scan_entry_types(
    order: &LoadOrder,
) -> ModuleResult<HashMap<Coordinate, String>> {
    let scanner = EntryPointScanner;
    let mut entry_types = HashMap::new();
    for descriptor in order.modules() {
        let Some(archive) = &descriptor.archive else {
            continue;
        };
        let entry_type = scanner.scan(archive)?;
        if let Some(recorded) = &descriptor.recorded_entry_type
            && *recorded != entry_type
        {
            warn!(
                coordinate = %descriptor.coordinate,
                recorded = %recorded,
                scanned = %entry_type,
                "Entry type changed since it was recorded; using the scanned one"
            );
        }
        entry_types.insert(descriptor.coordinate.clone(), entry_type);
    }
    Ok(entry_types)
}
