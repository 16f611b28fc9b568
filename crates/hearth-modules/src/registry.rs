//! Running module registry.
//!
//! Written once per module by the bring-up worker, read concurrently by
//! everything else (scope lookups, status queries, admin flows).

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::Coordinate;
use crate::error::{ModuleError, ModuleResult};
use crate::integration::{Integration, IntegrationState, LifecyclePhase};
use crate::scope::ScopeId;

/// A started module bound to the scope it was loaded into.
pub struct ModuleRuntimeHandle {
    coordinate: Coordinate,
    version: String,
    entry_type: String,
    scope: ScopeId,
    exposed_scope: Option<ScopeId>,
    state: RwLock<IntegrationState>,
    integration: Mutex<Box<dyn Integration>>,
}

impl ModuleRuntimeHandle {
    /// Wrap a module whose start-up callbacks all succeeded.
    #[must_use]
    pub fn new(
        coordinate: Coordinate,
        version: impl Into<String>,
        entry_type: impl Into<String>,
        scope: ScopeId,
        exposed_scope: Option<ScopeId>,
        integration: Box<dyn Integration>,
    ) -> Self {
        Self {
            coordinate,
            version: version.into(),
            entry_type: entry_type.into(),
            scope,
            exposed_scope,
            state: RwLock::new(IntegrationState::Running),
            integration: Mutex::new(integration),
        }
    }

    /// The module's coordinate.
    #[must_use]
    pub fn coordinate(&self) -> &Coordinate {
        &self.coordinate
    }

    /// The running version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Qualified name of the started entry type.
    #[must_use]
    pub fn entry_type(&self) -> &str {
        &self.entry_type
    }

    /// The scope the module was loaded into.
    #[must_use]
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// The scope this module offers to dependents, if any.
    #[must_use]
    pub fn exposed_scope(&self) -> Option<ScopeId> {
        self.exposed_scope
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IntegrationState {
        self.state
            .read()
            .map_or_else(|e| e.into_inner().clone(), |s| s.clone())
    }

    pub(crate) fn set_state(&self, state: IntegrationState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// Exclusive access to the module for lifecycle calls.
    pub async fn integration(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Integration>> {
        self.integration.lock().await
    }
}

impl std::fmt::Debug for ModuleRuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRuntimeHandle")
            .field("coordinate", &self.coordinate)
            .field("version", &self.version)
            .field("entry_type", &self.entry_type)
            .field("scope", &self.scope)
            .field("exposed_scope", &self.exposed_scope)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of one registered module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStatus {
    /// The module's coordinate.
    pub coordinate: Coordinate,
    /// The running version.
    pub version: String,
    /// Qualified name of the started entry type.
    pub entry_type: String,
    /// The scope the module was loaded into.
    pub scope: ScopeId,
    /// The scope offered to dependents, if any.
    pub exposed_scope: Option<ScopeId>,
    /// Lifecycle state at snapshot time.
    pub state: IntegrationState,
}

/// Registry of running modules keyed by coordinate.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    handles: DashMap<Coordinate, Arc<ModuleRuntimeHandle>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a started module.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::AlreadyRegistered`] if the coordinate is taken.
    pub fn register(&self, handle: ModuleRuntimeHandle) -> ModuleResult<Arc<ModuleRuntimeHandle>> {
        let coordinate = handle.coordinate.clone();
        match self.handles.entry(coordinate.clone()) {
            dashmap::Entry::Occupied(_) => Err(ModuleError::AlreadyRegistered(coordinate)),
            dashmap::Entry::Vacant(slot) => {
                let handle = Arc::new(handle);
                slot.insert(Arc::clone(&handle));
                info!(
                    coordinate = %coordinate,
                    scope = %handle.scope,
                    "Registered module"
                );
                Ok(handle)
            },
        }
    }

    /// Remove a module from the registry.
    pub fn unregister(&self, coordinate: &Coordinate) -> Option<Arc<ModuleRuntimeHandle>> {
        self.handles.remove(coordinate).map(|(_, h)| h)
    }

    /// Look up a running module.
    #[must_use]
    pub fn get(&self, coordinate: &Coordinate) -> Option<Arc<ModuleRuntimeHandle>> {
        self.handles.get(coordinate).map(|h| Arc::clone(h.value()))
    }

    /// Whether a module is registered.
    #[must_use]
    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        self.handles.contains_key(coordinate)
    }

    /// The scope a registered module offers to dependents.
    #[must_use]
    pub fn exposed_scope(&self, coordinate: &Coordinate) -> Option<ScopeId> {
        self.handles.get(coordinate).and_then(|h| h.exposed_scope)
    }

    /// Coordinates of all registered modules, sorted.
    #[must_use]
    pub fn coordinates(&self) -> Vec<Coordinate> {
        let mut out: Vec<_> = self.handles.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }

    /// Snapshot of every registered module, sorted by coordinate.
    #[must_use]
    pub fn statuses(&self) -> Vec<ModuleStatus> {
        let mut out: Vec<ModuleStatus> = self
            .handles
            .iter()
            .map(|e| {
                let h = e.value();
                ModuleStatus {
                    coordinate: h.coordinate.clone(),
                    version: h.version.clone(),
                    entry_type: h.entry_type.clone(),
                    scope: h.scope,
                    exposed_scope: h.exposed_scope,
                    state: h.state(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.coordinate.cmp(&b.coordinate));
        out
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Pause and release the given modules in the given order, removing each
    /// from the registry. Failures are logged and do not stop the sweep.
    pub async fn release_in_order(&self, order: &[Coordinate]) -> Vec<(Coordinate, ModuleError)> {
        let mut failures = Vec::new();
        for coordinate in order {
            let Some(handle) = self.unregister(coordinate) else {
                continue;
            };
            let mut integration = handle.integration().await;

            if let Err(e) = integration.on_pause().await {
                warn!(coordinate = %coordinate, error = %e, "on_pause failed during shutdown");
                failures.push((coordinate.clone(), e));
            } else {
                handle.set_state(IntegrationState::after(LifecyclePhase::Pause));
            }

            match integration.on_release().await {
                Ok(()) => handle.set_state(IntegrationState::after(LifecyclePhase::Release)),
                Err(e) => {
                    warn!(coordinate = %coordinate, error = %e, "on_release failed during shutdown");
                    handle.set_state(IntegrationState::Failed(e.to_string()));
                    failures.push((coordinate.clone(), e));
                },
            }
        }
        failures
    }
}
