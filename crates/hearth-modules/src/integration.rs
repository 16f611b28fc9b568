//! The contract every module entry type implements.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::Coordinate;
use crate::error::ModuleResult;

/// What the host tells a module when it is loaded.
#[derive(Debug, Clone, Serialize)]
pub struct HostContext {
    /// Version of the running host.
    pub host_version: String,
    /// The module's own coordinate.
    pub coordinate: Coordinate,
    /// Directory the module may persist state in.
    pub data_dir: PathBuf,
}

/// Per-load options: the manifest `[config]` table and the entry type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadOptions {
    /// Qualified name of the entry type being started.
    pub entry_type: String,
    /// Capability flags from the manifest.
    pub flags: Vec<String>,
    /// Module configuration from its manifest.
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Lifecycle callbacks, in the order the host invokes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// `on_load`
    Load,
    /// `on_init`
    Init,
    /// `on_start`
    Start,
    /// `on_pause`
    Pause,
    /// `on_release`
    Release,
}

impl LifecyclePhase {
    /// Every callback, in invocation order.
    pub const ALL: [Self; 5] = [
        Self::Load,
        Self::Init,
        Self::Start,
        Self::Pause,
        Self::Release,
    ];

    /// The name of the callback (and of the WebAssembly export).
    #[must_use]
    pub fn export_name(self) -> &'static str {
        match self {
            Self::Load => "on_load",
            Self::Init => "on_init",
            Self::Start => "on_start",
            Self::Pause => "on_pause",
            Self::Release => "on_release",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

/// Observable state of a running module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationState {
    /// `on_load` succeeded.
    Loaded,
    /// `on_init` succeeded.
    Initialized,
    /// `on_start` succeeded; the module is serving.
    Running,
    /// `on_pause` succeeded.
    Paused,
    /// `on_release` ran; the module holds no resources.
    Released,
    /// A callback failed.
    Failed(String),
}

impl IntegrationState {
    /// The state a module is in once `phase` has succeeded.
    #[must_use]
    pub fn after(phase: LifecyclePhase) -> Self {
        match phase {
            LifecyclePhase::Load => Self::Loaded,
            LifecyclePhase::Init => Self::Initialized,
            LifecyclePhase::Start => Self::Running,
            LifecyclePhase::Pause => Self::Paused,
            LifecyclePhase::Release => Self::Released,
        }
    }
}

/// A module entry type.
///
/// The host calls `on_load`, `on_init` and `on_start` in that order during
/// bring-up, and `on_pause` then `on_release` at shutdown. A module is only
/// registered once all three start-up callbacks have returned `Ok`.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Receive the host context and load options.
    async fn on_load(&mut self, host: &HostContext, options: &LoadOptions) -> ModuleResult<()>;

    /// One-time initialization after loading.
    async fn on_init(&mut self) -> ModuleResult<()>;

    /// Begin serving.
    async fn on_start(&mut self) -> ModuleResult<()>;

    /// Stop serving, keeping state.
    async fn on_pause(&mut self) -> ModuleResult<()>;

    /// Release every resource. Called once, last.
    async fn on_release(&mut self) -> ModuleResult<()>;
}

impl fmt::Debug for dyn Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integration").finish_non_exhaustive()
    }
}
