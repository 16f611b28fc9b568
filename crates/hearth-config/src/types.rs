//! Configuration struct definitions.
//!
//! Every section derives `Default` with values matching `defaults.toml`, and
//! uses `#[serde(default)]` so partial files deserialize cleanly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the Hearth host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host identity and data locations.
    pub host: HostSection,
    /// Module archive and registry locations.
    pub modules: ModulesSection,
    /// Bring-up session behaviour.
    pub bringup: BringupSection,
    /// WebAssembly runtime limits.
    pub wasm: WasmSection,
    /// Logging and tracing configuration.
    pub logging: LoggingSection,
}

/// Paths with every platform default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    /// Root of per-module data directories.
    pub data_dir: PathBuf,
    /// Root of module archives.
    pub modules_dir: PathBuf,
    /// Persisted module registry file.
    pub registry_file: PathBuf,
}

impl Config {
    /// Resolve optional paths against `hearth_home` (normally `~/.hearth`).
    #[must_use]
    pub fn resolve_paths(&self, hearth_home: &Path) -> ResolvedPaths {
        let or_home = |value: Option<&String>, fallback: &str| {
            value.map_or_else(|| hearth_home.join(fallback), PathBuf::from)
        };
        ResolvedPaths {
            data_dir: or_home(self.host.data_dir.as_ref(), "data"),
            modules_dir: or_home(self.modules.dir.as_ref(), "modules"),
            registry_file: or_home(self.modules.registry_file.as_ref(), "modules.yaml"),
        }
    }
}

// ---------------------------------------------------------------------------
// HostSection
// ---------------------------------------------------------------------------

/// Host identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    /// Semver version that module `requires-host` ranges are checked against.
    pub version: String,
    /// Root of per-module data directories. `None` uses `~/.hearth/data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_owned(),
            data_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ModulesSection
// ---------------------------------------------------------------------------

/// Where module archives and the registry file live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesSection {
    /// Archive root. `None` uses `~/.hearth/modules`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Registry file. `None` uses `~/.hearth/modules.yaml`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_file: Option<String>,
}

// ---------------------------------------------------------------------------
// BringupSection
// ---------------------------------------------------------------------------

/// Bring-up session behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BringupSection {
    /// Upper bound for each lifecycle call, in seconds. `0` disables it.
    pub lifecycle_timeout_secs: u64,
    /// Abort the session when the advisory compatibility check reports errors.
    pub abort_on_compat_errors: bool,
}

impl BringupSection {
    /// The lifecycle timeout, or `None` when disabled.
    #[must_use]
    pub fn lifecycle_timeout(&self) -> Option<Duration> {
        (self.lifecycle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.lifecycle_timeout_secs))
    }
}

// ---------------------------------------------------------------------------
// WasmSection
// ---------------------------------------------------------------------------

/// WebAssembly runtime limits applied to every module instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmSection {
    /// Linear memory ceiling per instance, in MiB.
    pub max_memory_mb: u32,
    /// Wall-clock ceiling per guest call, in seconds.
    pub call_timeout_secs: u64,
}

impl Default for WasmSection {
    fn default() -> Self {
        Self {
            max_memory_mb: 64,
            call_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["hearth_modules=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
