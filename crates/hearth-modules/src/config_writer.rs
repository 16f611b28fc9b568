//! Persisted module registry and its crash-safe writer.
//!
//! The registry file (`modules.yaml` under the Hearth home by default) is the
//! durable record of which modules are installed and enabled. It is read at
//! startup to seed discovery and mutated only through
//! [`TransactionalConfigWriter`].
//!
//! # Format
//!
//! ```yaml
//! version: 1
//! modules:
//!   acme:zigbee:
//!     enabled: true
//!     namespace: acme
//!     name: zigbee
//!     version: 1.4.0
//!     lastUpdate: 2026-01-01T00:00:00Z
//!     entryType: zigbee
//! ```
//!
//! Rename atomicity protects concurrent readers only. Two writers running at
//! once can lose each other's update; callers must serialize administrative
//! writes themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::Coordinate;
use crate::error::{ModuleError, ModuleResult};

/// Current registry schema version.
pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

/// Default registry file name inside the Hearth home.
pub const REGISTRY_FILE_NAME: &str = "modules.yaml";

/// One installed module as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfigEntry {
    /// Whether discovery should bring this module up.
    pub enabled: bool,
    /// Namespace half of the coordinate.
    pub namespace: String,
    /// Name half of the coordinate.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// When this entry was last written.
    pub last_update: DateTime<Utc>,
    /// Entry type found by the last scan, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<String>,
}

impl PersistedConfigEntry {
    /// An enabled entry stamped with the current time.
    #[must_use]
    pub fn new(coordinate: &Coordinate, version: impl Into<String>) -> Self {
        Self {
            enabled: true,
            namespace: coordinate.namespace().to_owned(),
            name: coordinate.name().to_owned(),
            version: version.into(),
            last_update: Utc::now(),
            entry_type: None,
        }
    }

    /// The coordinate this entry describes.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidCoordinate`] if the stored namespace or
    /// name is malformed.
    pub fn coordinate(&self) -> ModuleResult<Coordinate> {
        Coordinate::new(&self.namespace, &self.name)
    }

    /// Copy with `enabled` set and `last_update` refreshed.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self.last_update = Utc::now();
        self
    }
}

/// The whole registry document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryFile {
    /// Schema version.
    pub version: u32,
    /// Entries keyed by `namespace:name`.
    pub modules: BTreeMap<String, PersistedConfigEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_SCHEMA_VERSION,
            modules: BTreeMap::new(),
        }
    }
}

impl RegistryFile {
    /// Look up an entry by coordinate.
    #[must_use]
    pub fn get(&self, coordinate: &Coordinate) -> Option<&PersistedConfigEntry> {
        self.modules.get(&coordinate.to_string())
    }

    /// Insert or replace an entry, keyed by its own coordinate.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry's coordinate is malformed.
    pub fn insert(&mut self, entry: PersistedConfigEntry) -> ModuleResult<()> {
        let key = entry.coordinate()?.to_string();
        self.modules.insert(key, entry);
        Ok(())
    }

    /// Remove an entry.
    pub fn remove(&mut self, coordinate: &Coordinate) -> Option<PersistedConfigEntry> {
        self.modules.remove(&coordinate.to_string())
    }

    /// Enabled entries in key order.
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &PersistedConfigEntry)> {
        self.modules.iter().filter(|(_, e)| e.enabled)
    }
}

/// How new entries combine with what is already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The new entries become the whole module map.
    Replace,
    /// The new entries are unioned into the existing map; new entries win.
    Merge,
}

/// Progress of a transactional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Nothing touched yet.
    Start,
    /// The previous file (if any) is copied aside.
    BackedUp,
    /// The new content is on disk in a temp file.
    WrittenTemp,
    /// The temp file re-parsed and passed validation.
    Validated,
    /// The temp file replaced the real file.
    Committed,
    /// A failure was undone by restoring the backup.
    RolledBack,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "starting",
            Self::BackedUp => "backed up",
            Self::WrittenTemp => "written to temp",
            Self::Validated => "validated",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

type ExtraValidation = Arc<dyn Fn(&RegistryFile) -> Result<(), String> + Send + Sync>;

/// Crash-safe read-modify-write of the registry file.
///
/// Each write walks `Start -> BackedUp -> WrittenTemp -> Validated ->
/// Committed`. A failure after the backup restores it and ends in
/// `RolledBack`, so readers of the real path only ever see the old or the
/// fully committed content.
#[derive(Clone)]
pub struct TransactionalConfigWriter {
    path: PathBuf,
    extra_validation: Option<ExtraValidation>,
}

impl fmt::Debug for TransactionalConfigWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalConfigWriter")
            .field("path", &self.path)
            .field("extra_validation", &self.extra_validation.is_some())
            .finish()
    }
}

impl TransactionalConfigWriter {
    /// Writer for the registry file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extra_validation: None,
        }
    }

    /// Run `check` against the parsed temp file before committing.
    #[must_use]
    pub fn with_extra_validation<F>(mut self, check: F) -> Self
    where
        F: Fn(&RegistryFile) -> Result<(), String> + Send + Sync + 'static,
    {
        self.extra_validation = Some(Arc::new(check));
        self
    }

    /// Path of the real registry file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path the previous content is copied to during a write.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".bak");
        self.path.with_file_name(name)
    }

    /// Read the registry. A missing file reads as an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::RegistryFile`] if the file exists but cannot be
    /// read or fails structural validation.
    pub fn read(&self) -> ModuleResult<RegistryFile> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No registry file, starting empty");
            return Ok(RegistryFile::default());
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| ModuleError::RegistryFile {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        parse_registry(&content).map_err(|message| ModuleError::RegistryFile {
            path: self.path.clone(),
            message,
        })
    }

    /// Write `entries` to the registry in one transaction.
    ///
    /// Returns the committed document.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::ConfigWrite`]. A failure after the backup
    /// restores the real file and ends in [`WriteState::RolledBack`], with
    /// `failed_at` naming the last state reached before the failure.
    pub fn write_atomic(
        &self,
        entries: BTreeMap<String, PersistedConfigEntry>,
        mode: WriteMode,
    ) -> ModuleResult<RegistryFile> {
        let backup = self.backup_path();
        let had_original = self.path.exists();

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| {
                    self.failure(WriteState::Start, WriteState::Start, format!("create parent: {e}"))
                })?;
        }
        if had_original {
            std::fs::copy(&self.path, &backup)
                .map_err(|e| {
                    self.failure(WriteState::Start, WriteState::Start, format!("backup: {e}"))
                })?;
        }

        let mut state = WriteState::BackedUp;
        match self.commit(entries, mode, &mut state) {
            Ok(file) => {
                if had_original && let Err(e) = std::fs::remove_file(&backup) {
                    warn!(path = %backup.display(), error = %e, "Failed to remove registry backup");
                }
                info!(
                    path = %self.path.display(),
                    modules = file.modules.len(),
                    "Registry file committed"
                );
                Ok(file)
            },
            Err(message) => {
                let failed_at = state;
                let terminal = if self.rollback(had_original, &backup) {
                    WriteState::RolledBack
                } else {
                    failed_at
                };
                warn!(
                    path = %self.path.display(),
                    failed_at = %failed_at,
                    state = %terminal,
                    error = %message,
                    "Registry write failed"
                );
                Err(self.failure(terminal, failed_at, message))
            },
        }
    }

    fn commit(
        &self,
        entries: BTreeMap<String, PersistedConfigEntry>,
        mode: WriteMode,
        state: &mut WriteState,
    ) -> Result<RegistryFile, String> {
        let modules = match mode {
            WriteMode::Replace => entries,
            WriteMode::Merge => {
                let mut existing = self.read().map_err(|e| e.to_string())?.modules;
                existing.extend(entries);
                existing
            },
        };
        let document = RegistryFile {
            version: REGISTRY_SCHEMA_VERSION,
            modules,
        };
        let body =
            serde_yaml::to_string(&document).map_err(|e| format!("failed to serialize: {e}"))?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| format!("failed to create temp file: {e}"))?;
        tmp.write_all(body.as_bytes())
            .map_err(|e| format!("failed to write temp file: {e}"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| format!("failed to sync temp file: {e}"))?;
        *state = WriteState::WrittenTemp;

        let written = std::fs::read_to_string(tmp.path())
            .map_err(|e| format!("failed to re-read temp file: {e}"))?;
        let parsed = parse_registry(&written)?;
        if let Some(check) = &self.extra_validation {
            check(&parsed)?;
        }
        *state = WriteState::Validated;

        tmp.persist(&self.path)
            .map_err(|e| format!("failed to rename temp file: {e}"))?;
        *state = WriteState::Committed;
        Ok(parsed)
    }

    /// Restore the backup over the real path. Returns whether the real path
    /// now holds its pre-write content.
    fn rollback(&self, had_original: bool, backup: &Path) -> bool {
        if !had_original {
            return true;
        }
        match std::fs::rename(backup, &self.path) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Failed to restore registry backup; the registry file may be inconsistent"
                );
                false
            },
        }
    }

    fn failure(&self, state: WriteState, failed_at: WriteState, message: String) -> ModuleError {
        ModuleError::ConfigWrite {
            path: self.path.clone(),
            state,
            failed_at,
            message,
        }
    }
}

/// Parse and structurally validate a registry document.
///
/// Both a `version` field and a `modules` mapping must be present; an empty
/// mapping is fine, an absent one is not.
fn parse_registry(content: &str) -> Result<RegistryFile, String> {
    let raw: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| format!("invalid YAML: {e}"))?;
    let map = raw
        .as_mapping()
        .ok_or_else(|| "registry root is not a mapping".to_owned())?;
    if !map.contains_key("version") {
        return Err("missing 'version' field".into());
    }
    match map.get("modules") {
        Some(serde_yaml::Value::Mapping(_)) => {},
        Some(_) => return Err("'modules' is not a mapping".into()),
        None => return Err("missing 'modules' field".into()),
    }
    let file: RegistryFile =
        serde_yaml::from_value(raw).map_err(|e| format!("invalid registry: {e}"))?;
    if file.version > REGISTRY_SCHEMA_VERSION {
        return Err(format!(
            "unsupported schema version {} (newest known is {REGISTRY_SCHEMA_VERSION})",
            file.version
        ));
    }
    Ok(file)
}
