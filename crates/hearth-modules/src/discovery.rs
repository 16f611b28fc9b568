//! Module discovery from the persisted registry and the modules directory.
//!
//! Each enabled registry entry is matched with its archive at
//! `<modules_dir>/<namespace>/<name>/`. Problems with a single archive never
//! abort discovery: the module still gets a descriptor, flagged with an
//! [`ArchiveProblem`], so it is ordered with the rest and reported as a
//! per-module failure during bring-up.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::Coordinate;
use crate::config_writer::{PersistedConfigEntry, RegistryFile};
use crate::descriptor::ModuleDescriptor;
use crate::error::{ModuleError, ModuleResult};
use crate::manifest::ModuleManifest;

/// Standard module manifest file name.
pub const MANIFEST_FILE_NAME: &str = "integration.toml";

/// File extension of compiled entry types.
pub const ENTRY_EXTENSION: &str = "wasm";

/// An unpacked module on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleArchive {
    /// The module this archive belongs to.
    pub coordinate: Coordinate,
    /// Archive root directory.
    pub root: PathBuf,
}

impl ModuleArchive {
    /// Archive for `coordinate` rooted at `root`.
    #[must_use]
    pub fn new(coordinate: Coordinate, root: impl Into<PathBuf>) -> Self {
        Self {
            coordinate,
            root: root.into(),
        }
    }

    /// Path of the manifest inside the archive.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    /// File holding the entry type with the given qualified name.
    ///
    /// `drivers.zigbee` maps to `<root>/drivers/zigbee.wasm`.
    #[must_use]
    pub fn entry_path(&self, entry_type: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in entry_type.split('.') {
            path.push(segment);
        }
        path.set_extension(ENTRY_EXTENSION);
        path
    }
}

/// Why a discovered module has no usable archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveProblem {
    /// No manifest exists where the archive should be.
    Missing(PathBuf),
    /// The manifest exists but cannot be used.
    InvalidManifest(String),
}

impl fmt::Display for ArchiveProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "archive not found at {}", path.display()),
            Self::InvalidManifest(message) => write!(f, "invalid manifest: {message}"),
        }
    }
}

/// Directory a module's archive lives in.
#[must_use]
pub fn archive_dir(modules_dir: &Path, coordinate: &Coordinate) -> PathBuf {
    modules_dir
        .join(coordinate.namespace())
        .join(coordinate.name())
}

/// Load a single manifest from a TOML file.
///
/// # Errors
///
/// Returns [`ModuleError::ManifestParseError`] if the file cannot be read or
/// parsed.
pub fn load_manifest(path: &Path) -> ModuleResult<ModuleManifest> {
    let content = std::fs::read_to_string(path).map_err(|e| ModuleError::ManifestParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    ModuleManifest::from_toml(&content).map_err(|e| ModuleError::ManifestParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Build descriptors for every enabled module in `registry`.
///
/// Entries whose key is not a valid coordinate are skipped with a warning;
/// every other enabled entry yields exactly one descriptor.
#[must_use]
pub fn discover_descriptors(modules_dir: &Path, registry: &RegistryFile) -> Vec<ModuleDescriptor> {
    let descriptors = describe_entries(modules_dir, registry.enabled());
    info!(count = descriptors.len(), "Discovered enabled modules");
    descriptors
}

/// Descriptors for every installed module, enabled or not. `enabled` mirrors
/// the registry flag.
#[must_use]
pub fn installed_descriptors(modules_dir: &Path, registry: &RegistryFile) -> Vec<ModuleDescriptor> {
    describe_entries(modules_dir, registry.modules.iter())
}

fn describe_entries<'a>(
    modules_dir: &Path,
    entries: impl Iterator<Item = (&'a String, &'a PersistedConfigEntry)>,
) -> Vec<ModuleDescriptor> {
    let mut descriptors = Vec::new();

    for (key, entry) in entries {
        let coordinate: Coordinate = match key.parse() {
            Ok(c) => c,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping registry entry with invalid coordinate");
                continue;
            },
        };
        if !entry
            .coordinate()
            .is_ok_and(|declared| declared == coordinate)
        {
            warn!(
                key = %key,
                namespace = %entry.namespace,
                name = %entry.name,
                "Registry entry fields disagree with its key; using the key"
            );
        }

        let archive = ModuleArchive::new(coordinate.clone(), archive_dir(modules_dir, &coordinate));
        let mut descriptor = match describe_archive(&archive) {
            Ok(mut d) => {
                if d.version != entry.version {
                    warn!(
                        coordinate = %coordinate,
                        registry_version = %entry.version,
                        manifest_version = %d.version,
                        "Installed version differs from the registry record"
                    );
                }
                d.archive = Some(archive);
                d
            },
            Err(problem) => {
                warn!(coordinate = %coordinate, problem = %problem, "Module archive unusable");
                let mut d = ModuleDescriptor::new(coordinate, &entry.version);
                d.problem = Some(problem);
                d
            },
        };
        descriptor.recorded_entry_type.clone_from(&entry.entry_type);
        descriptor.enabled = entry.enabled;
        debug!(
            coordinate = %descriptor.coordinate,
            version = %descriptor.version,
            "Discovered module"
        );
        descriptors.push(descriptor);
    }
    descriptors
}

fn describe_archive(archive: &ModuleArchive) -> Result<ModuleDescriptor, ArchiveProblem> {
    let manifest_path = archive.manifest_path();
    if !manifest_path.is_file() {
        return Err(ArchiveProblem::Missing(archive.root.clone()));
    }
    let manifest =
        load_manifest(&manifest_path).map_err(|e| ArchiveProblem::InvalidManifest(e.to_string()))?;
    let descriptor = manifest
        .to_descriptor()
        .map_err(|e| ArchiveProblem::InvalidManifest(e.to_string()))?;
    if descriptor.coordinate != archive.coordinate {
        return Err(ArchiveProblem::InvalidManifest(format!(
            "manifest declares {} but is installed as {}",
            descriptor.coordinate, archive.coordinate
        )));
    }
    Ok(descriptor)
}
