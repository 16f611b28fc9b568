//! Install, remove, enable and disable flows.
//!
//! Every flow reads the registry file, decides, and then changes it through
//! the [`TransactionalConfigWriter`]. Running sessions are not touched; the
//! daemon picks changes up on the next reload.
//!
//! Install is not one transaction: a failure after the download leaves the
//! unpacked archive in place without a registry entry.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use semver::Version;
use tracing::{debug, info, warn};

use crate::Coordinate;
use crate::compat::{CheckResult, CompatibilityChecker};
use crate::config_writer::{PersistedConfigEntry, RegistryFile, TransactionalConfigWriter, WriteMode};
use crate::descriptor::{DependencyConstraint, ModuleDescriptor};
use crate::discovery::{archive_dir, installed_descriptors};
use crate::error::{ModuleError, ModuleResult};

/// What the package registry knows about one module.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    /// Namespace half of the coordinate.
    pub namespace: String,
    /// Name half of the coordinate.
    pub name: String,
    /// Newest published version.
    pub latest_version: String,
    /// Declared dependencies of each published version.
    pub dependencies_by_version: BTreeMap<String, Vec<DependencyConstraint>>,
}

impl PackageInfo {
    /// Every published version.
    pub fn versions(&self) -> impl Iterator<Item = &String> {
        self.dependencies_by_version.keys()
    }
}

/// Remote package registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Look a module up.
    async fn get_package_info(&self, coordinate: &Coordinate) -> ModuleResult<PackageInfo>;

    /// Fetch and unpack `version`, returning the directory holding the
    /// archive contents.
    async fn download_package(&self, coordinate: &Coordinate, version: &str)
    -> ModuleResult<PathBuf>;
}

/// Administrative operations over the installed module set.
#[derive(Debug)]
pub struct ModuleAdmin<C> {
    client: C,
    modules_dir: PathBuf,
    writer: TransactionalConfigWriter,
    host_version: Version,
}

impl<C: RegistryClient> ModuleAdmin<C> {
    /// Manage archives under `modules_dir` recorded through `writer`.
    #[must_use]
    pub fn new(
        client: C,
        modules_dir: impl Into<PathBuf>,
        writer: TransactionalConfigWriter,
        host_version: Version,
    ) -> Self {
        Self {
            client,
            modules_dir: modules_dir.into(),
            writer,
            host_version,
        }
    }

    /// The registry file writer.
    #[must_use]
    pub fn writer(&self) -> &TransactionalConfigWriter {
        &self.writer
    }

    /// Install (or upgrade to) the latest published version of `coordinate`.
    ///
    /// # Errors
    ///
    /// - [`ModuleError::Incompatible`] if the compatibility check reports
    ///   errors involving the new module. Nothing is downloaded.
    /// - Client errors from lookup or download.
    /// - [`ModuleError::Io`] if the archive cannot be moved into place.
    /// - [`ModuleError::ConfigWrite`] if the registry update fails.
    pub async fn install(&self, coordinate: &Coordinate) -> ModuleResult<PersistedConfigEntry> {
        let package = self.client.get_package_info(coordinate).await?;
        let version = package.latest_version.clone();
        let registry = self.writer.read()?;

        let mut candidate = ModuleDescriptor::new(coordinate.clone(), &version);
        if let Some(deps) = package.dependencies_by_version.get(&version) {
            candidate.dependencies.clone_from(deps);
        }
        let mut set: Vec<ModuleDescriptor> = installed_descriptors(&self.modules_dir, &registry)
            .into_iter()
            .filter(|d| d.coordinate != *coordinate)
            .collect();
        set.push(candidate);

        let result = CompatibilityChecker::new()
            .with_host_version(self.host_version.clone())
            .check_all(&set, None);
        let reasons: Vec<String> = result
            .errors()
            .filter(|i| i.concerns(coordinate))
            .map(|i| i.message.clone())
            .collect();
        if !reasons.is_empty() {
            return Err(ModuleError::Incompatible {
                coordinate: coordinate.clone(),
                reasons,
            });
        }
        result.log();

        let downloaded = self.client.download_package(coordinate, &version).await?;
        let target = archive_dir(&self.modules_dir, coordinate);
        place_archive(&downloaded, &target)?;
        debug!(coordinate = %coordinate, path = %target.display(), "Archive in place");

        let mut entry = PersistedConfigEntry::new(coordinate, &version);
        if let Some(previous) = registry.get(coordinate) {
            entry.enabled = previous.enabled;
        }
        self.writer
            .write_atomic(single(coordinate, entry.clone()), WriteMode::Merge)?;
        info!(coordinate = %coordinate, version = %version, "Installed module");
        Ok(entry)
    }

    /// Uninstall `coordinate`.
    ///
    /// The registry entry goes first; the archive is deleted only after the
    /// registry no longer mentions it.
    ///
    /// # Errors
    ///
    /// - [`ModuleError::NotInstalled`] if there is no registry entry.
    /// - [`ModuleError::HasDependents`] if any installed module depends on it.
    /// - [`ModuleError::ConfigWrite`] or [`ModuleError::Io`] on failure.
    pub fn remove(&self, coordinate: &Coordinate) -> ModuleResult<()> {
        let mut registry = self.writer.read()?;
        if registry.get(coordinate).is_none() {
            return Err(ModuleError::NotInstalled(coordinate.clone()));
        }

        let dependents = dependents_of(&self.installed(&registry), coordinate, false);
        if !dependents.is_empty() {
            return Err(ModuleError::HasDependents {
                coordinate: coordinate.clone(),
                dependents,
            });
        }

        registry.remove(coordinate);
        self.writer.write_atomic(registry.modules, WriteMode::Replace)?;

        let target = archive_dir(&self.modules_dir, coordinate);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        info!(coordinate = %coordinate, "Removed module");
        Ok(())
    }

    /// Mark `coordinate` enabled.
    ///
    /// # Errors
    ///
    /// - [`ModuleError::NotInstalled`] if there is no registry entry.
    /// - [`ModuleError::Incompatible`] if a dependency is missing or disabled.
    pub fn enable(&self, coordinate: &Coordinate) -> ModuleResult<PersistedConfigEntry> {
        let registry = self.writer.read()?;
        let entry = registry
            .get(coordinate)
            .ok_or_else(|| ModuleError::NotInstalled(coordinate.clone()))?;
        if entry.enabled {
            debug!(coordinate = %coordinate, "Already enabled");
            return Ok(entry.clone());
        }

        let installed = self.installed(&registry);
        let mut reasons = Vec::new();
        if let Some(me) = installed.iter().find(|d| d.coordinate == *coordinate) {
            for target in me.dependency_targets() {
                match registry.get(target) {
                    None => reasons.push(format!("dependency {target} is not installed")),
                    Some(dep) if !dep.enabled => reasons.push(format!("dependency {target} is disabled")),
                    Some(_) => {},
                }
            }
        }
        if !reasons.is_empty() {
            return Err(ModuleError::Incompatible {
                coordinate: coordinate.clone(),
                reasons,
            });
        }

        self.set_enabled(coordinate, entry.clone(), true)
    }

    /// Mark `coordinate` disabled.
    ///
    /// # Errors
    ///
    /// - [`ModuleError::NotInstalled`] if there is no registry entry.
    /// - [`ModuleError::HasDependents`] if enabled modules depend on it.
    pub fn disable(&self, coordinate: &Coordinate) -> ModuleResult<PersistedConfigEntry> {
        let registry = self.writer.read()?;
        let entry = registry
            .get(coordinate)
            .ok_or_else(|| ModuleError::NotInstalled(coordinate.clone()))?;
        if !entry.enabled {
            debug!(coordinate = %coordinate, "Already disabled");
            return Ok(entry.clone());
        }

        let dependents = dependents_of(&self.installed(&registry), coordinate, true);
        if !dependents.is_empty() {
            return Err(ModuleError::HasDependents {
                coordinate: coordinate.clone(),
                dependents,
            });
        }

        self.set_enabled(coordinate, entry.clone(), false)
    }

    /// Compatibility report for the installed set, including outdated
    /// versions known to the package registry.
    ///
    /// Modules the registry cannot describe are skipped for the outdated
    /// check.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry file cannot be read.
    pub async fn check_installed(&self) -> ModuleResult<CheckResult> {
        let registry = self.writer.read()?;
        let installed = self.installed(&registry);

        let mut available = HashMap::new();
        for d in &installed {
            match self.client.get_package_info(&d.coordinate).await {
                Ok(package) => {
                    available.insert(d.coordinate.clone(), package.versions().cloned().collect());
                },
                Err(e) => warn!(coordinate = %d.coordinate, error = %e, "Package lookup failed"),
            }
        }

        Ok(CompatibilityChecker::new()
            .with_host_version(self.host_version.clone())
            .check_all(&installed, Some(&available)))
    }

    fn installed(&self, registry: &RegistryFile) -> Vec<ModuleDescriptor> {
        installed_descriptors(&self.modules_dir, registry)
    }

    fn set_enabled(
        &self,
        coordinate: &Coordinate,
        entry: PersistedConfigEntry,
        enabled: bool,
    ) -> ModuleResult<PersistedConfigEntry> {
        let entry = entry.with_enabled(enabled);
        self.writer
            .write_atomic(single(coordinate, entry.clone()), WriteMode::Merge)?;
        info!(coordinate = %coordinate, enabled, "Module flag changed");
        Ok(entry)
    }
}

fn single(
    coordinate: &Coordinate,
    entry: PersistedConfigEntry,
) -> BTreeMap<String, PersistedConfigEntry> {
    BTreeMap::from([(coordinate.to_string(), entry)])
}

/// Installed modules that declare a dependency on `target`.
fn dependents_of(
    installed: &[ModuleDescriptor],
    target: &Coordinate,
    enabled_only: bool,
) -> Vec<Coordinate> {
    installed
        .iter()
        .filter(|d| d.coordinate != *target && (d.enabled || !enabled_only))
        .filter(|d| d.dependency_targets().any(|t| t == target))
        .map(|d| d.coordinate.clone())
        .collect()
}

/// Replace `target` with the contents of `source`.
fn place_archive(source: &Path, target: &Path) -> ModuleResult<()> {
    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(source, target).is_ok() {
        return Ok(());
    }
    // Cross-device download directories cannot be renamed.
    copy_dir(source, target)?;
    if let Err(e) = std::fs::remove_dir_all(source) {
        warn!(path = %source.display(), error = %e, "Failed to clean up download");
    }
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> ModuleResult<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_symlink() {
            return Err(ModuleError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("package contains a symlink at {}", src_path.display()),
            )));
        }
        if file_type.is_dir() {
            copy_dir(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::IssueType;
    use crate::discovery::MANIFEST_FILE_NAME;
    use crate::version::VersionRange;

    fn c(s: &str) -> Coordinate {
        s.parse().unwrap()
    }

    fn manifest(coord: &Coordinate, version: &str, deps: &[&str]) -> String {
        let mut body = format!(
            "[module]\nnamespace = \"{}\"\nname = \"{}\"\nversion = \"{version}\"\n",
            coord.namespace(),
            coord.name()
        );
        for dep in deps {
            let d = c(dep);
            body.push_str(&format!(
                "[[dependencies]]\nnamespace = \"{}\"\nname = \"{}\"\nversion = \"^1.0.0\"\n",
                d.namespace(),
                d.name()
            ));
        }
        body
    }

    /// Serves packages from memory and "downloads" them into a scratch dir.
    struct FakeRegistry {
        packages: HashMap<Coordinate, PackageInfo>,
        scratch: PathBuf,
    }

    impl FakeRegistry {
        fn new(scratch: &Path) -> Self {
            Self {
                packages: HashMap::new(),
                scratch: scratch.to_path_buf(),
            }
        }

        fn publish(mut self, coord: &str, versions: &[&str], deps: &[&str]) -> Self {
            let coordinate = c(coord);
            let constraints: Vec<_> = deps
                .iter()
                .map(|d| DependencyConstraint {
                    target: c(d),
                    range: VersionRange::parse("^1.0.0").unwrap(),
                })
                .collect();
            let info = PackageInfo {
                namespace: coordinate.namespace().to_owned(),
                name: coordinate.name().to_owned(),
                latest_version: (*versions.last().unwrap()).to_owned(),
                dependencies_by_version: versions
                    .iter()
                    .map(|v| ((*v).to_owned(), constraints.clone()))
                    .collect(),
            };
            self.packages.insert(coordinate, info);
            self
        }
    }

    #[async_trait]
    impl RegistryClient for FakeRegistry {
        async fn get_package_info(&self, coordinate: &Coordinate) -> ModuleResult<PackageInfo> {
            self.packages
                .get(coordinate)
                .cloned()
                .ok_or_else(|| ModuleError::RegistryClient(format!("unknown package {coordinate}")))
        }

        async fn download_package(
            &self,
            coordinate: &Coordinate,
            version: &str,
        ) -> ModuleResult<PathBuf> {
            let info = self.get_package_info(coordinate).await?;
            let deps: Vec<String> = info.dependencies_by_version[version]
                .iter()
                .map(|d| d.target.to_string())
                .collect();
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            let dir = self.scratch.join(format!("{}-{}-{version}", coordinate.namespace(), coordinate.name()));
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(MANIFEST_FILE_NAME), manifest(coordinate, version, &deps))?;
            Ok(dir)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        modules_dir: PathBuf,
        admin: ModuleAdmin<FakeRegistry>,
    }

    fn fixture(build: impl FnOnce(FakeRegistry) -> FakeRegistry) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("downloads");
        let modules_dir = dir.path().join("modules");
        let writer = TransactionalConfigWriter::new(dir.path().join("modules.yaml"));
        let admin = ModuleAdmin::new(
            build(FakeRegistry::new(&scratch)),
            &modules_dir,
            writer,
            Version::new(1, 0, 0),
        );
        Fixture {
            _dir: dir,
            modules_dir,
            admin,
        }
    }

    #[tokio::test]
    async fn test_install_places_archive_and_records_entry() {
        let f = fixture(|r| r.publish("acme:serial", &["1.0.0", "1.2.0"], &[]));
        let entry = f.admin.install(&c("acme:serial")).await.unwrap();

        assert_eq!(entry.version, "1.2.0");
        assert!(entry.enabled);
        assert!(f.modules_dir.join("acme/serial").join(MANIFEST_FILE_NAME).is_file());
        let registry = f.admin.writer().read().unwrap();
        assert_eq!(registry.get(&c("acme:serial")).unwrap().version, "1.2.0");
    }

    #[tokio::test]
    async fn test_install_refuses_missing_dependency() {
        let f = fixture(|r| r.publish("acme:zigbee", &["1.0.0"], &["acme:serial"]));
        let err = f.admin.install(&c("acme:zigbee")).await.unwrap_err();

        let ModuleError::Incompatible { reasons, .. } = err else {
            panic!("expected Incompatible, got {err:?}");
        };
        assert!(reasons[0].contains("acme:serial"));
        assert!(!f.modules_dir.join("acme/zigbee").exists());
        assert!(f.admin.writer().read().unwrap().modules.is_empty());
    }

    #[tokio::test]
    async fn test_install_with_dependency_present() {
        let f = fixture(|r| {
            r.publish("acme:serial", &["1.0.0"], &[])
                .publish("acme:zigbee", &["1.0.0"], &["acme:serial"])
        });
        f.admin.install(&c("acme:serial")).await.unwrap();
        f.admin.install(&c("acme:zigbee")).await.unwrap();

        assert_eq!(f.admin.writer().read().unwrap().modules.len(), 2);
    }

    #[tokio::test]
    async fn test_upgrade_breaking_dependent_is_refused() {
        let f = fixture(|r| {
            r.publish("acme:serial", &["1.0.0"], &[])
                .publish("acme:zigbee", &["1.0.0"], &["acme:serial"])
        });
        f.admin.install(&c("acme:serial")).await.unwrap();
        f.admin.install(&c("acme:zigbee")).await.unwrap();

        let mut f = f;
        f.admin.client = f.admin.client.publish("acme:serial", &["1.0.0", "2.0.0"], &[]);
        let err = f.admin.install(&c("acme:serial")).await.unwrap_err();
        assert!(matches!(err, ModuleError::Incompatible { .. }));
    }

    #[tokio::test]
    async fn test_remove_refused_while_depended_on() {
        let f = fixture(|r| {
            r.publish("acme:serial", &["1.0.0"], &[])
                .publish("acme:zigbee", &["1.0.0"], &["acme:serial"])
        });
        f.admin.install(&c("acme:serial")).await.unwrap();
        f.admin.install(&c("acme:zigbee")).await.unwrap();

        let err = f.admin.remove(&c("acme:serial")).unwrap_err();
        let ModuleError::HasDependents { dependents, .. } = err else {
            panic!("expected HasDependents, got {err:?}");
        };
        assert_eq!(dependents, vec![c("acme:zigbee")]);

        f.admin.remove(&c("acme:zigbee")).unwrap();
        f.admin.remove(&c("acme:serial")).unwrap();
        assert!(f.admin.writer().read().unwrap().modules.is_empty());
        assert!(!f.modules_dir.join("acme/serial").exists());
    }

    #[test]
    fn test_remove_unknown_module() {
        let f = fixture(|r| r);
        assert!(matches!(
            f.admin.remove(&c("acme:ghost")),
            Err(ModuleError::NotInstalled(_))
        ));
    }

    #[tokio::test]
    async fn test_disable_and_enable_respect_dependencies() {
        let f = fixture(|r| {
            r.publish("acme:serial", &["1.0.0"], &[])
                .publish("acme:zigbee", &["1.0.0"], &["acme:serial"])
        });
        f.admin.install(&c("acme:serial")).await.unwrap();
        f.admin.install(&c("acme:zigbee")).await.unwrap();

        assert!(matches!(
            f.admin.disable(&c("acme:serial")),
            Err(ModuleError::HasDependents { .. })
        ));

        let off = f.admin.disable(&c("acme:zigbee")).unwrap();
        assert!(!off.enabled);
        let off = f.admin.disable(&c("acme:serial")).unwrap();
        assert!(!off.enabled);

        let err = f.admin.enable(&c("acme:zigbee")).unwrap_err();
        let ModuleError::Incompatible { reasons, .. } = err else {
            panic!("expected Incompatible, got {err:?}");
        };
        assert!(reasons[0].contains("disabled"));

        f.admin.enable(&c("acme:serial")).unwrap();
        let on = f.admin.enable(&c("acme:zigbee")).unwrap();
        assert!(on.enabled);
    }

    #[tokio::test]
    async fn test_reinstall_keeps_disabled_flag() {
        let f = fixture(|r| r.publish("acme:serial", &["1.0.0"], &[]));
        f.admin.install(&c("acme:serial")).await.unwrap();
        f.admin.disable(&c("acme:serial")).unwrap();

        let entry = f.admin.install(&c("acme:serial")).await.unwrap();
        assert!(!entry.enabled);
    }

    #[tokio::test]
    async fn test_check_installed_reports_outdated() {
        let f = fixture(|r| r.publish("acme:serial", &["1.0.0"], &[]));
        f.admin.install(&c("acme:serial")).await.unwrap();

        let mut f = f;
        f.admin.client = f.admin.client.publish("acme:serial", &["1.0.0", "1.1.0"], &[]);
        let result = f.admin.check_installed().await.unwrap();
        assert!(result.has(IssueType::OutdatedMinorVersion));
        assert!(result.is_ok());
    }
}
