//! Entry point discovery inside a module archive.
//!
//! Every `.wasm` file of an archive, at any directory depth, is a candidate
//! entry type. Modules nested inside other binaries are never enumerated. A
//! candidate implements the module contract when it exports all five
//! lifecycle callbacks as functions. Exactly one such file must exist.

use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;
use wasmparser::{Encoding, ExternalKind, Parser, Payload, TypeRef, Validator};

use crate::discovery::{ENTRY_EXTENSION, ModuleArchive};
use crate::error::{ModuleError, ModuleResult};
use crate::integration::LifecyclePhase;

/// Import namespace modules use to declare the contract without
/// implementing it.
pub const CONTRACT_NAMESPACE: &str = "hearth:contract";

/// How a binary relates to the module contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Exports every lifecycle callback.
    Concrete,
    /// Exports some lifecycle callbacks but not all.
    Abstract,
    /// Exports none but imports contract functions.
    Interface,
    /// A component-model binary. Its nested modules are never inspected.
    Component,
    /// Nothing to do with the contract.
    Unrelated,
}

/// Finds the single concrete entry type of a module archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryPointScanner;

impl EntryPointScanner {
    /// Qualified name of the archive's only concrete entry type.
    ///
    /// Files that fail validation are skipped. The result is authoritative;
    /// any previously recorded name is ignored.
    ///
    /// # Errors
    ///
    /// - [`ModuleError::NoEntryClass`] if no concrete entry type exists.
    /// - [`ModuleError::MultipleEntryClasses`] if more than one exists.
    pub fn scan(&self, archive: &ModuleArchive) -> ModuleResult<String> {
        let mut candidates = self.candidates(archive);
        match candidates.len() {
            0 => Err(ModuleError::NoEntryClass {
                coordinate: archive.coordinate.clone(),
                remediation: format!(
                    "export {} as functions from exactly one .{ENTRY_EXTENSION} file under {}",
                    LifecyclePhase::ALL.map(LifecyclePhase::export_name).join(", "),
                    archive.root.display()
                ),
            }),
            1 => Ok(candidates.remove(0)),
            _ => Err(ModuleError::MultipleEntryClasses {
                coordinate: archive.coordinate.clone(),
                candidates,
            }),
        }
    }

    /// Qualified names of every concrete entry type, sorted.
    #[must_use]
    pub fn candidates(&self, archive: &ModuleArchive) -> Vec<String> {
        let mut found = Vec::new();
        let walker = WalkDir::new(&archive.root)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(coordinate = %archive.coordinate, error = %e, "Skipping unreadable archive entry");
                    continue;
                },
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION)
            {
                continue;
            }
            let Some(name) = qualified_name(&archive.root, path) else {
                debug!(path = %path.display(), "Skipping entry with an unrepresentable name");
                continue;
            };
            let bytes = match std::fs::read(path) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                },
            };
            match Self::classify(&bytes) {
                Ok(EntryKind::Concrete) => found.push(name),
                Ok(kind) => debug!(entry = %name, kind = ?kind, "Not a concrete entry type"),
                Err(message) => debug!(entry = %name, error = %message, "Skipping invalid entry"),
            }
        }
        found
    }

    /// Classify one binary. Validation failures are returned as text.
    ///
    /// # Errors
    ///
    /// Returns the parser or validator message for malformed binaries.
    pub fn classify(bytes: &[u8]) -> Result<EntryKind, String> {
        let mut exported = [false; 5];
        let mut imports_contract = false;

        for payload in Parser::new(0).parse_all(bytes) {
            match payload.map_err(|e| e.to_string())? {
                Payload::Version {
                    encoding: Encoding::Component,
                    ..
                } => return Ok(EntryKind::Component),
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import.map_err(|e| e.to_string())?;
                        if import.module == CONTRACT_NAMESPACE
                            && matches!(import.ty, TypeRef::Func(_))
                        {
                            imports_contract = true;
                        }
                    }
                },
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export.map_err(|e| e.to_string())?;
                        if export.kind != ExternalKind::Func {
                            continue;
                        }
                        if let Some(i) = LifecyclePhase::ALL
                            .iter()
                            .position(|p| p.export_name() == export.name)
                            && let Some(slot) = exported.get_mut(i)
                        {
                            *slot = true;
                        }
                    }
                },
                _ => {},
            }
        }

        Validator::new()
            .validate_all(bytes)
            .map_err(|e| e.to_string())?;

        let count = exported.iter().filter(|&&e| e).count();
        Ok(match count {
            5 => EntryKind::Concrete,
            0 if imports_contract => EntryKind::Interface,
            0 => EntryKind::Unrelated,
            _ => EntryKind::Abstract,
        })
    }
}

/// `drivers/zigbee.wasm` under `root` becomes `drivers.zigbee`.
///
/// Names whose segments contain `.` are rejected: they could not be mapped
/// back to a file.
fn qualified_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let mut segments = Vec::new();
    for component in relative.components() {
        let segment = component.as_os_str().to_str()?;
        if segment.is_empty() || segment.contains('.') {
            return None;
        }
        segments.push(segment);
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_encoder::{
        CodeSection, Component, EntityType, ExportKind, ExportSection, Function,
        FunctionSection, ImportSection, Instruction, Module, TypeSection,
    };

    const ALL_EXPORTS: [&str; 5] = ["on_load", "on_init", "on_start", "on_pause", "on_release"];

    fn build_module(exports: &[&str], contract_imports: &[&str]) -> Vec<u8> {
        let mut module = Module::new();

        let mut types = TypeSection::new();
        types.ty().function([], []);
        module.section(&types);

        if !contract_imports.is_empty() {
            let mut imports = ImportSection::new();
            for name in contract_imports {
                imports.import(CONTRACT_NAMESPACE, name, EntityType::Function(0));
            }
            module.section(&imports);
        }

        let imported = u32::try_from(contract_imports.len()).unwrap();
        let mut functions = FunctionSection::new();
        for _ in exports {
            functions.function(0);
        }
        module.section(&functions);

        let mut export_section = ExportSection::new();
        for (i, name) in exports.iter().enumerate() {
            let index = imported.saturating_add(u32::try_from(i).unwrap());
            export_section.export(name, ExportKind::Func, index);
        }
        module.section(&export_section);

        let mut code = CodeSection::new();
        for _ in exports {
            let mut f = Function::new([]);
            f.instruction(&Instruction::End);
            code.function(&f);
        }
        module.section(&code);

        module.finish()
    }

    fn archive_with(files: &[(&str, Vec<u8>)]) -> (tempfile::TempDir, ModuleArchive) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, bytes) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, bytes).unwrap();
        }
        let archive = ModuleArchive::new("acme:zigbee".parse().unwrap(), dir.path());
        (dir, archive)
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            EntryPointScanner::classify(&build_module(&ALL_EXPORTS, &[])),
            Ok(EntryKind::Concrete)
        );
        assert_eq!(
            EntryPointScanner::classify(&build_module(&["on_load", "on_start"], &[])),
            Ok(EntryKind::Abstract)
        );
        assert_eq!(
            EntryPointScanner::classify(&build_module(&[], &["on_load"])),
            Ok(EntryKind::Interface)
        );
        assert_eq!(
            EntryPointScanner::classify(&build_module(&["helper"], &[])),
            Ok(EntryKind::Unrelated)
        );
        assert_eq!(
            EntryPointScanner::classify(&Component::new().finish()),
            Ok(EntryKind::Component)
        );
        assert!(EntryPointScanner::classify(b"\0asm garbage").is_err());
    }

    #[test]
    fn test_single_concrete_entry_in_subdirectory() {
        let (_dir, archive) = archive_with(&[
            ("drivers/zigbee.wasm", build_module(&ALL_EXPORTS, &[])),
            ("base.wasm", build_module(&["on_load"], &[])),
            ("contract.wasm", build_module(&[], &["on_start"])),
            ("README.md", b"not wasm".to_vec()),
        ]);
        assert_eq!(EntryPointScanner.scan(&archive).unwrap(), "drivers.zigbee");
    }

    #[test]
    fn test_no_entry_class() {
        let (_dir, archive) = archive_with(&[("base.wasm", build_module(&["on_load"], &[]))]);
        let err = EntryPointScanner.scan(&archive).unwrap_err();
        let ModuleError::NoEntryClass { remediation, .. } = err else {
            panic!("expected NoEntryClass, got {err:?}");
        };
        assert!(remediation.contains("on_release"));
    }

    #[test]
    fn test_multiple_entry_classes_named() {
        let (_dir, archive) = archive_with(&[
            ("one.wasm", build_module(&ALL_EXPORTS, &[])),
            ("two.wasm", build_module(&ALL_EXPORTS, &[])),
        ]);
        let err = EntryPointScanner.scan(&archive).unwrap_err();
        let ModuleError::MultipleEntryClasses { candidates, .. } = err else {
            panic!("expected MultipleEntryClasses, got {err:?}");
        };
        assert_eq!(candidates, vec!["one", "two"]);
    }

    #[test]
    fn test_invalid_and_component_files_are_skipped() {
        let (_dir, archive) = archive_with(&[
            ("broken.wasm", b"\0asm\x01\0\0\0\x07\xff".to_vec()),
            ("bundle.wasm", Component::new().finish()),
            ("main.wasm", build_module(&ALL_EXPORTS, &[])),
        ]);
        assert_eq!(EntryPointScanner.scan(&archive).unwrap(), "main");
    }

    #[test]
    fn test_dotted_file_names_are_ignored() {
        let (_dir, archive) = archive_with(&[("main.v2.wasm", build_module(&ALL_EXPORTS, &[]))]);
        assert!(matches!(
            EntryPointScanner.scan(&archive),
            Err(ModuleError::NoEntryClass { .. })
        ));
    }

    #[test]
    fn test_entry_path_round_trips_scanned_name() {
        let (_dir, archive) =
            archive_with(&[("drivers/zigbee.wasm", build_module(&ALL_EXPORTS, &[]))]);
        let name = EntryPointScanner.scan(&archive).unwrap();
        assert!(archive.entry_path(&name).is_file());
    }
}
