//! Shared harness for bring-up tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hearth_modules::discovery::{MANIFEST_FILE_NAME, load_manifest};
use hearth_modules::{
    Coordinate, HostContext, Integration, LifecyclePhase, LoadOptions, ModuleArchive,
    ModuleDescriptor, ModuleError, ModuleResult, ScopeArena, ScopeBackend, ScopeId,
};
use tempfile::TempDir;
use wasm_encoder::{
    CodeSection, ExportKind, ExportSection, Function, FunctionSection, Instruction, Module,
    TypeSection,
};

pub fn c(s: &str) -> Coordinate {
    s.parse().unwrap()
}

/// A module binary exporting every lifecycle callback.
pub fn concrete_entry() -> Vec<u8> {
    let mut module = Module::new();
    let mut types = TypeSection::new();
    types.ty().function([], []);
    module.section(&types);

    let mut functions = FunctionSection::new();
    let mut exports = ExportSection::new();
    let mut code = CodeSection::new();
    for (i, phase) in LifecyclePhase::ALL.iter().enumerate() {
        functions.function(0);
        exports.export(phase.export_name(), ExportKind::Func, u32::try_from(i).unwrap());
        let mut f = Function::new([]);
        f.instruction(&Instruction::End);
        code.function(&f);
    }
    module.section(&functions);
    module.section(&exports);
    module.section(&code);
    module.finish()
}

/// How a scripted module behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Script {
    #[default]
    Healthy,
    /// The backend refuses to load it.
    FailLoad,
    /// The callback returns an error.
    FailAt(LifecyclePhase),
    /// The callback never returns.
    HangAt(LifecyclePhase),
}

#[derive(Debug, Default)]
pub struct Recorder {
    /// `"<coordinate> <callback>"` in call order.
    pub events: Vec<String>,
    /// `(coordinate, scope)` for each successful load.
    pub loads: Vec<(Coordinate, ScopeId)>,
    pub discarded: Vec<Coordinate>,
    pub contexts: HashMap<Coordinate, (HostContext, LoadOptions)>,
}

/// In-process backend. Scripts drive behavior; `links` declares which
/// providers a module's code needs to see from its scope.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    pub scripts: HashMap<Coordinate, Script>,
    pub links: HashMap<Coordinate, Vec<Coordinate>>,
    pub recorder: Arc<Mutex<Recorder>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, coord: &str, script: Script) -> Self {
        self.scripts.insert(c(coord), script);
        self
    }

    pub fn link(mut self, coord: &str, provider: &str) -> Self {
        self.links.entry(c(coord)).or_default().push(c(provider));
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.recorder.lock().unwrap().events.clone()
    }

    pub fn discarded(&self) -> Vec<Coordinate> {
        self.recorder.lock().unwrap().discarded.clone()
    }

    pub fn context(&self, coord: &str) -> Option<(HostContext, LoadOptions)> {
        self.recorder.lock().unwrap().contexts.get(&c(coord)).cloned()
    }
}

#[async_trait]
impl ScopeBackend for FakeBackend {
    async fn load_entry(
        &self,
        arena: &ScopeArena,
        scope: ScopeId,
        archive: &ModuleArchive,
        entry_type: &str,
    ) -> ModuleResult<Box<dyn Integration>> {
        let coordinate = archive.coordinate.clone();
        let script = self.scripts.get(&coordinate).copied().unwrap_or_default();
        if script == Script::FailLoad {
            return Err(ModuleError::LoadFailed {
                coordinate,
                message: format!("refusing to load {entry_type}"),
            });
        }
        for provider in self.links.get(&coordinate).into_iter().flatten() {
            if arena.resolve(scope, provider).is_none() {
                return Err(ModuleError::UnresolvedImport {
                    coordinate,
                    provider: provider.to_string(),
                    scope,
                });
            }
        }
        self.recorder
            .lock()
            .unwrap()
            .loads
            .push((coordinate.clone(), scope));
        Ok(Box::new(ScriptedIntegration {
            coordinate,
            script,
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn discard(&self, coordinate: &Coordinate) {
        self.recorder
            .lock()
            .unwrap()
            .discarded
            .push(coordinate.clone());
    }
}

pub struct ScriptedIntegration {
    coordinate: Coordinate,
    script: Script,
    recorder: Arc<Mutex<Recorder>>,
}

impl ScriptedIntegration {
    async fn step(&self, phase: LifecyclePhase) -> ModuleResult<()> {
        self.recorder
            .lock()
            .unwrap()
            .events
            .push(format!("{} {phase}", self.coordinate));
        match self.script {
            Script::FailAt(p) if p == phase => Err(ModuleError::Lifecycle {
                coordinate: self.coordinate.clone(),
                phase,
                message: "scripted failure".into(),
            }),
            Script::HangAt(p) if p == phase => {
                std::future::pending::<()>().await;
                Ok(())
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Integration for ScriptedIntegration {
    async fn on_load(&mut self, host: &HostContext, options: &LoadOptions) -> ModuleResult<()> {
        self.recorder
            .lock()
            .unwrap()
            .contexts
            .insert(self.coordinate.clone(), (host.clone(), options.clone()));
        self.step(LifecyclePhase::Load).await
    }

    async fn on_init(&mut self) -> ModuleResult<()> {
        self.step(LifecyclePhase::Init).await
    }

    async fn on_start(&mut self) -> ModuleResult<()> {
        self.step(LifecyclePhase::Start).await
    }

    async fn on_pause(&mut self) -> ModuleResult<()> {
        self.step(LifecyclePhase::Pause).await
    }

    async fn on_release(&mut self) -> ModuleResult<()> {
        self.step(LifecyclePhase::Release).await
    }
}

/// A temporary Hearth home with a modules directory.
pub struct ModuleTree {
    dir: TempDir,
}

impl ModuleTree {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.dir.path().join("modules")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.dir.path().join("modules.yaml")
    }

    /// Unpack a module with one concrete entry type `main`.
    ///
    /// `extra` is appended to the manifest verbatim.
    pub fn add(&self, coord: &str, deps: &[&str], extra: &str) -> ModuleArchive {
        let coordinate = c(coord);
        let root = self
            .modules_dir()
            .join(coordinate.namespace())
            .join(coordinate.name());
        std::fs::create_dir_all(&root).unwrap();

        let mut manifest = format!(
            "[module]\nnamespace = \"{}\"\nname = \"{}\"\nversion = \"1.0.0\"\n",
            coordinate.namespace(),
            coordinate.name()
        );
        for dep in deps {
            let target = c(dep);
            manifest.push_str(&format!(
                "\n[[dependencies]]\nnamespace = \"{}\"\nname = \"{}\"\nversion = \"^1.0\"\n",
                target.namespace(),
                target.name()
            ));
        }
        manifest.push('\n');
        manifest.push_str(extra);

        std::fs::write(root.join(MANIFEST_FILE_NAME), manifest).unwrap();
        std::fs::write(root.join("main.wasm"), concrete_entry()).unwrap();
        ModuleArchive::new(coordinate, root)
    }

    /// Descriptor for a module previously added.
    pub fn descriptor(&self, archive: &ModuleArchive) -> ModuleDescriptor {
        load_manifest(&archive.manifest_path())
            .unwrap()
            .to_descriptor()
            .unwrap()
            .with_archive(archive.clone())
    }

    /// Add a module and return its descriptor.
    pub fn module(&self, coord: &str, deps: &[&str], extra: &str) -> ModuleDescriptor {
        let archive = self.add(coord, deps, extra);
        self.descriptor(&archive)
    }
}
