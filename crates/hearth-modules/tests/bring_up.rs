//! End-to-end bring-up sessions against an in-process backend.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{FakeBackend, ModuleTree, Script, c};
use hearth_modules::{
    AllocationRule, BringUpFailure, IntegrationState, IssueType, LifecyclePhase, LoadOrchestrator,
    ModuleDescriptor, ModuleError, ModuleOutcome, OrchestratorOptions, PersistedConfigEntry,
    ScopeId, TransactionalConfigWriter, WriteMode,
};

fn options(tree: &ModuleTree) -> OrchestratorOptions {
    OrchestratorOptions {
        data_dir: tree.data_dir(),
        ..OrchestratorOptions::default()
    }
}

fn started(outcome: Option<&ModuleOutcome>) -> (ScopeId, AllocationRule, Option<ScopeId>) {
    match outcome {
        Some(ModuleOutcome::Started {
            scope,
            rule,
            exposed_scope,
            ..
        }) => (*scope, *rule, *exposed_scope),
        other => panic!("expected a started module, got {other:?}"),
    }
}

fn position(events: &[String], event: &str) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("missing event {event}: {events:?}"))
}

#[tokio::test]
async fn test_scope_placement_end_to_end() {
    let tree = ModuleTree::new();
    let descriptors = vec![
        tree.module("acme:app", &["acme:mid"], ""),
        tree.module("acme:mid", &["acme:lib"], "[capabilities]\nexpose-scope = \"child\"\n"),
        tree.module("acme:lib", &[], "[capabilities]\nexpose-scope = \"own\"\n"),
        tree.module("acme:leaf", &["acme:lib"], ""),
        tree.module("acme:solo", &[], ""),
    ];
    let backend = FakeBackend::new()
        .link("acme:app", "acme:mid")
        .link("acme:app", "acme:lib")
        .link("acme:leaf", "acme:lib")
        .link("acme:mid", "acme:lib");
    let mut orchestrator = LoadOrchestrator::new(backend, options(&tree));

    let report = orchestrator.bring_up(descriptors).await.unwrap();
    assert_eq!(report.failed().count(), 0, "{:?}", report.outcomes);

    let core = orchestrator.arena().core_extension();
    let shared = orchestrator.arena().shared_dependent();

    let (lib, rule, exposed) = started(report.outcome(&c("acme:lib")));
    assert_eq!((lib, rule, exposed), (core, AllocationRule::CoreExtension, Some(core)));

    let (mid, rule, mid_exposed) = started(report.outcome(&c("acme:mid")));
    assert_eq!((mid, rule), (shared, AllocationRule::SharedForCoreDependent));
    let mid_exposed = mid_exposed.unwrap();
    assert_eq!(orchestrator.arena().parent(mid_exposed), Some(shared));

    let (app, rule, _) = started(report.outcome(&c("acme:app")));
    assert_eq!((app, rule), (mid_exposed, AllocationRule::ReuseAncestor));

    let (leaf, rule, exposed) = started(report.outcome(&c("acme:leaf")));
    assert_eq!(rule, AllocationRule::NestedUnderShared);
    assert_eq!(orchestrator.arena().parent(leaf), Some(shared));
    assert_eq!(exposed, None);

    let (solo, rule, _) = started(report.outcome(&c("acme:solo")));
    assert_eq!((solo, rule), (shared, AllocationRule::SharedLeaf));

    let registry = orchestrator.registry();
    assert_eq!(registry.len(), 5);
    assert_eq!(registry.exposed_scope(&c("acme:mid")), Some(mid_exposed));
    assert_eq!(
        registry.get(&c("acme:app")).unwrap().state(),
        IntegrationState::Running
    );
}

#[tokio::test]
async fn test_dependencies_start_before_dependents() {
    let tree = ModuleTree::new();
    let descriptors = vec![
        tree.module("acme:app", &["acme:lib"], ""),
        tree.module("acme:lib", &[], ""),
    ];
    let backend = FakeBackend::new();
    let mut orchestrator = LoadOrchestrator::new(backend.clone(), options(&tree));

    let report = orchestrator.bring_up(descriptors).await.unwrap();
    assert_eq!(report.load_order, vec![c("acme:lib"), c("acme:app")]);

    let events = backend.events();
    assert_eq!(
        events,
        vec![
            "acme:lib on_load",
            "acme:lib on_init",
            "acme:lib on_start",
            "acme:app on_load",
            "acme:app on_init",
            "acme:app on_start",
        ]
    );
}

#[tokio::test]
async fn test_modules_receive_context_and_options() {
    let tree = ModuleTree::new();
    let descriptors = vec![tree.module(
        "acme:zigbee",
        &[],
        "[capabilities]\nflags = [\"polling\"]\n\n[config]\npoll_interval_secs = 30\n",
    )];
    let backend = FakeBackend::new();
    let mut orchestrator = LoadOrchestrator::new(backend.clone(), options(&tree));
    orchestrator.bring_up(descriptors).await.unwrap();

    let (host, opts) = backend.context("acme:zigbee").unwrap();
    assert_eq!(host.host_version, "1.0.0");
    assert_eq!(host.data_dir, tree.data_dir().join("acme").join("zigbee"));
    assert!(host.data_dir.is_dir());
    assert_eq!(opts.entry_type, "main");
    assert_eq!(opts.flags, vec!["polling"]);
    assert_eq!(opts.config["poll_interval_secs"], 30);
}

#[tokio::test]
async fn test_failed_module_does_not_stop_session() {
    let tree = ModuleTree::new();
    let descriptors = vec![
        tree.module("acme:lib", &[], "[capabilities]\nexpose-scope = \"own\"\n"),
        tree.module("acme:app", &["acme:lib"], ""),
        tree.module("acme:solo", &[], ""),
    ];
    let backend = FakeBackend::new()
        .script("acme:lib", Script::FailAt(LifecyclePhase::Init))
        .link("acme:app", "acme:lib");
    let mut orchestrator = LoadOrchestrator::new(backend.clone(), options(&tree));

    let report = orchestrator.bring_up(descriptors).await.unwrap();

    assert!(matches!(
        report.outcome(&c("acme:lib")),
        Some(ModuleOutcome::Failed(BringUpFailure::Lifecycle(_)))
    ));
    // lib never registered, so app links against nothing.
    assert!(matches!(
        report.outcome(&c("acme:app")),
        Some(ModuleOutcome::Failed(BringUpFailure::Load(
            ModuleError::UnresolvedImport { .. }
        )))
    ));
    assert!(report.outcome(&c("acme:solo")).unwrap().is_started());

    assert_eq!(orchestrator.registry().coordinates(), vec![c("acme:solo")]);
    assert_eq!(backend.discarded(), vec![c("acme:lib")]);
    assert!(!backend.events().contains(&"acme:lib on_start".to_owned()));
}

#[tokio::test]
async fn test_backend_load_failure_is_per_module() {
    let tree = ModuleTree::new();
    let descriptors = vec![
        tree.module("acme:broken", &[], ""),
        tree.module("acme:fine", &[], ""),
    ];
    let backend = FakeBackend::new().script("acme:broken", Script::FailLoad);
    let mut orchestrator = LoadOrchestrator::new(backend, options(&tree));

    let report = orchestrator.bring_up(descriptors).await.unwrap();
    let failed: Vec<_> = report.failed().map(|(c, _)| c.clone()).collect();
    assert_eq!(failed, vec![c("acme:broken")]);
    assert_eq!(report.started().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_callback_times_out() {
    let tree = ModuleTree::new();
    let descriptors = vec![
        tree.module("acme:stuck", &[], ""),
        tree.module("acme:fine", &[], ""),
    ];
    let backend =
        FakeBackend::new().script("acme:stuck", Script::HangAt(LifecyclePhase::Start));
    let mut opts = options(&tree);
    opts.lifecycle_timeout = Some(Duration::from_secs(5));
    let mut orchestrator = LoadOrchestrator::new(backend.clone(), opts);

    let report = orchestrator.bring_up(descriptors).await.unwrap();

    match report.outcome(&c("acme:stuck")) {
        Some(ModuleOutcome::Failed(BringUpFailure::TimedOut { phase, after })) => {
            assert_eq!(*phase, LifecyclePhase::Start);
            assert_eq!(*after, Duration::from_secs(5));
        },
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(report.outcome(&c("acme:fine")).unwrap().is_started());
    assert_eq!(backend.discarded(), vec![c("acme:stuck")]);
    assert!(!orchestrator.registry().contains(&c("acme:stuck")));
    assert!(orchestrator.registry().contains(&c("acme:fine")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_readable_during_bring_up() {
    let tree = ModuleTree::new();
    let names: Vec<String> = (0..8).map(|i| format!("acme:m{i}")).collect();
    let descriptors: Vec<ModuleDescriptor> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let deps: Vec<&str> = i
                .checked_sub(1)
                .map(|prev| vec![names[prev].as_str()])
                .unwrap_or_default();
            tree.module(name, &deps, "[capabilities]\nexpose-scope = \"own\"\n")
        })
        .collect();
    let mut orchestrator = LoadOrchestrator::new(FakeBackend::new(), options(&tree));
    let registry = Arc::clone(orchestrator.registry());
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut snapshots = 0_usize;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    for status in registry.statuses() {
                        assert_eq!(status.state, IntegrationState::Running, "{status:?}");
                        assert_eq!(status.exposed_scope, Some(status.scope), "{status:?}");
                    }
                    for coordinate in registry.coordinates() {
                        assert!(registry.exposed_scope(&coordinate).is_some(), "{coordinate}");
                    }
                    snapshots = snapshots.saturating_add(1);
                    if finished {
                        return snapshots;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let report = orchestrator.bring_up(descriptors).await.unwrap();
    done.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }

    let started: Vec<_> = report.started().cloned().collect();
    assert_eq!(started.len(), names.len());
    let mut expected: Vec<_> = names.iter().map(|n| c(n)).collect();
    expected.sort();
    assert_eq!(registry.coordinates(), expected);
}

#[tokio::test]
async fn test_cycle_aborts_before_anything_loads() {
    let tree = ModuleTree::new();
    let descriptors = vec![
        tree.module("acme:a", &["acme:b"], ""),
        tree.module("acme:b", &["acme:a"], ""),
        tree.module("acme:c", &[], ""),
    ];
    let backend = FakeBackend::new();
    let mut orchestrator = LoadOrchestrator::new(backend.clone(), options(&tree));

    let err = orchestrator.bring_up(descriptors).await.unwrap_err();
    let ModuleError::DependencyCycle { members } = err else {
        panic!("expected a cycle, got {err:?}");
    };
    assert_eq!(members, vec![c("acme:a"), c("acme:b")]);
    assert!(backend.events().is_empty());
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_disabled_dependency_aborts_session() {
    let tree = ModuleTree::new();
    let mut lib = tree.module("acme:lib", &[], "");
    lib.enabled = false;
    let descriptors = vec![lib, tree.module("acme:app", &["acme:lib"], "")];
    let mut orchestrator = LoadOrchestrator::new(FakeBackend::new(), options(&tree));

    assert!(matches!(
        orchestrator.bring_up(descriptors).await,
        Err(ModuleError::UnknownDependency { .. })
    ));
}

#[tokio::test]
async fn test_missing_archive_is_reported() {
    let tree = ModuleTree::new();
    let descriptors = vec![
        ModuleDescriptor::new(c("acme:ghost"), "1.0.0"),
        tree.module("acme:real", &[], ""),
    ];
    let mut orchestrator = LoadOrchestrator::new(FakeBackend::new(), options(&tree));

    let report = orchestrator.bring_up(descriptors).await.unwrap();
    assert!(matches!(
        report.outcome(&c("acme:ghost")),
        Some(ModuleOutcome::Failed(BringUpFailure::MissingArchive(_)))
    ));
    assert!(report.outcome(&c("acme:real")).unwrap().is_started());
}

#[tokio::test]
async fn test_ambiguous_entry_types_abort_session() {
    let tree = ModuleTree::new();
    let archive = tree.add("acme:twin", &[], "");
    std::fs::write(archive.root.join("second.wasm"), common::concrete_entry()).unwrap();
    let descriptors = vec![tree.descriptor(&archive)];
    let mut orchestrator = LoadOrchestrator::new(FakeBackend::new(), options(&tree));

    let err = orchestrator.bring_up(descriptors).await.unwrap_err();
    let ModuleError::MultipleEntryClasses { candidates, .. } = err else {
        panic!("expected MultipleEntryClasses, got {err:?}");
    };
    assert_eq!(candidates, vec!["main", "second"]);
}

#[tokio::test]
async fn test_compatibility_errors_are_advisory_by_default() {
    let tree = ModuleTree::new();
    let future = "[module]\nnamespace = \"acme\"\nname = \"future\"\nversion = \"1.0.0\"\n\
                  requires-host = \"^9.0.0\"\n";
    let archive = tree.add("acme:future", &[], "");
    std::fs::write(archive.manifest_path(), future).unwrap();
    let descriptors = vec![tree.descriptor(&archive)];

    let mut orchestrator = LoadOrchestrator::new(FakeBackend::new(), options(&tree));
    let report = orchestrator.bring_up(descriptors.clone()).await.unwrap();
    assert!(report.issues.has(IssueType::HostVersionMismatch));
    assert_eq!(report.started().count(), 1);

    let mut strict = options(&tree);
    strict.abort_on_compat_errors = true;
    let mut orchestrator = LoadOrchestrator::new(FakeBackend::new(), strict);
    let err = orchestrator.bring_up(descriptors).await.unwrap_err();
    assert!(matches!(err, ModuleError::BringUpAborted { .. }));
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_shutdown_releases_in_reverse_order() {
    let tree = ModuleTree::new();
    let descriptors = vec![
        tree.module("acme:app", &["acme:lib"], ""),
        tree.module("acme:lib", &[], ""),
    ];
    let backend = FakeBackend::new().script("acme:app", Script::FailAt(LifecyclePhase::Pause));
    let mut orchestrator = LoadOrchestrator::new(backend.clone(), options(&tree));
    orchestrator.bring_up(descriptors).await.unwrap();

    let failures = orchestrator.shutdown().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, c("acme:app"));

    let events = backend.events();
    assert!(position(&events, "acme:app on_pause") < position(&events, "acme:lib on_pause"));
    assert!(position(&events, "acme:lib on_pause") < position(&events, "acme:lib on_release"));
    assert!(orchestrator.registry().is_empty());
    assert_eq!(backend.discarded(), vec![c("acme:app"), c("acme:lib")]);
}

#[tokio::test]
async fn test_bring_up_from_disk_records_entry_types() {
    let tree = ModuleTree::new();
    tree.add("acme:lib", &[], "");
    tree.add("acme:app", &["acme:lib"], "");
    tree.add("acme:off", &[], "");

    let writer = TransactionalConfigWriter::new(tree.registry_path());
    let mut entries = BTreeMap::new();
    for (coord, enabled) in [("acme:lib", true), ("acme:app", true), ("acme:off", false)] {
        entries.insert(
            coord.to_owned(),
            PersistedConfigEntry::new(&c(coord), "1.0.0").with_enabled(enabled),
        );
    }
    writer.write_atomic(entries, WriteMode::Replace).unwrap();

    let backend = FakeBackend::new();
    let mut orchestrator = LoadOrchestrator::new(backend.clone(), options(&tree));
    let report = orchestrator
        .bring_up_from_disk(&tree.modules_dir(), &writer)
        .await
        .unwrap();

    assert_eq!(report.load_order, vec![c("acme:lib"), c("acme:app")]);
    assert!(!backend.events().iter().any(|e| e.starts_with("acme:off")));

    let persisted = writer.read().unwrap();
    assert_eq!(
        persisted.get(&c("acme:app")).unwrap().entry_type.as_deref(),
        Some("main")
    );
    assert_eq!(persisted.get(&c("acme:off")).unwrap().entry_type, None);
}

#[tokio::test]
async fn test_second_session_after_shutdown() {
    let tree = ModuleTree::new();
    let descriptors = vec![tree.module("acme:lib", &[], "")];
    let backend = FakeBackend::new();

    let mut first = LoadOrchestrator::new(backend.clone(), options(&tree));
    first.bring_up(descriptors.clone()).await.unwrap();
    first.shutdown().await;

    let mut second = LoadOrchestrator::new(backend, options(&tree));
    let report = second.bring_up(descriptors).await.unwrap();
    assert!(report.outcome(&c("acme:lib")).unwrap().is_started());
}
