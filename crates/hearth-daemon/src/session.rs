//! One bring-up session built from the host configuration.

use std::time::Duration;

use anyhow::Context;
use hearth_config::{Config, ResolvedPaths};
use hearth_modules::{
    BringUpReport, LoadOrchestrator, OrchestratorOptions, TransactionalConfigWriter, WasmBackend,
    WasmLimits,
};
use tracing::{error, info, warn};

/// Everything a session needs, derived once from the configuration.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub(crate) paths: ResolvedPaths,
    pub(crate) options: OrchestratorOptions,
    pub(crate) limits: WasmLimits,
}

impl SessionSettings {
    pub(crate) fn from_config(config: &Config, paths: ResolvedPaths) -> anyhow::Result<Self> {
        let host_version = semver::Version::parse(&config.host.version)
            .with_context(|| format!("host version '{}' is not semver", config.host.version))?;
        Ok(Self {
            options: OrchestratorOptions {
                host_version,
                data_dir: paths.data_dir.clone(),
                lifecycle_timeout: config.bringup.lifecycle_timeout(),
                abort_on_compat_errors: config.bringup.abort_on_compat_errors,
            },
            limits: WasmLimits {
                max_memory_mb: config.wasm.max_memory_mb,
                call_timeout: Duration::from_secs(config.wasm.call_timeout_secs),
            },
            paths,
        })
    }
}

/// A running session. Dropping it without [`Session::stop`] leaves modules
/// un-released.
pub(crate) struct Session {
    orchestrator: LoadOrchestrator<WasmBackend>,
}

impl Session {
    /// Discover, resolve and start every enabled module.
    ///
    /// A session-level failure (cycle, ambiguous entry type, unreadable
    /// registry) is logged and yields an empty session so the daemon can
    /// wait for a reload after the operator fixes the install.
    pub(crate) async fn start(settings: &SessionSettings) -> Self {
        let backend = WasmBackend::new(settings.limits);
        let mut orchestrator = LoadOrchestrator::new(backend, settings.options.clone());
        let writer = TransactionalConfigWriter::new(&settings.paths.registry_file);

        match orchestrator
            .bring_up_from_disk(&settings.paths.modules_dir, &writer)
            .await
        {
            Ok(report) => summarize(&report),
            Err(e) => error!(error = %e, "Bring-up aborted; waiting for reload"),
        }
        Self { orchestrator }
    }

    /// Pause and release every module.
    pub(crate) async fn stop(mut self) {
        let failures = self.orchestrator.shutdown().await;
        if failures.is_empty() {
            info!("All modules released");
        } else {
            warn!(failures = failures.len(), "Some modules failed to release cleanly");
        }
    }
}

fn summarize(report: &BringUpReport) {
    for (coordinate, failure) in report.failed() {
        warn!(coordinate = %coordinate, reason = %failure, "Module not running");
    }
    info!(
        started = report.started().count(),
        failed = report.failed().count(),
        issues = report.issues.issues().len(),
        "Session ready"
    );
}
