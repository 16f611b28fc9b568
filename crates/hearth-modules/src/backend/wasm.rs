//! WebAssembly backend on top of Extism.
//!
//! Every loaded entry type gets its own plugin instance. Imports whose module
//! name is a coordinate (`acme:serial`) are cross-module calls: they link
//! only when that coordinate is defined in a scope visible from the
//! importer's scope, and each call is forwarded to the provider's instance
//! as bytes in, bytes out. `hearth_log(level, message)` is always available.
//!
//! Lifecycle callbacks are plain Extism exports named after the phase.
//! `on_load` receives `{"host": .., "options": ..}` as JSON; the others
//! receive no input. A callback fails by returning an Extism error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use extism::{CurrentPlugin, Error, Manifest, PTR, PluginBuilder, UserData, Val, Wasm};
use tracing::{debug, info};
use wasmparser::{Parser, Payload, TypeRef};

use crate::Coordinate;
use crate::backend::ScopeBackend;
use crate::discovery::ModuleArchive;
use crate::error::{ModuleError, ModuleResult};
use crate::integration::{HostContext, Integration, LifecyclePhase, LoadOptions};
use crate::scanner::CONTRACT_NAMESPACE;
use crate::scope::{ScopeArena, ScopeId};

/// Maximum payload forwarded between modules (10 MB).
const MAX_FORWARD_PAYLOAD: u64 = 10 * 1024 * 1024;

/// Maximum length of a log message (64 KB).
const MAX_LOG_MESSAGE_LEN: u64 = 64 * 1024;

/// Name of the logging host function.
pub const LOG_FUNCTION: &str = "hearth_log";

/// Resource limits applied to every plugin instance.
#[derive(Debug, Clone, Copy)]
pub struct WasmLimits {
    /// Linear memory cap in MiB.
    pub max_memory_mb: u32,
    /// Wall-clock cap for a single call.
    pub call_timeout: Duration,
}

impl Default for WasmLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 64,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl WasmLimits {
    fn memory_pages(self) -> u32 {
        // 64 KiB pages.
        self.max_memory_mb.saturating_mul(16)
    }
}

type SharedPlugin = Arc<Mutex<extism::Plugin>>;
type Instances = Arc<DashMap<Coordinate, SharedPlugin>>;

/// Extism-backed [`ScopeBackend`].
#[derive(Clone, Default)]
pub struct WasmBackend {
    limits: WasmLimits,
    instances: Instances,
}

impl std::fmt::Debug for WasmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmBackend")
            .field("limits", &self.limits)
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl WasmBackend {
    /// A backend with the given limits and no instances.
    #[must_use]
    pub fn new(limits: WasmLimits) -> Self {
        Self {
            limits,
            instances: Arc::default(),
        }
    }

    /// Number of live plugin instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[async_trait]
impl ScopeBackend for WasmBackend {
    async fn load_entry(
        &self,
        arena: &ScopeArena,
        scope: ScopeId,
        archive: &ModuleArchive,
        entry_type: &str,
    ) -> ModuleResult<Box<dyn Integration>> {
        let coordinate = archive.coordinate.clone();
        let path = archive.entry_path(entry_type);
        let bytes = std::fs::read(&path).map_err(|e| ModuleError::LoadFailed {
            coordinate: coordinate.clone(),
            message: format!("failed to read {}: {e}", path.display()),
        })?;

        let links = module_links(&bytes).map_err(|message| ModuleError::LoadFailed {
            coordinate: coordinate.clone(),
            message,
        })?;
        for link in &links {
            if arena.resolve(scope, &link.provider).is_none() {
                return Err(ModuleError::UnresolvedImport {
                    coordinate: coordinate.clone(),
                    provider: link.provider.to_string(),
                    scope,
                });
            }
        }

        let limits = self.limits;
        let instances = Arc::clone(&self.instances);
        let owner = coordinate.clone();
        let plugin = tokio::task::spawn_blocking(move || {
            build_plugin(bytes, limits, &owner, &links, &instances)
        })
        .await
        .map_err(|e| ModuleError::LoadFailed {
            coordinate: coordinate.clone(),
            message: format!("plugin build task failed: {e}"),
        })?
        .map_err(|e| ModuleError::LoadFailed {
            coordinate: coordinate.clone(),
            message: format!("failed to build plugin: {e}"),
        })?;

        let plugin = Arc::new(Mutex::new(plugin));
        self.instances
            .insert(coordinate.clone(), Arc::clone(&plugin));
        info!(
            coordinate = %coordinate,
            entry_type = %entry_type,
            scope = %scope,
            "Loaded WebAssembly entry type"
        );
        Ok(Box::new(WasmIntegration { coordinate, plugin }))
    }

    fn discard(&self, coordinate: &Coordinate) {
        if self.instances.remove(coordinate).is_some() {
            debug!(coordinate = %coordinate, "Dropped plugin instance");
        }
    }
}

/// A cross-module import: `provider` must be visible, `function` is called.
#[derive(Debug, Clone)]
struct Link {
    provider: Coordinate,
    function: String,
}

/// Function imports whose module name is a coordinate. The contract
/// namespace is a declaration, not a provider.
fn module_links(bytes: &[u8]) -> Result<Vec<Link>, String> {
    let mut links = Vec::new();
    for payload in Parser::new(0).parse_all(bytes) {
        let Payload::ImportSection(reader) = payload.map_err(|e| e.to_string())? else {
            continue;
        };
        for import in reader {
            let import = import.map_err(|e| e.to_string())?;
            if !matches!(import.ty, TypeRef::Func(_))
                || import.module == CONTRACT_NAMESPACE
                || !Coordinate::is_coordinate(import.module)
            {
                continue;
            }
            let provider = import.module.parse().map_err(|e| format!("{e}"))?;
            links.push(Link {
                provider,
                function: import.name.to_owned(),
            });
        }
    }
    Ok(links)
}

fn build_plugin(
    bytes: Vec<u8>,
    limits: WasmLimits,
    owner: &Coordinate,
    links: &[Link],
    instances: &Instances,
) -> Result<extism::Plugin, Error> {
    let manifest = Manifest::new([Wasm::data(bytes)])
        .with_timeout(limits.call_timeout)
        .with_memory_max(limits.memory_pages());

    let mut builder = PluginBuilder::new(manifest).with_wasi(true).with_function(
        LOG_FUNCTION,
        [PTR, PTR],
        [],
        UserData::new(owner.to_string()),
        hearth_log_impl,
    );

    for link in links {
        let target = ForwardTarget {
            instances: Arc::clone(instances),
            provider: link.provider.clone(),
            function: link.function.clone(),
        };
        builder = builder.with_function_in_namespace(
            link.provider.to_string(),
            &link.function,
            [PTR],
            [PTR],
            UserData::new(target),
            forward_impl,
        );
    }
    builder.build()
}

struct ForwardTarget {
    instances: Instances,
    provider: Coordinate,
    function: String,
}

/// Read a guest memory block after checking its length against `limit`.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn guest_bytes(plugin: &mut CurrentPlugin, val: &Val, limit: u64) -> Result<Vec<u8>, Error> {
    let ptr = match val {
        Val::I64(v) => *v as u64,
        Val::I32(v) => u64::from(*v as u32),
        _ => return Err(Error::msg("expected memory pointer value")),
    };
    let len = plugin.memory_length(ptr)?;
    if len > limit {
        return Err(Error::msg(format!(
            "guest block of {len} bytes exceeds the {limit} byte limit"
        )));
    }
    plugin.memory_get_val(&Val::I64(ptr as i64))
}

#[allow(clippy::needless_pass_by_value)]
fn hearth_log_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<String>,
) -> Result<(), Error> {
    let (Some(level), Some(message)) = (inputs.first(), inputs.get(1)) else {
        return Err(Error::msg("hearth_log takes two arguments"));
    };
    let level = String::from_utf8_lossy(&guest_bytes(plugin, level, 64)?).to_lowercase();
    let message = String::from_utf8_lossy(&guest_bytes(plugin, message, MAX_LOG_MESSAGE_LEN)?)
        .into_owned();

    let owner = user_data.get()?;
    let owner = owner
        .lock()
        .map_err(|e| Error::msg(format!("log state lock poisoned: {e}")))?
        .clone();

    match level.as_str() {
        "trace" => tracing::trace!(module = %owner, "{message}"),
        "debug" => tracing::debug!(module = %owner, "{message}"),
        "warn" | "warning" => tracing::warn!(module = %owner, "{message}"),
        "error" | "err" => tracing::error!(module = %owner, "{message}"),
        _ => tracing::info!(module = %owner, "{message}"),
    }
    Ok(())
}

/// Forward a cross-module call to the provider's instance.
///
/// The provider's instance is locked for the duration of the call, so a
/// provider calling back into its caller deadlocks. Visibility rules make
/// such back-edges unreachable for modules placed by the allocator.
#[allow(clippy::needless_pass_by_value)]
fn forward_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<ForwardTarget>,
) -> Result<(), Error> {
    let input = inputs
        .first()
        .ok_or_else(|| Error::msg("forwarded call takes one argument"))?;
    let payload = guest_bytes(plugin, input, MAX_FORWARD_PAYLOAD)?;

    let target = user_data.get()?;
    let (provider, function, instance) = {
        let target = target
            .lock()
            .map_err(|e| Error::msg(format!("forward state lock poisoned: {e}")))?;
        let instance = target
            .instances
            .get(&target.provider)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| Error::msg(format!("{} is not running", target.provider)))?;
        (target.provider.clone(), target.function.clone(), instance)
    };

    let response: Vec<u8> = {
        let mut provider_plugin = instance
            .lock()
            .map_err(|e| Error::msg(format!("{provider} instance lock poisoned: {e}")))?;
        provider_plugin.call::<Vec<u8>, Vec<u8>>(&function, payload)?
    };

    let handle = plugin.memory_new(response.as_slice())?;
    let slot = outputs
        .first_mut()
        .ok_or_else(|| Error::msg("forwarded call returns one value"))?;
    *slot = plugin.memory_to_val(handle);
    Ok(())
}

/// A running WebAssembly entry type.
struct WasmIntegration {
    coordinate: Coordinate,
    plugin: SharedPlugin,
}

impl WasmIntegration {
    async fn invoke(&self, phase: LifecyclePhase, input: Vec<u8>) -> ModuleResult<()> {
        let plugin = Arc::clone(&self.plugin);
        let coordinate = self.coordinate.clone();
        let fail = move |message: String| ModuleError::Lifecycle {
            coordinate: coordinate.clone(),
            phase,
            message,
        };

        let result = tokio::task::spawn_blocking(move || -> Result<(), String> {
            let mut plugin = plugin
                .lock()
                .map_err(|e| format!("instance lock poisoned: {e}"))?;
            plugin
                .call::<Vec<u8>, Vec<u8>>(phase.export_name(), input)
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(fail(message)),
            Err(join) => Err(fail(format!("call task failed: {join}"))),
        }
    }
}

#[async_trait]
impl Integration for WasmIntegration {
    async fn on_load(&mut self, host: &HostContext, options: &LoadOptions) -> ModuleResult<()> {
        let input = serde_json::to_vec(&serde_json::json!({
            "host": host,
            "options": options,
        }))
        .map_err(|e| ModuleError::Lifecycle {
            coordinate: self.coordinate.clone(),
            phase: LifecyclePhase::Load,
            message: format!("failed to encode load input: {e}"),
        })?;
        self.invoke(LifecyclePhase::Load, input).await
    }

    async fn on_init(&mut self) -> ModuleResult<()> {
        self.invoke(LifecyclePhase::Init, Vec::new()).await
    }

    async fn on_start(&mut self) -> ModuleResult<()> {
        self.invoke(LifecyclePhase::Start, Vec::new()).await
    }

    async fn on_pause(&mut self) -> ModuleResult<()> {
        self.invoke(LifecyclePhase::Pause, Vec::new()).await
    }

    async fn on_release(&mut self) -> ModuleResult<()> {
        self.invoke(LifecyclePhase::Release, Vec::new()).await
    }
}
