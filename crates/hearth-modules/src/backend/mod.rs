//! Code-loading backends.
//!
//! A backend turns an entry type of an archive into a live [`Integration`]
//! bound to an isolation scope. The scope tree itself lives in the
//! [`ScopeArena`]; backends only consult it to decide what a module may link
//! against.

pub mod wasm;

use async_trait::async_trait;

use crate::Coordinate;
use crate::discovery::ModuleArchive;
use crate::error::ModuleResult;
use crate::integration::Integration;
use crate::scope::{ScopeArena, ScopeId};

pub use wasm::{WasmBackend, WasmLimits};

/// Loads entry types into isolation scopes.
#[async_trait]
pub trait ScopeBackend: Send + Sync {
    /// Instantiate `entry_type` from `archive` inside `scope`.
    ///
    /// Everything the module links against must be visible from `scope`
    /// according to `arena`.
    async fn load_entry(
        &self,
        arena: &ScopeArena,
        scope: ScopeId,
        archive: &ModuleArchive,
        entry_type: &str,
    ) -> ModuleResult<Box<dyn Integration>>;

    /// Drop any backend state kept for `coordinate`.
    ///
    /// Called for modules that failed after loading and for every module at
    /// shutdown.
    fn discard(&self, _coordinate: &Coordinate) {}
}
