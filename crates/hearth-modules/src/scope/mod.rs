//! Isolation scopes.
//!
//! Scopes form a rooted tree owned by a [`ScopeArena`]. Modules refer to
//! scopes only through opaque [`ScopeId`] handles. A scope sees what is
//! defined in it and in every ancestor, never what is defined in children or
//! siblings, so two modules loaded into sibling scopes cannot collide.
//!
//! Two scopes exist for the lifetime of the arena: the core extension scope
//! (the root) and the shared dependent scope (its child). Every other scope is
//! created on demand and lives until the arena is dropped at shutdown.

mod allocator;
mod ancestor;

use std::collections::HashSet;
use std::fmt;

use crate::Coordinate;
use crate::error::{ModuleError, ModuleResult};

pub use allocator::{AllocationRule, IsolationScopeAllocator, ScopeAssignment};
pub use ancestor::AncestorScopeFinder;

/// Opaque handle to a scope inside a [`ScopeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct ScopeNode {
    parent: Option<ScopeId>,
    label: String,
    defined: HashSet<Coordinate>,
}

/// Owner of every scope created during a session.
#[derive(Debug)]
pub struct ScopeArena {
    nodes: Vec<ScopeNode>,
}

const CORE_EXTENSION: ScopeId = ScopeId(0);
const SHARED_DEPENDENT: ScopeId = ScopeId(1);

impl ScopeArena {
    /// An arena holding only the two long-lived scopes.
    #[must_use]
    pub fn new() -> Self {
        let mut arena = Self { nodes: Vec::new() };
        arena.push(None, "core-extension");
        arena.push(Some(CORE_EXTENSION), "shared-dependent");
        arena
    }

    /// The root scope shared libraries load into.
    #[must_use]
    pub fn core_extension(&self) -> ScopeId {
        CORE_EXTENSION
    }

    /// The child of the core scope that applications load into by default.
    #[must_use]
    pub fn shared_dependent(&self) -> ScopeId {
        SHARED_DEPENDENT
    }

    fn push(&mut self, parent: Option<ScopeId>, label: &str) -> ScopeId {
        // More than u32::MAX scopes is not a realistic session.
        let id = ScopeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(ScopeNode {
            parent,
            label: label.to_owned(),
            defined: HashSet::new(),
        });
        id
    }

    fn node(&self, id: ScopeId) -> ModuleResult<&ScopeNode> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.nodes.get(i))
            .ok_or(ModuleError::UnknownScope(id))
    }

    fn node_mut(&mut self, id: ScopeId) -> ModuleResult<&mut ScopeNode> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.nodes.get_mut(i))
            .ok_or(ModuleError::UnknownScope(id))
    }

    /// Create a new scope under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::UnknownScope`] if `parent` is not in this arena.
    pub fn create_child(&mut self, parent: ScopeId, label: &str) -> ModuleResult<ScopeId> {
        self.node(parent)?;
        Ok(self.push(Some(parent), label))
    }

    /// Create the child scope a module offers to its dependents.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::UnknownScope`] if `scope` is not in this arena.
    pub fn expose_child(&mut self, scope: ScopeId, owner: &Coordinate) -> ModuleResult<ScopeId> {
        self.create_child(scope, &format!("exposed-by:{owner}"))
    }

    /// The parent of `scope`, `None` for the root.
    #[must_use]
    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.node(scope).ok().and_then(|n| n.parent)
    }

    /// Human-readable label of `scope`.
    #[must_use]
    pub fn label(&self, scope: ScopeId) -> Option<&str> {
        self.node(scope).ok().map(|n| n.label.as_str())
    }

    /// `scope` followed by each of its ancestors up to the root.
    pub fn lineage(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        let start = self.node(scope).ok().map(|_| scope);
        std::iter::successors(start, |&s| self.parent(s))
    }

    /// Record that `coordinate` is defined in `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::AlreadyDefined`] if the coordinate is already
    /// defined in this exact scope, or [`ModuleError::UnknownScope`].
    pub fn define(&mut self, scope: ScopeId, coordinate: &Coordinate) -> ModuleResult<()> {
        let node = self.node_mut(scope)?;
        if !node.defined.insert(coordinate.clone()) {
            return Err(ModuleError::AlreadyDefined {
                coordinate: coordinate.clone(),
                scope,
            });
        }
        Ok(())
    }

    /// Find the scope that makes `coordinate` visible from `scope`.
    ///
    /// Lookup delegates to the parent first, so a definition closer to the
    /// root shadows one further down the chain.
    #[must_use]
    pub fn resolve(&self, scope: ScopeId, coordinate: &Coordinate) -> Option<ScopeId> {
        let chain: Vec<ScopeId> = self.lineage(scope).collect();
        chain
            .into_iter()
            .rev()
            .find(|&s| self.node(s).is_ok_and(|n| n.defined.contains(coordinate)))
    }

    /// Number of scopes, including the two long-lived ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the long-lived scopes exist from construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for ScopeArena {
    fn default() -> Self {
        Self::new()
    }
}
