//! Isolation scope assignment policy.

use std::fmt;

use crate::Coordinate;
use crate::error::{ModuleError, ModuleResult};
use crate::scope::{ScopeArena, ScopeId};

/// Which row of the assignment policy produced a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRule {
    /// Depended-on, no ancestor: the core extension scope.
    CoreExtension,
    /// Depended-on, ancestor is the core scope: the shared dependent scope.
    SharedForCoreDependent,
    /// Ancestor is some other scope: reuse it.
    ReuseAncestor,
    /// Leaf whose ancestor is the core scope: a fresh scope under the shared
    /// dependent scope.
    NestedUnderShared,
    /// Leaf with no ancestor: the shared dependent scope.
    SharedLeaf,
}

impl fmt::Display for AllocationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CoreExtension => "core-extension",
            Self::SharedForCoreDependent => "shared-for-core-dependent",
            Self::ReuseAncestor => "reuse-ancestor",
            Self::NestedUnderShared => "nested-under-shared",
            Self::SharedLeaf => "shared-leaf",
        })
    }
}

/// The scope a module is loaded into and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeAssignment {
    /// The scope to load into.
    pub scope: ScopeId,
    /// The policy row that chose it.
    pub rule: AllocationRule,
}

/// Decides which scope each module is loaded into.
///
/// | depended on | ancestor        | scope                                   |
/// |-------------|-----------------|-----------------------------------------|
/// | yes         | none            | core extension                          |
/// | yes         | core extension  | shared dependent                        |
/// | yes         | other scope     | that ancestor                           |
/// | no          | core extension  | new scope nested under shared dependent |
/// | no          | other scope     | that ancestor                           |
/// | no          | none            | shared dependent                        |
///
/// Modules must be assigned in load order, after every module before them
/// has been registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsolationScopeAllocator;

impl IsolationScopeAllocator {
    /// Pick the policy row for a module. Pure: creates nothing.
    #[must_use]
    pub fn rule(is_depended: bool, ancestor: Option<ScopeId>, core: ScopeId) -> AllocationRule {
        match (is_depended, ancestor) {
            (true, None) => AllocationRule::CoreExtension,
            (true, Some(a)) if a == core => AllocationRule::SharedForCoreDependent,
            (false, Some(a)) if a == core => AllocationRule::NestedUnderShared,
            (_, Some(_)) => AllocationRule::ReuseAncestor,
            (false, None) => AllocationRule::SharedLeaf,
        }
    }

    /// Assign a scope to `coordinate`, creating one when the policy asks for
    /// a fresh nested scope.
    ///
    /// # Errors
    ///
    /// Returns an error if `ancestor` is not a scope of `arena`.
    pub fn assign(
        &self,
        arena: &mut ScopeArena,
        coordinate: &Coordinate,
        is_depended: bool,
        ancestor: Option<ScopeId>,
    ) -> ModuleResult<ScopeAssignment> {
        let rule = Self::rule(is_depended, ancestor, arena.core_extension());
        let scope = match (rule, ancestor) {
            (AllocationRule::ReuseAncestor, Some(found)) => {
                arena.label(found).ok_or(ModuleError::UnknownScope(found))?;
                found
            },
            (AllocationRule::CoreExtension, _) => arena.core_extension(),
            (AllocationRule::NestedUnderShared, _) => {
                let shared = arena.shared_dependent();
                arena.create_child(shared, &format!("module:{coordinate}"))?
            },
            _ => arena.shared_dependent(),
        };
        Ok(ScopeAssignment { scope, rule })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> Coordinate {
        s.parse().unwrap()
    }

    #[test]
    fn test_policy_table() {
        let mut arena = ScopeArena::new();
        let core = arena.core_extension();
        let shared = arena.shared_dependent();
        let other = arena.create_child(core, "exposed").unwrap();
        let alloc = IsolationScopeAllocator;
        let me = c("acme:m");

        let a = alloc.assign(&mut arena, &me, true, None).unwrap();
        assert_eq!((a.scope, a.rule), (core, AllocationRule::CoreExtension));

        let a = alloc.assign(&mut arena, &me, true, Some(core)).unwrap();
        assert_eq!(
            (a.scope, a.rule),
            (shared, AllocationRule::SharedForCoreDependent)
        );

        let a = alloc.assign(&mut arena, &me, true, Some(other)).unwrap();
        assert_eq!((a.scope, a.rule), (other, AllocationRule::ReuseAncestor));

        let a = alloc.assign(&mut arena, &me, false, Some(other)).unwrap();
        assert_eq!((a.scope, a.rule), (other, AllocationRule::ReuseAncestor));

        let a = alloc.assign(&mut arena, &me, false, None).unwrap();
        assert_eq!((a.scope, a.rule), (shared, AllocationRule::SharedLeaf));
    }

    #[test]
    fn test_leaf_under_core_gets_a_fresh_nested_scope() {
        let mut arena = ScopeArena::new();
        let core = arena.core_extension();
        let alloc = IsolationScopeAllocator;

        let first = alloc
            .assign(&mut arena, &c("acme:one"), false, Some(core))
            .unwrap();
        let second = alloc
            .assign(&mut arena, &c("acme:two"), false, Some(core))
            .unwrap();

        assert_eq!(first.rule, AllocationRule::NestedUnderShared);
        assert_ne!(first.scope, second.scope);
        assert_eq!(arena.parent(first.scope), Some(arena.shared_dependent()));
        assert_eq!(arena.parent(second.scope), Some(arena.shared_dependent()));
    }

    #[test]
    fn test_foreign_ancestor_is_rejected() {
        let mut foreign_arena = ScopeArena::new();
        let foreign = foreign_arena
            .create_child(foreign_arena.core_extension(), "x")
            .unwrap();

        let mut arena = ScopeArena::new();
        let result =
            IsolationScopeAllocator.assign(&mut arena, &c("acme:m"), false, Some(foreign));
        assert!(matches!(result, Err(ModuleError::UnknownScope(_))));
    }
}
