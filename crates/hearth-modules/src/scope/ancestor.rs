//! Nearest exposing ancestor lookup over the dependency graph.

use std::collections::{HashSet, VecDeque};

use crate::Coordinate;
use crate::descriptor::ModuleDescriptor;
use crate::registry::ModuleRegistry;
use crate::resolver::LoadOrder;
use crate::scope::ScopeId;

/// Finds the nearest dependency that exposes a scope for dependents.
///
/// Walks the declared dependency graph breadth-first from a module's direct
/// dependencies. The first registered module exposing a scope wins, so a
/// closer dependency beats a farther one and, at equal distance, the one
/// declared first wins. A dependency that is not registered (it failed to
/// start) is walked through, not stopped at.
///
/// Only meaningful while modules are brought up in load order: every
/// dependency of the module being placed must already have been registered
/// or have failed.
#[derive(Debug, Clone, Copy)]
pub struct AncestorScopeFinder<'a> {
    order: &'a LoadOrder,
    registry: &'a ModuleRegistry,
}

impl<'a> AncestorScopeFinder<'a> {
    /// Finder over one session's load order and registry.
    #[must_use]
    pub fn new(order: &'a LoadOrder, registry: &'a ModuleRegistry) -> Self {
        Self { order, registry }
    }

    /// The exposed scope of the nearest dependency of `module`, if any.
    #[must_use]
    pub fn find(&self, module: &ModuleDescriptor) -> Option<ScopeId> {
        let mut visited: HashSet<&Coordinate> = HashSet::new();
        visited.insert(&module.coordinate);

        let mut queue: VecDeque<&Coordinate> = VecDeque::new();
        for target in module.dependency_targets() {
            if visited.insert(target) {
                queue.push_back(target);
            }
        }

        while let Some(current) = queue.pop_front() {
            if let Some(scope) = self.registry.exposed_scope(current) {
                return Some(scope);
            }
            let Some(descriptor) = self.order.get(current) else {
                continue;
            };
            for target in descriptor.dependency_targets() {
                if visited.insert(target) {
                    queue.push_back(target);
                }
            }
        }
        None
    }
}
