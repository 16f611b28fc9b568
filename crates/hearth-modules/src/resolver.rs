//! Dependency graph resolution.
//!
//! Produces the order modules are brought up in: every dependency strictly
//! before its dependents, shared libraries first, leaf applications last.
//!
//! The graph is processed with Kahn's algorithm over "depended-on-by" edges
//! and the result is reversed. Among modules that become ready at the same
//! time, the one listed first in the input wins. That tie-break is stable
//! across runs for the same input, but callers should not rely on any order
//! beyond the dependency guarantee.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::Coordinate;
use crate::descriptor::ModuleDescriptor;
use crate::error::{ModuleError, ModuleResult};

/// A validated bring-up order for one session.
#[derive(Debug, Clone, Default)]
pub struct LoadOrder {
    modules: Vec<ModuleDescriptor>,
    index: HashMap<Coordinate, usize>,
}

impl LoadOrder {
    /// Descriptors in bring-up order.
    #[must_use]
    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    /// Coordinates in bring-up order.
    pub fn coordinates(&self) -> impl Iterator<Item = &Coordinate> {
        self.modules.iter().map(|m| &m.coordinate)
    }

    /// Look up a descriptor by coordinate.
    #[must_use]
    pub fn get(&self, coordinate: &Coordinate) -> Option<&ModuleDescriptor> {
        self.index.get(coordinate).map(|&i| &self.modules[i])
    }

    /// Position of a coordinate in the order.
    #[must_use]
    pub fn position(&self, coordinate: &Coordinate) -> Option<usize> {
        self.index.get(coordinate).copied()
    }

    /// Number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the order is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Compute the load order for `descriptors`.
///
/// Sets `is_depended` on every returned descriptor.
///
/// # Errors
///
/// - [`ModuleError::DuplicateCoordinate`] if two descriptors share a
///   coordinate.
/// - [`ModuleError::UnknownDependency`] if a dependency names a coordinate
///   outside `descriptors`.
/// - [`ModuleError::DependencyCycle`] if no order exists. The error lists
///   every coordinate left unprocessed; no partial order is returned.
pub fn resolve(descriptors: Vec<ModuleDescriptor>) -> ModuleResult<LoadOrder> {
    let mut position: HashMap<Coordinate, usize> = HashMap::with_capacity(descriptors.len());
    for (i, d) in descriptors.iter().enumerate() {
        if position.insert(d.coordinate.clone(), i).is_some() {
            return Err(ModuleError::DuplicateCoordinate(d.coordinate.clone()));
        }
    }

    // edges[i] = indices of the modules i depends on, declaration order.
    let mut edges: Vec<Vec<usize>> = Vec::with_capacity(descriptors.len());
    for d in &descriptors {
        let mut targets = Vec::new();
        for target in d.dependency_targets() {
            let Some(&t) = position.get(target) else {
                return Err(ModuleError::UnknownDependency {
                    module: d.coordinate.clone(),
                    target: target.clone(),
                });
            };
            targets.push(t);
        }
        edges.push(targets);
    }

    // in_degree[x] = number of distinct descriptors that depend on x.
    let mut in_degree = vec![0_usize; descriptors.len()];
    let mut depended: HashSet<usize> = HashSet::new();
    for targets in &edges {
        for &t in targets {
            in_degree[t] = in_degree[t].saturating_add(1);
            depended.insert(t);
        }
    }

    let mut queue: VecDeque<usize> = (0..descriptors.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();
    let mut raw: Vec<usize> = Vec::with_capacity(descriptors.len());

    while let Some(i) = queue.pop_front() {
        raw.push(i);
        for &t in &edges[i] {
            in_degree[t] = in_degree[t].saturating_sub(1);
            if in_degree[t] == 0 {
                queue.push_back(t);
            }
        }
    }

    if raw.len() < descriptors.len() {
        let members: Vec<Coordinate> = descriptors
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, d)| d.coordinate.clone())
            .collect();
        return Err(ModuleError::DependencyCycle { members });
    }

    raw.reverse();

    let mut slots: Vec<Option<ModuleDescriptor>> = descriptors.into_iter().map(Some).collect();
    let mut modules = Vec::with_capacity(raw.len());
    let mut index = HashMap::with_capacity(raw.len());
    for i in raw {
        if let Some(mut d) = slots[i].take() {
            d.is_depended = depended.contains(&i);
            index.insert(d.coordinate.clone(), modules.len());
            modules.push(d);
        }
    }

    debug!(
        order = %modules
            .iter()
            .map(|m| m.coordinate.to_string())
            .collect::<Vec<_>>()
            .join(" -> "),
        "Resolved module load order"
    );

    Ok(LoadOrder { modules, index })
}
