//! Advisory compatibility checks.
//!
//! Nothing here fails an operation by itself. The checker returns every issue
//! it finds and the caller decides what to refuse: installs refuse on
//! errors concerning the candidate, bring-up only logs unless configured to
//! abort.

use std::collections::{HashMap, HashSet};
use std::fmt;

use semver::Version;
use tracing::{info, warn};

use crate::Coordinate;
use crate::descriptor::ModuleDescriptor;
use crate::version::parse_version;

/// Kind of compatibility issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueType {
    /// A dependency target is not part of the module set.
    MissingDependency,
    /// A dependency is declared without a version range.
    NoVersionConstraint,
    /// A dependency target's version falls outside the declared range.
    VersionConstraintViolation,
    /// A version string that has to be compared cannot be parsed.
    InvalidVersion,
    /// The running host is outside the module's `requires-host` range.
    HostVersionMismatch,
    /// A newer major version is known.
    OutdatedMajorVersion,
    /// A newer minor version is known.
    OutdatedMinorVersion,
    /// A newer patch version is known.
    OutdatedPatchVersion,
    /// The modules' dependencies form a cycle.
    CircularDependency,
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MissingDependency => "MISSING_DEPENDENCY",
            Self::NoVersionConstraint => "NO_VERSION_CONSTRAINT",
            Self::VersionConstraintViolation => "VERSION_CONSTRAINT_VIOLATION",
            Self::InvalidVersion => "INVALID_VERSION",
            Self::HostVersionMismatch => "HOST_VERSION_MISMATCH",
            Self::OutdatedMajorVersion => "OUTDATED_MAJOR_VERSION",
            Self::OutdatedMinorVersion => "OUTDATED_MINOR_VERSION",
            Self::OutdatedPatchVersion => "OUTDATED_PATCH_VERSION",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
        })
    }
}

/// How serious an issue is. Only `Error` fails a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational.
    Info,
    /// Worth a look; never blocks.
    Warning,
    /// Blocks operations that care about compatibility.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        })
    }
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityIssue {
    /// What kind of problem.
    pub issue_type: IssueType,
    /// How serious.
    pub severity: Severity,
    /// The modules involved; the declaring module comes first.
    pub subjects: Vec<Coordinate>,
    /// Human-readable description.
    pub message: String,
}

impl CompatibilityIssue {
    fn new(
        issue_type: IssueType,
        severity: Severity,
        subjects: Vec<Coordinate>,
        message: String,
    ) -> Self {
        Self {
            issue_type,
            severity,
            subjects,
            message,
        }
    }

    /// Whether `coordinate` is one of the subjects.
    #[must_use]
    pub fn concerns(&self, coordinate: &Coordinate) -> bool {
        self.subjects.contains(coordinate)
    }
}

impl fmt::Display for CompatibilityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.issue_type, self.message)
    }
}

/// Every issue from one check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    issues: Vec<CompatibilityIssue>,
}

impl CheckResult {
    /// True iff no issue has `Error` severity.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    /// All issues, in discovery order.
    #[must_use]
    pub fn issues(&self) -> &[CompatibilityIssue] {
        &self.issues
    }

    /// Issues with `Error` severity.
    pub fn errors(&self) -> impl Iterator<Item = &CompatibilityIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
    }

    /// Issues with `Warning` severity.
    pub fn warnings(&self) -> impl Iterator<Item = &CompatibilityIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }

    /// Whether any issue is of `issue_type`.
    #[must_use]
    pub fn has(&self, issue_type: IssueType) -> bool {
        self.issues.iter().any(|i| i.issue_type == issue_type)
    }

    /// Append the issues of another check.
    pub fn extend(&mut self, other: Self) {
        self.issues.extend(other.issues);
    }

    /// Log every issue at a level matching its severity.
    pub fn log(&self) {
        for issue in &self.issues {
            let subjects = issue
                .subjects
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            match issue.severity {
                Severity::Error => tracing::error!(
                    issue = %issue.issue_type,
                    subjects = %subjects,
                    "{}", issue.message
                ),
                Severity::Warning => warn!(
                    issue = %issue.issue_type,
                    subjects = %subjects,
                    "{}", issue.message
                ),
                Severity::Info => info!(
                    issue = %issue.issue_type,
                    subjects = %subjects,
                    "{}", issue.message
                ),
            }
        }
    }

    fn push(&mut self, issue: CompatibilityIssue) {
        self.issues.push(issue);
    }
}

/// Produces advisory compatibility issues for a module set.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityChecker {
    host_version: Option<Version>,
}

impl CompatibilityChecker {
    /// A checker that does not know the host version.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also check each module's `requires-host` range against `version`.
    #[must_use]
    pub fn with_host_version(mut self, version: Version) -> Self {
        self.host_version = Some(version);
        self
    }

    /// Check dependency constraints, host requirements and, when
    /// `available` is given, whether newer versions are known.
    ///
    /// `available` maps coordinates to every version the package registry
    /// knows of; unparsable entries are ignored.
    #[must_use]
    pub fn check_compatibility(
        &self,
        descriptors: &[ModuleDescriptor],
        available: Option<&HashMap<Coordinate, Vec<String>>>,
    ) -> CheckResult {
        let by_coordinate: HashMap<&Coordinate, &ModuleDescriptor> =
            descriptors.iter().map(|d| (&d.coordinate, d)).collect();
        let mut result = CheckResult::default();

        for d in descriptors {
            self.check_host(d, &mut result);

            for dep in &d.dependencies {
                let subjects = vec![d.coordinate.clone(), dep.target.clone()];
                let Some(target) = by_coordinate.get(&dep.target) else {
                    result.push(CompatibilityIssue::new(
                        IssueType::MissingDependency,
                        Severity::Error,
                        subjects,
                        format!("{} depends on {}, which is not installed", d.coordinate, dep.target),
                    ));
                    continue;
                };
                if dep.range.is_any() {
                    result.push(CompatibilityIssue::new(
                        IssueType::NoVersionConstraint,
                        Severity::Warning,
                        subjects,
                        format!("{} depends on {} without a version range", d.coordinate, dep.target),
                    ));
                    continue;
                }
                match parse_version(&target.version) {
                    Err(e) => result.push(CompatibilityIssue::new(
                        IssueType::InvalidVersion,
                        Severity::Error,
                        subjects,
                        format!("cannot compare {} against '{}': {e}", dep.target, dep.range),
                    )),
                    Ok(v) if !dep.range.matches(&v) => result.push(CompatibilityIssue::new(
                        IssueType::VersionConstraintViolation,
                        Severity::Error,
                        subjects,
                        format!(
                            "{} requires {} {}, found {}",
                            d.coordinate, dep.target, dep.range, target.version
                        ),
                    )),
                    Ok(_) => {},
                }
            }

            if let Some(versions) = available.and_then(|a| a.get(&d.coordinate)) {
                check_outdated(d, versions, &mut result);
            }
        }
        result
    }

    /// Find dependency cycles with a depth-first search.
    ///
    /// Each distinct cycle is reported once as a `CircularDependency` error.
    /// Dependencies on modules outside `descriptors` are ignored here.
    #[must_use]
    pub fn check_circular_dependencies(&self, descriptors: &[ModuleDescriptor]) -> CheckResult {
        let graph: HashMap<&Coordinate, Vec<&Coordinate>> = descriptors
            .iter()
            .map(|d| (&d.coordinate, d.dependency_targets().collect()))
            .collect();

        let mut search = CycleSearch {
            graph: &graph,
            visited: HashSet::new(),
            stack: Vec::new(),
            seen_cycles: HashSet::new(),
            result: CheckResult::default(),
        };
        for d in descriptors {
            search.visit(&d.coordinate);
        }
        search.result
    }

    /// Both checks, compatibility issues first.
    #[must_use]
    pub fn check_all(
        &self,
        descriptors: &[ModuleDescriptor],
        available: Option<&HashMap<Coordinate, Vec<String>>>,
    ) -> CheckResult {
        let mut result = self.check_compatibility(descriptors, available);
        result.extend(self.check_circular_dependencies(descriptors));
        result
    }

    fn check_host(&self, d: &ModuleDescriptor, result: &mut CheckResult) {
        let Some(host) = &self.host_version else {
            return;
        };
        if !d.requires_host.matches(host) {
            result.push(CompatibilityIssue::new(
                IssueType::HostVersionMismatch,
                Severity::Error,
                vec![d.coordinate.clone()],
                format!(
                    "{} requires host {}, running {host}",
                    d.coordinate, d.requires_host
                ),
            ));
        }
    }
}

fn check_outdated(d: &ModuleDescriptor, versions: &[String], result: &mut CheckResult) {
    let Some(latest) = versions.iter().filter_map(|v| parse_version(v).ok()).max() else {
        return;
    };
    let Ok(current) = parse_version(&d.version) else {
        return;
    };
    let (issue_type, severity) = if latest.major != current.major {
        (IssueType::OutdatedMajorVersion, Severity::Warning)
    } else if latest.minor != current.minor {
        (IssueType::OutdatedMinorVersion, Severity::Info)
    } else if latest.patch != current.patch {
        (IssueType::OutdatedPatchVersion, Severity::Info)
    } else {
        return;
    };
    result.push(CompatibilityIssue::new(
        issue_type,
        severity,
        vec![d.coordinate.clone()],
        format!("{} {current} is installed, newest known is {latest}", d.coordinate),
    ));
}

struct CycleSearch<'a> {
    graph: &'a HashMap<&'a Coordinate, Vec<&'a Coordinate>>,
    visited: HashSet<&'a Coordinate>,
    stack: Vec<&'a Coordinate>,
    seen_cycles: HashSet<Vec<&'a Coordinate>>,
    result: CheckResult,
}

impl<'a> CycleSearch<'a> {
    fn visit(&mut self, node: &'a Coordinate) {
        if self.visited.contains(node) {
            return;
        }
        let graph = self.graph;
        self.stack.push(node);
        let neighbours = graph.get(node).map(Vec::as_slice).unwrap_or_default();
        for &next in neighbours {
            if !graph.contains_key(next) {
                continue;
            }
            if let Some(start) = self.stack.iter().position(|&c| c == next) {
                self.record(start);
            } else {
                self.visit(next);
            }
        }
        self.stack.pop();
        self.visited.insert(node);
    }

    fn record(&mut self, start: usize) {
        let members: Vec<&Coordinate> = self.stack.get(start..).unwrap_or_default().to_vec();
        let mut key = members.clone();
        key.sort();
        if !self.seen_cycles.insert(key) {
            return;
        }
        let path = members
            .iter()
            .chain(members.first())
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        self.result.push(CompatibilityIssue::new(
            IssueType::CircularDependency,
            Severity::Error,
            members.into_iter().cloned().collect(),
            format!("circular dependency: {path}"),
        ));
    }
}
