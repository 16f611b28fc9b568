//! Version and version-range matching.
//!
//! Versions are semver. Short forms (`1`, `1.4`) are accepted and padded with
//! zeros. A range is one of:
//!
//! - `any`, `*` or the empty string: every version matches,
//! - a bare version (`1.4.0`): exactly that version,
//! - a comparator expression (`^1.2`, `~1.4`, `>=1.0, <2.0`).

use std::fmt;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::{ModuleError, ModuleResult};

/// Parse a version string, padding missing minor/patch components.
///
/// # Errors
///
/// Returns [`ModuleError::InvalidVersion`] if the string is not a version.
pub fn parse_version(input: &str) -> ModuleResult<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    // Pad "1" and "1.4" only when the core has no pre-release/build suffix.
    let core_parts = trimmed.split('.').count();
    let plain = trimmed.chars().all(|c| c.is_ascii_digit() || c == '.');
    let padded = match core_parts {
        1 if plain => format!("{trimmed}.0.0"),
        2 if plain => format!("{trimmed}.0"),
        _ => trimmed.to_owned(),
    };
    Version::parse(&padded).map_err(|e| ModuleError::InvalidVersion {
        value: input.to_owned(),
        message: e.to_string(),
    })
}

/// A dependency or host version constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionRange {
    /// Unconstrained.
    #[default]
    Any,
    /// Exactly this version.
    Exact(Version),
    /// A comparator expression.
    Req(VersionReq),
}

impl VersionRange {
    /// Parse a range expression.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidVersion`] if the expression is neither a
    /// version nor a valid comparator set.
    pub fn parse(input: &str) -> ModuleResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed.eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }
        if trimmed.starts_with(|c: char| c.is_ascii_digit())
            && let Ok(version) = parse_version(trimmed)
        {
            return Ok(Self::Exact(version));
        }
        VersionReq::parse(trimmed)
            .map(Self::Req)
            .map_err(|e| ModuleError::InvalidVersion {
                value: input.to_owned(),
                message: e.to_string(),
            })
    }

    /// Whether this range is unconstrained.
    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Whether `version` satisfies this range.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == version,
            Self::Req(req) => req.matches(version),
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Exact(v) => write!(f, "{v}"),
            Self::Req(r) => write!(f, "{r}"),
        }
    }
}

impl TryFrom<String> for VersionRange {
    type Error = ModuleError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<VersionRange> for String {
    fn from(r: VersionRange) -> Self {
        r.to_string()
    }
}
