//! Module coordinates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModuleError, ModuleResult};

/// Unique identity of a module within a load session: `namespace:name`.
///
/// Both segments must be non-empty and contain only ASCII alphanumerics,
/// `-`, `_` and `.`. The string form doubles as the key of the persisted
/// registry file and as the import namespace other modules link against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct Coordinate {
    namespace: String,
    name: String,
}

/// Deserialize with validation so crafted registry files cannot smuggle
/// path separators into archive lookups.
impl<'de> Deserialize<'de> for Coordinate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Coordinate {
    /// Create a coordinate from its two segments.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidCoordinate`] if either segment is empty
    /// or contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ModuleResult<Self> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment("namespace", &namespace)?;
        validate_segment("name", &name)?;
        Ok(Self { namespace, name })
    }

    /// The namespace segment.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The name segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `s` parses as a coordinate.
    #[must_use]
    pub fn is_coordinate(s: &str) -> bool {
        s.parse::<Self>().is_ok()
    }
}

fn validate_segment(kind: &str, segment: &str) -> ModuleResult<()> {
    if segment.is_empty() {
        return Err(ModuleError::InvalidCoordinate(format!(
            "{kind} must not be empty"
        )));
    }
    if segment == "." || segment == ".." {
        return Err(ModuleError::InvalidCoordinate(format!(
            "{kind} must not be a relative path component, got: {segment}"
        )));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ModuleError::InvalidCoordinate(format!(
            "{kind} may only contain ASCII alphanumerics, '-', '_' and '.', got: {segment}"
        )));
    }
    Ok(())
}

impl FromStr for Coordinate {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((namespace, name)) = s.split_once(':') else {
            return Err(ModuleError::InvalidCoordinate(format!(
                "expected 'namespace:name', got: {s}"
            )));
        };
        Self::new(namespace, name)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl From<Coordinate> for String {
    fn from(c: Coordinate) -> Self {
        c.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let c: Coordinate = "acme:zigbee-bridge".parse().unwrap();
        assert_eq!(c.namespace(), "acme");
        assert_eq!(c.name(), "zigbee-bridge");
        assert_eq!(c.to_string(), "acme:zigbee-bridge");
    }

    #[test]
    fn test_dotted_namespace() {
        let c = Coordinate::new("com.acme", "serial_port").unwrap();
        assert_eq!(c.to_string(), "com.acme:serial_port");
    }

    #[test]
    fn test_invalid_coordinates() {
        for bad in [
            "",
            "acme",
            ":zigbee",
            "acme:",
            "acme:zig/bee",
            "acme:..",
            "ac me:zigbee",
            "acme:zig:bee",
        ] {
            assert!(
                bad.parse::<Coordinate>().is_err(),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_serde_as_string() {
        let c = Coordinate::new("acme", "zigbee").unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"acme:zigbee\"");

        let back: Coordinate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);

        let bad: Result<Coordinate, _> = serde_json::from_str("\"../etc:passwd\"");
        assert!(bad.is_err());
    }
}
