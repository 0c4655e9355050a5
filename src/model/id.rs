//! Resource identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier of a resource: its type plus its name.
///
/// The textual form is `type.name`, e.g. `package.nginx`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource type (e.g. `package`, `file`).
    pub resource_type: String,
    /// Resource name, unique within its type.
    pub name: String,
}

impl ResourceId {
    /// Creates a new identifier.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

/// Returns true if `segment` is a valid type or name segment.
///
/// Segments start with a lowercase letter and continue with lowercase
/// letters, digits, underscores or hyphens.
#[must_use]
pub fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource_type, name) = s
            .split_once('.')
            .ok_or_else(|| format!("resource id '{s}' must have the form type.name"))?;

        if !is_valid_segment(resource_type) || !is_valid_segment(name) {
            return Err(format!(
                "resource id '{s}' is invalid: segments must be lowercase alphanumeric with '_' or '-'"
            ));
        }

        Ok(Self::new(resource_type, name))
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: ResourceId = "package.nginx".parse().expect("valid id");
        assert_eq!(id.resource_type, "package");
        assert_eq!(id.name, "nginx");
        assert_eq!(id.to_string(), "package.nginx");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("nginx".parse::<ResourceId>().is_err());
        assert!("Package.nginx".parse::<ResourceId>().is_err());
        assert!("package.".parse::<ResourceId>().is_err());
        assert!("package.ng.inx".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_valid_segment() {
        assert!(is_valid_segment("web-01"));
        assert!(is_valid_segment("tls_cert"));
        assert!(!is_valid_segment(""));
        assert!(!is_valid_segment("1web"));
        assert!(!is_valid_segment("web.app"));
    }

    #[test]
    fn test_serde_as_string() {
        let id = ResourceId::new("file", "motd");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"file.motd\"");

        let back: ResourceId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}
