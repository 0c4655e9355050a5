//! Interpolation references between resources.
//!
//! A string attribute may embed `${type.name.attribute}` tokens. Each
//! well-formed token is a reference to another resource's applied value
//! and implies that the referenced resource must be applied first.
//! Malformed `${...}` text is left untouched and creates no dependency.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::id::ResourceId;
use super::value::Value;

/// Matches `${type.name.attribute}` with each segment in identifier syntax.
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-z][a-z0-9_-]*)\.([a-z][a-z0-9_-]*)\.([a-z][a-z0-9_-]*)\}")
        .unwrap_or_else(|_| unreachable!("reference pattern is a valid regex"))
});

/// A reference from an attribute value to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Referenced resource.
    pub target: ResourceId,
    /// Attribute or output name on the referenced resource.
    pub attribute: String,
}

/// Collects every reference found in a value, recursing into collections.
#[must_use]
pub fn scan_references(value: &Value) -> Vec<Reference> {
    let mut found = Vec::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<Reference>) {
    match value {
        Value::String(s) => {
            for caps in REFERENCE_PATTERN.captures_iter(s) {
                found.push(Reference {
                    target: ResourceId::new(&caps[1], &caps[2]),
                    attribute: caps[3].to_string(),
                });
            }
        }
        Value::List(items) | Value::Set(items) => {
            for item in items {
                collect(item, found);
            }
        }
        Value::Map(map) => {
            for item in map.values() {
                collect(item, found);
            }
        }
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => {}
    }
}

/// Replaces every reference in `value` using `lookup`.
///
/// A string consisting of exactly one token is replaced by the referenced
/// value itself, keeping its type. Tokens embedded in longer strings are
/// replaced by the referenced value's display text.
///
/// # Errors
///
/// Returns the text of the first token that `lookup` cannot resolve.
pub fn resolve_value<F>(value: &Value, lookup: &F) -> Result<Value, String>
where
    F: Fn(&Reference) -> Option<Value>,
{
    match value {
        Value::String(s) => resolve_string(s, lookup),
        Value::List(items) => items
            .iter()
            .map(|item| resolve_value(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Value::Set(items) => items
            .iter()
            .map(|item| resolve_value(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Set),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, lookup).map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Value::Map),
        other => Ok(other.clone()),
    }
}

fn resolve_string<F>(s: &str, lookup: &F) -> Result<Value, String>
where
    F: Fn(&Reference) -> Option<Value>,
{
    let mut output = String::with_capacity(s.len());
    let mut last = 0;

    for caps in REFERENCE_PATTERN.captures_iter(s) {
        let Some(token) = caps.get(0) else {
            continue;
        };
        let reference = Reference {
            target: ResourceId::new(&caps[1], &caps[2]),
            attribute: caps[3].to_string(),
        };
        let resolved = lookup(&reference).ok_or_else(|| token.as_str().to_string())?;

        // Whole-string token keeps the referenced value's type
        if token.start() == 0 && token.end() == s.len() {
            return Ok(resolved);
        }

        output.push_str(&s[last..token.start()]);
        output.push_str(&resolved.to_string());
        last = token.end();
    }

    output.push_str(&s[last..]);
    Ok(Value::String(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(reference: &Reference) -> Option<Value> {
        match (reference.target.to_string().as_str(), reference.attribute.as_str()) {
            ("package.nginx", "prefix") => Some(Value::from("/opt/nginx")),
            ("service.db", "port") => Some(Value::Int(5432)),
            _ => None,
        }
    }

    #[test]
    fn test_scan_nested_references() {
        let value = Value::Map(BTreeMap::from([
            (String::from("path"), Value::from("${package.nginx.prefix}/conf")),
            (
                String::from("peers"),
                Value::Set(vec![Value::from("${service.db.port}")]),
            ),
        ]));

        let refs = scan_references(&value);
        let targets: Vec<String> = refs.iter().map(|r| r.target.to_string()).collect();
        assert_eq!(targets, vec!["package.nginx", "service.db"]);
    }

    #[test]
    fn test_malformed_tokens_are_literal() {
        assert!(scan_references(&Value::from("${nginx}")).is_empty());
        assert!(scan_references(&Value::from("${Package.nginx.prefix}")).is_empty());
        assert!(scan_references(&Value::from("$package.nginx.prefix")).is_empty());
    }

    #[test]
    fn test_whole_token_keeps_type() {
        let resolved = resolve_value(&Value::from("${service.db.port}"), &lookup);
        assert_eq!(resolved, Ok(Value::Int(5432)));
    }

    #[test]
    fn test_embedded_token_is_textual() {
        let resolved = resolve_value(&Value::from("${package.nginx.prefix}/conf"), &lookup);
        assert_eq!(resolved, Ok(Value::from("/opt/nginx/conf")));
    }

    #[test]
    fn test_unresolved_token_is_reported() {
        let resolved = resolve_value(&Value::from("x ${file.missing.path}"), &lookup);
        assert_eq!(resolved, Err(String::from("${file.missing.path}")));
    }
}
