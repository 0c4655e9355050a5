//! Attribute values.
//!
//! Values are compared structurally: ordered lists positionally, sets
//! without regard to order or duplicates, maps key by key, and numbers
//! numerically across integer and float representations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// YAML tag marking a sequence as an unordered set.
const SET_TAG: &str = "set";

/// A declared or observed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String, possibly containing interpolation tokens.
    String(String),
    /// Ordered sequence.
    List(Vec<Value>),
    /// Unordered collection.
    Set(Vec<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Compares two values structurally.
    #[must_use]
    #[allow(clippy::float_cmp, clippy::cast_precision_loss)]
    pub fn equivalent(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equivalent(y))
            }
            (Self::Set(a), Self::Set(b)) => {
                a.iter().all(|x| b.iter().any(|y| x.equivalent(y)))
                    && b.iter().all(|y| a.iter().any(|x| x.equivalent(y)))
            }
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.equivalent(other)))
            }
            _ => false,
        }
    }

    /// Returns the string content if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a parsed YAML value.
    ///
    /// Sequences tagged `!set` become [`Value::Set`]; all other sequences
    /// are ordered lists.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem for unsupported tags, non-scalar
    /// map keys, or integers outside the `i64` range.
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self, String> {
        use serde_yaml::Value as Yaml;

        match value {
            Yaml::Null => Ok(Self::Null),
            Yaml::Bool(b) => Ok(Self::Bool(*b)),
            Yaml::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if n.is_f64() {
                    n.as_f64()
                        .map(Self::Float)
                        .ok_or_else(|| format!("unsupported number: {n}"))
                } else {
                    Err(format!("integer out of range: {n}"))
                }
            }
            Yaml::String(s) => Ok(Self::String(s.clone())),
            Yaml::Sequence(items) => items
                .iter()
                .map(Self::from_yaml)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Yaml::Mapping(mapping) => {
                let mut map = BTreeMap::new();
                for (key, item) in mapping {
                    let key = match key {
                        Yaml::String(s) => s.clone(),
                        Yaml::Number(n) => n.to_string(),
                        Yaml::Bool(b) => b.to_string(),
                        other => return Err(format!("unsupported map key: {other:?}")),
                    };
                    map.insert(key, Self::from_yaml(item)?);
                }
                Ok(Self::Map(map))
            }
            Yaml::Tagged(tagged) => {
                if tagged.tag != SET_TAG {
                    return Err(format!("unsupported tag: {}", tagged.tag));
                }
                match Self::from_yaml(&tagged.value)? {
                    Self::List(items) => Ok(Self::Set(items)),
                    _ => Err(String::from("!set must be applied to a sequence")),
                }
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
            Self::List(items) => write_items(f, "[", items, "]"),
            Self::Set(items) => write_items(f, "{", items, "}"),
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "{close}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<Value> {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    #[test]
    fn test_lists_compare_positionally() {
        let a = Value::List(strings(&["x", "y"]));
        let b = Value::List(strings(&["y", "x"]));
        assert!(!a.equivalent(&b));
        assert!(a.equivalent(&a.clone()));
    }

    #[test]
    fn test_sets_ignore_order_and_duplicates() {
        let a = Value::Set(strings(&["x", "y"]));
        let b = Value::Set(strings(&["y", "x", "x"]));
        let c = Value::Set(strings(&["x", "z"]));
        assert!(a.equivalent(&b));
        assert!(!a.equivalent(&c));
    }

    #[test]
    fn test_numbers_compare_numerically() {
        assert!(Value::Int(2).equivalent(&Value::Float(2.0)));
        assert!(!Value::Int(2).equivalent(&Value::Float(2.5)));
        assert!(!Value::Int(2).equivalent(&Value::from("2")));
    }

    #[test]
    fn test_from_yaml_set_tag() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("!set [80, 443]").expect("valid yaml");
        let value = Value::from_yaml(&yaml).expect("convertible");
        assert_eq!(value, Value::Set(vec![Value::Int(80), Value::Int(443)]));
    }

    #[test]
    fn test_from_yaml_rejects_unknown_tag() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("!bag [1]").expect("valid yaml");
        assert!(Value::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_set() {
        let value = Value::Set(strings(&["a"]));
        let json = serde_json::to_string(&value).expect("serialize");
        let back: Value = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, value);
    }
}
