// SPDX-License-Identifier: MIT OR Apache-2.0
//! Filter conditions.
//!
//! Each condition is a single-key object selecting a test over a
//! jq-style path, with a `not-` spelling for the inverse. Negation wraps
//! the whole test, so `not-equal` on a missing path is true.

use crate::PolicyError;
use hcp_json::{extract_path, path::valid_path};
use serde_json::{Map, Value};

/// A parsed condition: a test over a path, possibly negated.
#[derive(Debug, Clone)]
pub struct Cond {
    pub(crate) negated: bool,
    pub(crate) path: String,
    pub(crate) test: CondTest,
}

/// The test applied to the value found at the condition's path.
#[derive(Debug, Clone)]
pub enum CondTest {
    /// The path is present.
    Exist,
    /// The path's value deep-equals the parameter.
    Equal(Value),
    /// The path's value is an array, set-wise contained in the parameter.
    Subset(Vec<Value>),
    /// The path's value is one of the parameter's elements.
    ElementOf(Vec<Value>),
    /// The path's value is an array containing the parameter.
    Contains(Value),
    /// The path's value has the given runtime type.
    IsInstance(TypeTag),
}

/// JSON runtime types for `isinstance` conditions. Legacy spellings from
/// the wire format (`str`, `int`, `dict`, `list`, `bool`, `None`) are
/// accepted alongside the JSON ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Null,
    String,
    Number,
    Object,
    Array,
    Boolean,
}

impl TypeTag {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "null" | "None" => Some(Self::Null),
            "string" | "str" => Some(Self::String),
            "number" | "int" => Some(Self::Number),
            "object" | "dict" => Some(Self::Object),
            "array" | "list" => Some(Self::Array),
            "boolean" | "bool" => Some(Self::Boolean),
            _ => None,
        }
    }

    fn matches(self, v: &Value) -> bool {
        match self {
            Self::Null => v.is_null(),
            Self::String => v.is_string(),
            Self::Number => v.is_number(),
            Self::Object => v.is_object(),
            Self::Array => v.is_array(),
            Self::Boolean => v.is_boolean(),
        }
    }
}

const COND_KEYS: &[&str] = &[
    "exist",
    "equal",
    "subset",
    "elementof",
    "contains",
    "isinstance",
];

fn err(filter: &str, problem: impl Into<String>) -> PolicyError {
    PolicyError::Filter {
        filter: filter.to_string(),
        problem: problem.into(),
    }
}

impl Cond {
    /// Parse one condition object belonging to the named filter.
    pub(crate) fn parse(obj: &Value, filter: &str) -> Result<Self, PolicyError> {
        let Value::Object(map) = obj else {
            return Err(err(filter, "if: entry isn't an object"));
        };

        let mut found: Option<(&str, bool)> = None;
        for key in COND_KEYS.iter().copied() {
            for (candidate, negated) in [(key.to_string(), false), (format!("not-{key}"), true)] {
                if map.contains_key(&candidate) {
                    if found.is_some() {
                        return Err(err(filter, "if: too many methods"));
                    }
                    found = Some((key, negated));
                }
            }
        }
        let Some((kind, negated)) = found else {
            return Err(err(filter, "if: no method"));
        };
        let key = if negated {
            format!("not-{kind}")
        } else {
            kind.to_string()
        };

        let Some(Value::String(path)) = map.get(&key) else {
            return Err(err(filter, format!("invalid '{key}' condition")));
        };
        valid_path(path).map_err(|e| err(filter, format!("invalid '{key}' path: {e}")))?;

        let test = match kind {
            "exist" => {
                expect_len(map, 1, filter, &key)?;
                CondTest::Exist
            }
            "equal" => {
                expect_len(map, 2, filter, &key)?;
                CondTest::Equal(param(map, "value", filter, &key)?.clone())
            }
            "subset" => {
                expect_len(map, 2, filter, &key)?;
                CondTest::Subset(param_array(map, filter, &key)?)
            }
            "elementof" => {
                expect_len(map, 2, filter, &key)?;
                CondTest::ElementOf(param_array(map, filter, &key)?)
            }
            "contains" => {
                expect_len(map, 2, filter, &key)?;
                CondTest::Contains(param(map, "value", filter, &key)?.clone())
            }
            "isinstance" => {
                expect_len(map, 2, filter, &key)?;
                let Some(Value::String(name)) = map.get("type") else {
                    return Err(err(filter, format!("invalid '{key}' condition")));
                };
                let tag = TypeTag::from_name(name)
                    .ok_or_else(|| err(filter, format!("unknown 'type' for '{key}'")))?;
                CondTest::IsInstance(tag)
            }
            _ => unreachable!("kind comes from COND_KEYS"),
        };

        Ok(Self {
            negated,
            path: path.clone(),
            test,
        })
    }

    /// Evaluate against the data being filtered.
    pub(crate) fn eval(&self, data: &Value) -> bool {
        let found = extract_path(data, &self.path).ok().flatten();
        let raw = match (&self.test, found) {
            (_, None) => false,
            (CondTest::Exist, Some(_)) => true,
            (CondTest::Equal(want), Some(v)) => v == want,
            (CondTest::Subset(want), Some(Value::Array(items))) => {
                items.iter().all(|i| want.contains(i))
            }
            (CondTest::Subset(_), Some(_)) => false,
            (CondTest::ElementOf(want), Some(v)) => want.contains(v),
            (CondTest::Contains(want), Some(Value::Array(items))) => items.contains(want),
            (CondTest::Contains(_), Some(_)) => false,
            (CondTest::IsInstance(tag), Some(v)) => tag.matches(v),
        };
        raw != self.negated
    }
}

fn expect_len(
    map: &Map<String, Value>,
    want: usize,
    filter: &str,
    key: &str,
) -> Result<(), PolicyError> {
    if map.len() == want {
        Ok(())
    } else {
        Err(err(filter, format!("invalid '{key}' condition")))
    }
}

fn param<'a>(
    map: &'a Map<String, Value>,
    name: &str,
    filter: &str,
    key: &str,
) -> Result<&'a Value, PolicyError> {
    map.get(name)
        .ok_or_else(|| err(filter, format!("invalid '{key}' condition")))
}

fn param_array(
    map: &Map<String, Value>,
    filter: &str,
    key: &str,
) -> Result<Vec<Value>, PolicyError> {
    match param(map, "value", filter, key)? {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(err(filter, format!("value for '{key}' must be an array"))),
    }
}
