// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scope construction for `call` actions.
//!
//! A scope rewrites the data a called subchain sees. Steps apply
//! left-to-right on a fresh empty object; only `import` reads from the
//! original data. The shorthand string form `".p"` means
//! `[{"import": ".", "source": ".p"}]`.

use crate::PolicyError;
use hcp_json::{delete_path, extract_path, overwrite_path, path::valid_path, union};
use serde_json::{Map, Value};

/// One construction step of a scope recipe.
#[derive(Debug, Clone)]
pub enum ScopeStep {
    /// Write a literal value at a path in the new object.
    Set {
        path: String,
        value: Value,
    },
    /// Delete a path from the new object.
    Delete {
        path: String,
    },
    /// Copy a path from the original data into the new object.
    Import {
        path: String,
        source: String,
    },
    /// Recursive-union of two paths in the new object (`source1` may be
    /// null, meaning take `source2` alone), stored at `path`.
    Union {
        path: String,
        source1: Option<String>,
        source2: String,
    },
}

fn err(filter: &str, problem: impl Into<String>) -> PolicyError {
    PolicyError::Filter {
        filter: filter.to_string(),
        problem: problem.into(),
    }
}

/// Parse a `scope` attribute (string shorthand or step array).
pub(crate) fn parse_scope(spec: &Value, filter: &str) -> Result<Vec<ScopeStep>, PolicyError> {
    let steps = match spec {
        Value::String(source) => {
            valid_path(source).map_err(|e| err(filter, format!("invalid scope path: {e}")))?;
            return Ok(vec![ScopeStep::Import {
                path: ".".to_string(),
                source: source.clone(),
            }]);
        }
        Value::Array(steps) => steps,
        _ => return Err(err(filter, "scope: bad type")),
    };

    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        let Value::Object(map) = step else {
            return Err(err(filter, "scope: step isn't an object"));
        };
        let mut methods = ["set", "delete", "import", "union"]
            .into_iter()
            .filter(|m| map.contains_key(*m));
        let Some(method) = methods.next() else {
            return Err(err(filter, "scope: no method in step"));
        };
        if methods.next().is_some() {
            return Err(err(filter, "scope: too many methods in step"));
        }

        let path = path_param(map, method, filter)?;
        let step = match method {
            "set" => {
                if map.len() != 2 || !map.contains_key("value") {
                    return Err(err(filter, "'set' must have (only) 'value'"));
                }
                ScopeStep::Set {
                    path,
                    value: map["value"].clone(),
                }
            }
            "delete" => {
                if map.len() != 1 {
                    return Err(err(filter, "'delete' expects no attributes"));
                }
                ScopeStep::Delete { path }
            }
            "import" => {
                if map.len() != 2 {
                    return Err(err(filter, "'import' must have (only) 'source'"));
                }
                let Some(Value::String(source)) = map.get("source") else {
                    return Err(err(filter, "'import' must have (only) 'source'"));
                };
                valid_path(source)
                    .map_err(|e| err(filter, format!("invalid 'import' source: {e}")))?;
                ScopeStep::Import {
                    path,
                    source: source.clone(),
                }
            }
            "union" => {
                if map.len() != 3 || !map.contains_key("source1") || !map.contains_key("source2")
                {
                    return Err(err(filter, "'union' requires (only) 'source1' and 'source2'"));
                }
                let source1 = match &map["source1"] {
                    Value::Null => None,
                    Value::String(s) => {
                        valid_path(s)
                            .map_err(|e| err(filter, format!("invalid 'union' source: {e}")))?;
                        Some(s.clone())
                    }
                    _ => return Err(err(filter, "invalid 'union' source(s)")),
                };
                let Some(Value::String(source2)) = map.get("source2") else {
                    return Err(err(filter, "invalid 'union' source(s)"));
                };
                valid_path(source2)
                    .map_err(|e| err(filter, format!("invalid 'union' source: {e}")))?;
                ScopeStep::Union {
                    path,
                    source1,
                    source2: source2.clone(),
                }
            }
            _ => unreachable!("method comes from the fixed list"),
        };
        out.push(step);
    }
    Ok(out)
}

fn path_param(map: &Map<String, Value>, method: &str, filter: &str) -> Result<String, PolicyError> {
    let Some(Value::String(path)) = map.get(method) else {
        return Err(err(filter, format!("invalid '{method}' scope")));
    };
    valid_path(path).map_err(|e| err(filter, format!("invalid '{method}' path: {e}")))?;
    Ok(path.clone())
}

/// Run a parsed scope recipe against the original data, producing the
/// view the called subchain will see. Failures (a missing import or
/// union source) are reported as strings so the caller can turn them
/// into a reject verdict — evaluation never errors out.
pub(crate) fn run_scope(data: &Value, steps: &[ScopeStep]) -> Result<Value, String> {
    let mut new = Value::Object(Map::new());
    for step in steps {
        match step {
            ScopeStep::Set { path, value } => {
                overwrite_path(&mut new, path, value.clone()).map_err(|e| e.to_string())?;
            }
            ScopeStep::Delete { path } => {
                delete_path(&mut new, path).map_err(|e| e.to_string())?;
            }
            ScopeStep::Import { path, source } => {
                let value = extract_path(data, source)
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("import: missing '{source}'"))?
                    .clone();
                overwrite_path(&mut new, path, value).map_err(|e| e.to_string())?;
            }
            ScopeStep::Union {
                path,
                source1,
                source2,
            } => {
                let v2 = extract_path(&new, source2)
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("union: missing '{source2}'"))?
                    .clone();
                let merged = match source1 {
                    Some(s1) => {
                        let v1 = extract_path(&new, s1)
                            .map_err(|e| e.to_string())?
                            .ok_or_else(|| format!("union: missing '{s1}'"))?;
                        union(v1, &v2)
                    }
                    None => v2,
                };
                overwrite_path(&mut new, path, merged).map_err(|e| e.to_string())?;
            }
        }
    }
    Ok(new)
}
