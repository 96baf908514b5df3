// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `vars`/`files` expander.
//!
//! An object may carry a `vars` section (name → value) and a `files`
//! section (name → path, or name → `{source, path}`). Descending through
//! an object tree, local sections are folded into the inherited context,
//! the context is self-expanded to a fixed point, and the remaining
//! members are substituted against it. Specialisations apply on the way
//! down and are dropped on the way back up.
//!
//! Substitution over a string replaces every `{name}` whose var is
//! string-valued; when the *entire* string is `{name}` and the var is not
//! a string, the raw value is substituted so types propagate. A value
//! that pivots from string to structure is re-processed, so `vars`/`files`
//! sections inside included files are honoured.
//!
//! Self-expansion is bounded: at most [`Expander::max_iters`] passes, and
//! any intermediate result serialising past [`Expander::size_cap`] is an
//! error rather than a truncation.

use crate::path::{PathError, extract_path_must};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while expanding an object tree.
#[derive(Debug, Error)]
pub enum ExpandError {
    /// The `vars` section at the given path was not an object.
    #[error("vars structure ('{key}') not an object: {path}")]
    VarsNotObject {
        /// Configured vars key.
        key: String,
        /// Object path of the offending section.
        path: String,
    },

    /// The `files` section at the given path was not an object.
    #[error("files structure ('{key}') not an object: {path}")]
    FilesNotObject {
        /// Configured files key.
        key: String,
        /// Object path of the offending section.
        path: String,
    },

    /// A `files` entry was neither a path string nor `{source, path}`.
    #[error("files entry at {path} is malformed")]
    MalformedFilesEntry {
        /// Object path of the offending entry.
        path: String,
    },

    /// Substituting an object key produced a non-string.
    #[error("failed substitution, key at {path} is no longer a string")]
    KeyNotString {
        /// Object path of the offending key.
        path: String,
    },

    /// Expansion grew past the configured ceiling.
    #[error("expansion exceeded the {cap}-byte ceiling at {path}")]
    SizeCap {
        /// Configured ceiling in bytes.
        cap: usize,
        /// Object path at which the ceiling was hit.
        path: String,
    },

    /// A `files` entry could not be read.
    #[error("failed to read file '{file}' at {path}")]
    FileRead {
        /// File named by the entry.
        file: String,
        /// Object path of the entry.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A `files` entry did not contain valid JSON.
    #[error("file '{file}' at {path} is not valid JSON")]
    FileJson {
        /// File named by the entry.
        file: String,
        /// Object path of the entry.
        path: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A jq-style path inside a `files` entry was malformed or missing.
    #[error(transparent)]
    Path(#[from] PathError),

    /// The top-level input was not valid JSON.
    #[error("input is not valid JSON")]
    InputJson(#[source] serde_json::Error),
}

/// Configuration for one expansion run.
#[derive(Debug, Clone)]
pub struct Expander {
    /// Key of the vars section; `None` disables section collection.
    pub vars_key: Option<String>,
    /// Key of the files section; `None` disables file inclusion.
    pub files_key: Option<String>,
    /// Write the original (unexpanded) sections back into the output.
    pub retain_keys: bool,
    /// Fixed-point iteration bound for self-expansion.
    pub max_iters: usize,
    /// Serialized-size ceiling; growth past it is an error.
    pub size_cap: usize,
}

impl Default for Expander {
    fn default() -> Self {
        Self {
            vars_key: Some("vars".to_string()),
            files_key: Some("files".to_string()),
            retain_keys: true,
            max_iters: 10,
            size_cap: 1 << 20,
        }
    }
}

impl Expander {
    /// An expander that only substitutes against a caller-supplied
    /// context, collecting no `vars`/`files` sections of its own.
    pub fn vars_only() -> Self {
        Self {
            vars_key: None,
            files_key: None,
            ..Self::default()
        }
    }

    /// Expand a JSON document given as text.
    pub fn expand_str(&self, text: &str) -> Result<Value, ExpandError> {
        let value: Value = serde_json::from_str(text).map_err(ExpandError::InputJson)?;
        self.expand_value(&value)
    }

    /// Expand a JSON value starting from an empty context.
    pub fn expand_value(&self, value: &Value) -> Result<Value, ExpandError> {
        self.process(&Map::new(), value, ".")
    }

    /// Expand a JSON value against a caller-supplied context.
    pub fn process_with(
        &self,
        ctx: &Map<String, Value>,
        value: &Value,
    ) -> Result<Value, ExpandError> {
        self.process(ctx, value, ".")
    }

    fn process(
        &self,
        ctx: &Map<String, Value>,
        obj: &Value,
        current: &str,
    ) -> Result<Value, ExpandError> {
        match obj {
            Value::Object(map) => self.process_object(ctx, map, current),
            Value::Array(items) => {
                let child = format!("{current}[]");
                let mut out = Vec::with_capacity(items.len());
                for v in items {
                    out.push(self.process(ctx, v, &child)?);
                }
                Ok(Value::Array(out))
            }
            _ => {
                let new = expand_once(ctx, obj);
                // A string that substituted into a structure needs the
                // full treatment, so nested sections get collected.
                if obj.is_string() && !new.is_string() {
                    return self.process(ctx, &new, current);
                }
                Ok(new)
            }
        }
    }

    fn process_object(
        &self,
        ctx: &Map<String, Value>,
        map: &Map<String, Value>,
        current: &str,
    ) -> Result<Value, ExpandError> {
        let mut map = map.clone();
        let mut ctx = ctx.clone();

        // Fold in a local vars section, then self-expand unconditionally
        // (the inherited context may not have reached its fixed point yet).
        let mut orig_vars = None;
        if let Some(key) = &self.vars_key {
            if let Some(local) = map.remove(key) {
                let Value::Object(local) = local else {
                    return Err(ExpandError::VarsNotObject {
                        key: key.clone(),
                        path: current.to_string(),
                    });
                };
                for (k, v) in &local {
                    ctx.insert(k.clone(), v.clone());
                }
                orig_vars = Some(local);
            }
        }
        ctx = self.self_expand(ctx, current)?;

        // Fold in a local files section: expand the section itself, load
        // each named file, then self-expand again.
        let mut orig_files = None;
        if let Some(key) = &self.files_key {
            if let Some(local) = map.remove(key) {
                let Value::Object(local) = local else {
                    return Err(ExpandError::FilesNotObject {
                        key: key.clone(),
                        path: current.to_string(),
                    });
                };
                let child = join_path(current, key);
                let expanded =
                    self.full_expand(&ctx, &Value::Object(local.clone()), &child)?;
                let Value::Object(expanded) = expanded else {
                    return Err(ExpandError::FilesNotObject {
                        key: key.clone(),
                        path: current.to_string(),
                    });
                };
                for (k, v) in &expanded {
                    let loaded = load_files_entry(v, &child)?;
                    ctx.insert(k.clone(), loaded);
                }
                ctx = self.self_expand(ctx, current)?;
                orig_files = Some(local);
            }
        }

        // Recurse into the remaining members, expanding keys too.
        let mut out = Map::new();
        for (k, v) in &map {
            let newk = match expand_string(&ctx, k) {
                Value::String(s) => s,
                _ => {
                    return Err(ExpandError::KeyNotString {
                        path: join_path(current, k),
                    });
                }
            };
            let child = join_path(current, &newk);
            let newv = self.process(&ctx, v, &child)?;
            out.insert(newk, newv);
        }
        if self.retain_keys {
            if let (Some(key), Some(vars)) = (&self.vars_key, orig_vars) {
                if !vars.is_empty() {
                    out.insert(key.clone(), Value::Object(vars));
                }
            }
            if let (Some(key), Some(files)) = (&self.files_key, orig_files) {
                if !files.is_empty() {
                    out.insert(key.clone(), Value::Object(files));
                }
            }
        }
        Ok(Value::Object(out))
    }

    /// Substitute repeatedly until nothing changes, bounded by
    /// `max_iters` and the size ceiling.
    fn full_expand(
        &self,
        ctx: &Map<String, Value>,
        obj: &Value,
        current: &str,
    ) -> Result<Value, ExpandError> {
        let mut cur = obj.clone();
        for _ in 0..self.max_iters {
            let new = expand_once(ctx, &cur);
            if approx_size(&new) > self.size_cap {
                return Err(ExpandError::SizeCap {
                    cap: self.size_cap,
                    path: current.to_string(),
                });
            }
            if new == cur {
                break;
            }
            cur = new;
        }
        Ok(cur)
    }

    fn self_expand(
        &self,
        ctx: Map<String, Value>,
        current: &str,
    ) -> Result<Map<String, Value>, ExpandError> {
        match self.full_expand(&ctx, &Value::Object(ctx.clone()), current)? {
            Value::Object(m) => Ok(m),
            _ => unreachable!("self-expansion of an object yields an object"),
        }
    }
}

/// One substitution pass over a value. Strings are substituted, object
/// keys are substituted (callers that care enforce that keys remain
/// strings), everything else recurses or passes through.
fn expand_once(ctx: &Map<String, Value>, obj: &Value) -> Value {
    match obj {
        Value::String(s) => expand_string(ctx, s),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let newk = match expand_string(ctx, k) {
                    Value::String(s) => s,
                    _ => k.clone(),
                };
                out.insert(newk, expand_once(ctx, v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| expand_once(ctx, v)).collect()),
        other => other.clone(),
    }
}

/// Substitute a single string against the context. String-valued vars
/// replace `{name}` substrings; a non-string var only applies when the
/// entire string is `{name}`, in which case the raw value is returned.
fn expand_string(ctx: &Map<String, Value>, s: &str) -> Value {
    let mut s = s.to_string();
    for (k, v) in ctx {
        let marker = format!("{{{k}}}");
        match v {
            Value::String(vs) => s = s.replace(&marker, vs),
            _ if s == marker => return v.clone(),
            _ => {}
        }
    }
    Value::String(s)
}

fn load_files_entry(entry: &Value, at: &str) -> Result<Value, ExpandError> {
    let read = |file: &str| -> Result<Value, ExpandError> {
        let text = fs::read_to_string(Path::new(file)).map_err(|source| ExpandError::FileRead {
            file: file.to_string(),
            path: at.to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ExpandError::FileJson {
            file: file.to_string(),
            path: at.to_string(),
            source,
        })
    };
    match entry {
        Value::String(file) => read(file),
        Value::Object(spec) => {
            let (Some(Value::String(source)), Some(Value::String(path))) =
                (spec.get("source"), spec.get("path"))
            else {
                return Err(ExpandError::MalformedFilesEntry {
                    path: at.to_string(),
                });
            };
            let loaded = read(source)?;
            Ok(extract_path_must(&loaded, path)?)
        }
        _ => Err(ExpandError::MalformedFilesEntry {
            path: at.to_string(),
        }),
    }
}

fn join_path(current: &str, node: &str) -> String {
    if current == "." {
        format!(".{node}")
    } else {
        format!("{current}.{node}")
    }
}

/// Cheap upper-bound estimate of serialized size for the ceiling check.
fn approx_size(v: &Value) -> usize {
    serde_json::to_string(v).map(|s| s.len()).unwrap_or(usize::MAX)
}
