// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recursive (non-shallow) union of two JSON values.
//!
//! When both sides are objects the union recurses per key with the right
//! side winning at the leaves; when both are arrays they are concatenated
//! and de-duplicated preserving order; any other combination takes the
//! right side outright. Each structural union can be disabled via
//! [`UnionOpts`], forcing the right side to win.

use serde_json::Value;

/// Flags controlling which structural unions apply.
#[derive(Debug, Clone, Copy)]
pub struct UnionOpts {
    /// When set, object pairs are not merged; the right object wins.
    pub no_dict_union: bool,
    /// When set, array pairs are not concatenated; the right array wins.
    pub no_list_union: bool,
    /// When set (the default), concatenated arrays are de-duplicated.
    pub list_dedup: bool,
}

impl Default for UnionOpts {
    fn default() -> Self {
        Self {
            no_dict_union: false,
            no_list_union: false,
            list_dedup: true,
        }
    }
}

/// Union with default options.
pub fn union(a: &Value, b: &Value) -> Value {
    union_with(a, b, UnionOpts::default())
}

/// Union with explicit options.
pub fn union_with(a: &Value, b: &Value, opts: UnionOpts) -> Value {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) if !opts.no_dict_union => {
            let mut out = ma.clone();
            for (k, bv) in mb {
                let merged = match ma.get(k) {
                    Some(av) => union_with(av, bv, opts),
                    None => bv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(la), Value::Array(lb)) if !opts.no_list_union => {
            let mut out: Vec<Value> = la.iter().chain(lb.iter()).cloned().collect();
            if opts.list_dedup {
                let mut deduped: Vec<Value> = Vec::with_capacity(out.len());
                for v in out {
                    if !deduped.contains(&v) {
                        deduped.push(v);
                    }
                }
                out = deduped;
            }
            Value::Array(out)
        }
        _ => b.clone(),
    }
}
