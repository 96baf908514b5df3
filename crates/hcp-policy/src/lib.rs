// SPDX-License-Identifier: MIT OR Apache-2.0
//! hcp-policy
#![deny(unsafe_code)]
//!
//! A filtering scheme for JSON objects that works a little like
//! iptables: named filter rules, chains thereof, and `jump`/`call`/
//! `return` control flow with scoped data views. A policy document is
//! parsed once into a [`Policy`]; evaluation against request data is
//! total — a well-formed policy can only produce accept or reject.

pub mod cond;
pub mod scope;

use cond::Cond;
use hcp_json::Expander;
use scope::{ScopeStep, parse_scope, run_scope};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Key under which request data carries its expansion variables.
pub const ENV_KEY: &str = "__env";

/// Errors raised while parsing a policy document.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The document is not valid JSON.
    #[error("policy is not valid JSON")]
    Json(#[source] serde_json::Error),

    /// The top level is not an object.
    #[error("policy must be an object")]
    NotObject,

    /// `start` is present but not a string.
    #[error("'start' must be a string")]
    StartNotString,

    /// `default` is present but not `"accept"`/`"reject"`.
    #[error("'default' must be \"accept\" or \"reject\"")]
    BadDefault,

    /// `filters` is missing or not an object.
    #[error("'filters' missing or not an object")]
    BadFilters,

    /// `start` names a filter that does not exist.
    #[error("'start' ({0}) doesn't match a valid filter")]
    BadStart(String),

    /// A problem in a specific filter entry.
    #[error("{filter}: {problem}")]
    Filter {
        /// Name of the offending filter.
        filter: String,
        /// What was wrong with it.
        problem: String,
    },

    /// The data's `__env` member was not an object.
    #[error("'{ENV_KEY}' must be an object")]
    EnvNotObject,

    /// Env expansion of the policy or data failed.
    #[error(transparent)]
    Expand(#[from] hcp_json::ExpandError),
}

fn ferr(filter: &str, problem: impl Into<String>) -> PolicyError {
    PolicyError::Filter {
        filter: filter.to_string(),
        problem: problem.into(),
    }
}

/// Terminal policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
}

/// The outcome of evaluating a policy against one request.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    /// Accept or reject.
    pub action: Decision,
    /// The filter that produced the decision, when one did.
    pub last_filter: Option<String>,
    /// Human-readable account of why.
    pub reason: String,
}

impl Verdict {
    /// `true` when the request was accepted.
    pub fn accepted(&self) -> bool {
        self.action == Decision::Accept
    }
}

/// Primary action of a filter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Accept,
    Reject,
    Jump,
    Call,
    Return,
    Next,
}

impl Verb {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "accept" => Some(Self::Accept),
            "reject" => Some(Self::Reject),
            "jump" => Some(Self::Jump),
            "call" => Some(Self::Call),
            "return" => Some(Self::Return),
            "next" => Some(Self::Next),
            _ => None,
        }
    }
}

/// Parameter-less follow-up actions (`otherwise`, `on-return`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Accept,
    Reject,
    Return,
    Next,
}

impl Flow {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "accept" => Some(Self::Accept),
            "reject" => Some(Self::Reject),
            "return" => Some(Self::Return),
            "next" => Some(Self::Next),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Filter {
    name: String,
    action: Verb,
    jump: Option<String>,
    call: Option<String>,
    scope: Option<Vec<ScopeStep>>,
    on_return: Option<Flow>,
    otherwise: Option<Flow>,
    next: Option<String>,
    conds: Vec<Cond>,
}

/// A parsed, consistency-checked policy document.
#[derive(Debug, Clone)]
pub struct Policy {
    start: Option<String>,
    default: Decision,
    filters: HashMap<String, Filter>,
}

impl Policy {
    /// Parse a policy from JSON text.
    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        let mut doc: Value = serde_json::from_str(text).map_err(PolicyError::Json)?;
        strip_comments(&mut doc);
        Self::from_value(doc)
    }

    /// Parse a policy from an already-loaded JSON value. Comment members
    /// (`"_"`) are expected to have been stripped by the caller.
    pub fn from_value(doc: Value) -> Result<Self, PolicyError> {
        let Value::Object(mut doc) = doc else {
            return Err(PolicyError::NotObject);
        };

        let start = match doc.remove("start") {
            None => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(PolicyError::StartNotString),
        };
        let default = match doc.remove("default") {
            None => Decision::Reject,
            Some(Value::String(s)) if s == "accept" => Decision::Accept,
            Some(Value::String(s)) if s == "reject" => Decision::Reject,
            Some(_) => return Err(PolicyError::BadDefault),
        };
        let Some(Value::Object(raw_filters)) = doc.remove("filters") else {
            return Err(PolicyError::BadFilters);
        };

        let mut filters = HashMap::new();
        let mut first = None;
        for (key, value) in &raw_filters {
            let head = parse_filter(key, value, &mut filters)?;
            if first.is_none() {
                first = Some(head);
            }
        }
        let start = start.or(first);

        let policy = Self {
            start,
            default,
            filters,
        };
        policy.check()?;
        Ok(policy)
    }

    /// Cross-reference checks that individual filter parsing can't do.
    fn check(&self) -> Result<(), PolicyError> {
        if let Some(start) = &self.start {
            if !self.filters.contains_key(start) {
                return Err(PolicyError::BadStart(start.clone()));
            }
        }
        for (name, f) in &self.filters {
            for target in [f.jump.as_ref(), f.call.as_ref(), f.next.as_ref()]
                .into_iter()
                .flatten()
            {
                if !self.filters.contains_key(target) {
                    return Err(ferr(name, format!("unknown target '{target}'")));
                }
            }
        }
        Ok(())
    }

    /// Evaluate the policy against request data. Comment members in the
    /// data are ignored.
    pub fn run(&self, data: &Value) -> Verdict {
        let mut data = data.clone();
        strip_comments(&mut data);
        let Some(start) = &self.start else {
            return self.default_verdict();
        };
        self.run_sub(start, &data).unwrap_or_else(|| self.default_verdict())
    }

    fn default_verdict(&self) -> Verdict {
        Verdict {
            action: self.default,
            last_filter: None,
            reason: "Default filter action".to_string(),
        }
    }

    /// Walk filters from `cursor`. `None` means control returned without
    /// a decision (the caller continues).
    fn run_sub(&self, cursor: &str, data: &Value) -> Option<Verdict> {
        let mut cursor = cursor.to_string();
        loop {
            let Some(f) = self.filters.get(&cursor) else {
                // Unreachable on a checked policy; reject rather than loop.
                return Some(Verdict {
                    action: Decision::Reject,
                    last_filter: Some(cursor),
                    reason: "bug in policy.json - unknown filter".to_string(),
                });
            };

            let matched = f.conds.iter().all(|c| c.eval(data));
            let mut act = if matched {
                f.action
            } else {
                match f.otherwise {
                    Some(flow) => flow_verb(flow),
                    None => Verb::Next,
                }
            };

            if act == Verb::Call {
                let target = f.call.as_deref().expect("checked at parse time");
                let verdict = match &f.scope {
                    Some(steps) => match run_scope(data, steps) {
                        Ok(scoped) => self.run_sub(target, &scoped),
                        Err(e) => {
                            return Some(Verdict {
                                action: Decision::Reject,
                                last_filter: Some(f.name.clone()),
                                reason: format!("scope construction failed: {e}"),
                            });
                        }
                    },
                    None => self.run_sub(target, data),
                };
                if verdict.is_some() {
                    return verdict;
                }
                act = match f.on_return {
                    Some(flow) => flow_verb(flow),
                    None => Verb::Next,
                };
            }

            match act {
                Verb::Return => return None,
                Verb::Jump => {
                    cursor = f.jump.clone().expect("checked at parse time");
                }
                Verb::Next => match &f.next {
                    Some(next) => cursor = next.clone(),
                    None => {
                        return Some(Verdict {
                            action: Decision::Reject,
                            last_filter: Some(f.name.clone()),
                            reason: "bug in policy.json - no 'next'".to_string(),
                        });
                    }
                },
                Verb::Accept | Verb::Reject => {
                    return Some(Verdict {
                        action: if act == Verb::Accept {
                            Decision::Accept
                        } else {
                            Decision::Reject
                        },
                        last_filter: Some(f.name.clone()),
                        reason: "Filter match".to_string(),
                    });
                }
                Verb::Call => unreachable!("call handled above"),
            }
        }
    }
}

fn flow_verb(flow: Flow) -> Verb {
    match flow {
        Flow::Accept => Verb::Accept,
        Flow::Reject => Verb::Reject,
        Flow::Return => Verb::Return,
        Flow::Next => Verb::Next,
    }
}

/// Evaluate policy text against data carrying a `__env` vars object.
///
/// The vars are peeled off the data, both the data and the policy
/// document are expanded against them, and the policy is then parsed and
/// run. `keep_vars` re-attaches `__env` to the expanded data before
/// evaluation.
pub fn run_with_env(
    policy_text: &str,
    data: &Value,
    keep_vars: bool,
) -> Result<Verdict, PolicyError> {
    let mut data = data.clone();
    strip_comments(&mut data);

    let vars = match data.as_object_mut().and_then(|m| m.remove(ENV_KEY)) {
        None => Map::new(),
        Some(Value::Object(vars)) => vars,
        Some(_) => return Err(PolicyError::EnvNotObject),
    };

    let expander = Expander::default();
    let mut data = expander.process_with(&vars, &data)?;
    if keep_vars {
        if let Some(m) = data.as_object_mut() {
            m.insert(ENV_KEY.to_string(), Value::Object(vars.clone()));
        }
    }

    let mut doc: Value = serde_json::from_str(policy_text).map_err(PolicyError::Json)?;
    strip_comments(&mut doc);
    let doc = expander.process_with(&vars, &doc)?;
    let policy = Policy::from_value(doc)?;
    Ok(policy.run(&data))
}

/// Remove every object member named `_` (comments) from a value tree.
pub fn strip_comments(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("_");
            for (_, v) in map.iter_mut() {
                strip_comments(v);
            }
        }
        Value::Array(items) => {
            for v in items {
                strip_comments(v);
            }
        }
        _ => {}
    }
}

/// Parse one `filters` entry. An object becomes a single filter; an
/// array becomes a chain of filters named `<key>_<i>` (unless an element
/// carries its own `name`) with `next` links synthesised, and the chain
/// key aliased to the head. Returns the name of the entry's head filter.
fn parse_filter(
    key: &str,
    value: &Value,
    out: &mut HashMap<String, Filter>,
) -> Result<String, PolicyError> {
    if let Value::Array(elements) = value {
        let mut head: Option<String> = None;
        let mut last: Option<String> = None;
        for (i, element) in elements.iter().enumerate() {
            let name = parse_filter(&format!("{key}_{i}"), element, out)?;
            if let Some(prev) = &last {
                let prev = out.get_mut(prev).expect("just inserted");
                if prev.next.is_none() {
                    prev.next = Some(name.clone());
                }
            }
            if head.is_none() {
                head = Some(name.clone());
            }
            last = Some(name);
        }
        let head = head.ok_or_else(|| ferr(key, "chain is empty"))?;
        // Alias the chain's own key to its (now fully linked) head.
        if head != key {
            let head_filter = out.get(&head).expect("just inserted").clone();
            out.insert(key.to_string(), head_filter);
        }
        return Ok(head);
    }

    let Value::Object(map) = value else {
        return Err(ferr(key, "filter entry must be an object or array"));
    };

    let name = match map.get("name") {
        None => key.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ferr(key, "'name' isn't a string")),
    };

    let Some(Value::String(action_name)) = map.get("action") else {
        return Err(ferr(&name, "action: missing or not a string"));
    };
    let action = Verb::from_name(action_name)
        .ok_or_else(|| ferr(&name, format!("action: '{action_name}' unknown")))?;

    let mut filter = Filter {
        name: name.clone(),
        action,
        jump: None,
        call: None,
        scope: None,
        on_return: None,
        otherwise: None,
        next: None,
        conds: Vec::new(),
    };

    if matches!(action, Verb::Jump | Verb::Call) {
        let Some(Value::String(target)) = map.get(action_name.as_str()) else {
            return Err(ferr(&name, format!("{action_name}: missing")));
        };
        match action {
            Verb::Jump => filter.jump = Some(target.clone()),
            Verb::Call => filter.call = Some(target.clone()),
            _ => unreachable!(),
        }
    }
    if action == Verb::Call {
        if let Some(v) = map.get("on-return") {
            let Value::String(s) = v else {
                return Err(ferr(&name, "on-return: not a string"));
            };
            filter.on_return = Some(
                Flow::from_name(s).ok_or_else(|| ferr(&name, format!("on-return: unknown '{s}'")))?,
            );
        }
        if let Some(spec) = map.get("scope") {
            filter.scope = Some(parse_scope(spec, &name)?);
        }
    }

    if let Some(v) = map.get("next") {
        let Value::String(s) = v else {
            return Err(ferr(&name, "next: not a string"));
        };
        filter.next = Some(s.clone());
    }

    if let Some(vif) = map.get("if") {
        let list = match vif {
            Value::Array(items) => items.as_slice(),
            single => std::slice::from_ref(single),
        };
        for c in list {
            filter.conds.push(Cond::parse(c, &name)?);
        }
    }

    if let Some(v) = map.get("otherwise") {
        let Value::String(s) = v else {
            return Err(ferr(&name, "otherwise: not a string"));
        };
        filter.otherwise = Some(
            Flow::from_name(s).ok_or_else(|| ferr(&name, format!("otherwise: unknown '{s}'")))?,
        );
    }

    if out.contains_key(&name) {
        return Err(ferr(&name, format!("filter name conflict '{name}'")));
    }
    out.insert(name.clone(), filter);
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Policy {
        Policy::parse(&v.to_string()).unwrap()
    }

    #[test]
    fn defaults_apply_without_a_match() {
        let p = parse(json!({
            "default": "accept",
            "filters": {
                "only": {"action": "reject", "if": {"equal": ".x", "value": 1}, "next": "fin"},
                "fin": {"action": "return"}
            },
            "start": "only"
        }));
        let v = p.run(&json!({"x": 2}));
        assert!(v.accepted());
        assert_eq!(v.last_filter, None);
        assert_eq!(v.reason, "Default filter action");
    }

    #[test]
    fn terminal_actions_name_their_filter() {
        let p = parse(json!({
            "filters": {"blocker": {"action": "reject"}}
        }));
        let v = p.run(&json!({}));
        assert_eq!(v.action, Decision::Reject);
        assert_eq!(v.last_filter.as_deref(), Some("blocker"));
        assert_eq!(v.reason, "Filter match");
    }

    #[test]
    fn start_defaults_to_first_declared_filter() {
        let p = parse(json!({
            "filters": {
                "zzz": {"action": "accept"},
                "aaa": {"action": "reject"}
            }
        }));
        assert!(p.run(&json!({})).accepted());
    }

    #[test]
    fn chains_expand_with_synthesised_next_links() {
        let p = parse(json!({
            "start": "chain",
            "filters": {
                "chain": [
                    {"action": "reject", "if": {"equal": ".who", "value": "mallory"}},
                    {"name": "named", "action": "accept", "if": {"exist": ".who"}},
                    {"action": "reject"}
                ]
            }
        }));
        assert!(p.run(&json!({"who": "alice"})).accepted());
        let v = p.run(&json!({"who": "mallory"}));
        assert_eq!(v.action, Decision::Reject);
        assert_eq!(v.last_filter.as_deref(), Some("chain_0"));
        let v = p.run(&json!({}));
        assert_eq!(v.action, Decision::Reject);
        assert_eq!(v.last_filter.as_deref(), Some("chain_2"));
    }

    #[test]
    fn chain_expansion_matches_explicit_layout() {
        // The array form must evaluate exactly like the hand-linked form.
        let chained = parse(json!({
            "start": "f",
            "filters": {
                "f": [
                    {"action": "next", "if": {"exist": ".skip"}},
                    {"action": "accept"}
                ]
            }
        }));
        let explicit = parse(json!({
            "start": "f_0",
            "filters": {
                "f_0": {"action": "next", "if": {"exist": ".skip"}, "next": "f_1"},
                "f_1": {"action": "accept"}
            }
        }));
        for data in [json!({}), json!({"skip": true})] {
            let a = chained.run(&data);
            let b = explicit.run(&data);
            assert_eq!(a.action, b.action);
            assert_eq!(a.last_filter, b.last_filter);
            assert_eq!(a.reason, b.reason);
        }
    }

    #[test]
    fn jump_moves_and_call_returns() {
        let p = parse(json!({
            "start": "entry",
            "filters": {
                "entry": {"action": "call", "call": "sub", "on-return": "accept"},
                "sub": [
                    {"action": "reject", "if": {"equal": ".deny", "value": true}},
                    {"action": "return"}
                ]
            }
        }));
        assert!(p.run(&json!({})).accepted());
        assert_eq!(p.run(&json!({"deny": true})).action, Decision::Reject);
    }

    #[test]
    fn scoped_call_sees_the_constructed_view() {
        let p = parse(json!({
            "start": "entry",
            "filters": {
                "entry": {
                    "action": "call", "call": "sub", "scope": ".request",
                    "on-return": "reject"
                },
                "sub": [
                    {"action": "accept", "if": {"equal": ".user", "value": "admin"}},
                    {"action": "return"}
                ]
            }
        }));
        assert!(p.run(&json!({"request": {"user": "admin"}})).accepted());
        assert_eq!(
            p.run(&json!({"request": {"user": "guest"}})).action,
            Decision::Reject
        );
    }

    #[test]
    fn scope_failure_rejects_instead_of_erroring() {
        let p = parse(json!({
            "start": "entry",
            "filters": {
                "entry": {"action": "call", "call": "sub", "scope": ".absent"},
                "sub": {"action": "accept"}
            }
        }));
        let v = p.run(&json!({}));
        assert_eq!(v.action, Decision::Reject);
        assert!(v.reason.contains("scope construction failed"));
    }

    #[test]
    fn missing_next_rejects_with_the_bug_reason() {
        let p = parse(json!({
            "start": "f",
            "filters": {"f": {"action": "next"}}
        }));
        let v = p.run(&json!({}));
        assert_eq!(v.action, Decision::Reject);
        assert_eq!(v.reason, "bug in policy.json - no 'next'");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let p = parse(json!({
            "start": "f",
            "filters": {
                "f": {"action": "accept", "if": {"exist": ".k"}, "otherwise": "reject"}
            }
        }));
        let data = json!({"k": 1});
        let first = p.run(&data);
        for _ in 0..5 {
            let again = p.run(&data);
            assert_eq!(first.action, again.action);
            assert_eq!(first.last_filter, again.last_filter);
            assert_eq!(first.reason, again.reason);
        }
    }

    #[test]
    fn comments_are_stripped_from_policy_and_data() {
        let p = parse(json!({
            "_": "policy-level comment",
            "start": "f",
            "filters": {
                "f": {"_": "rule comment", "action": "reject", "if": {"exist": "._"}}
            }
        }));
        // The data's "_" member is invisible to the condition.
        let v = p.run(&json!({"_": "data comment"}));
        assert_eq!(v.reason, "Default filter action");
    }

    #[test]
    fn parse_errors_pinpoint_the_filter() {
        let bad = Policy::parse(
            &json!({
                "filters": {"oops": {"action": "jump"}}
            })
            .to_string(),
        );
        match bad {
            Err(PolicyError::Filter { filter, .. }) => assert_eq!(filter, "oops"),
            other => panic!("expected filter error, got {other:?}"),
        }
    }

    #[test]
    fn unresolved_targets_are_rejected_at_parse_time() {
        assert!(matches!(
            Policy::parse(
                &json!({"start": "ghost", "filters": {"f": {"action": "accept"}}}).to_string()
            ),
            Err(PolicyError::BadStart(_))
        ));
        assert!(
            Policy::parse(
                &json!({"filters": {"f": {"action": "jump", "jump": "ghost"}}}).to_string()
            )
            .is_err()
        );
    }

    #[test]
    fn duplicate_names_conflict() {
        assert!(
            Policy::parse(
                &json!({
                    "filters": {
                        "a": {"action": "accept"},
                        "b": {"name": "a", "action": "reject"}
                    }
                })
                .to_string()
            )
            .is_err()
        );
    }

    #[test]
    fn env_expansion_applies_to_policy_and_data() {
        let policy = json!({
            "start": "f",
            "filters": {
                "f": {
                    "action": "accept",
                    "if": {"equal": ".hostname", "value": "{HOST}"},
                    "otherwise": "reject"
                }
            }
        })
        .to_string();
        let data = json!({
            "hostname": "box1.example.com",
            "__env": {"HOST": "box1.example.com"}
        });
        let v = run_with_env(&policy, &data, false).unwrap();
        assert!(v.accepted());

        let data = json!({
            "hostname": "other.example.com",
            "__env": {"HOST": "box1.example.com"}
        });
        assert!(!run_with_env(&policy, &data, false).unwrap().accepted());
    }
}
