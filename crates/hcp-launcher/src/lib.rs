// SPDX-License-Identifier: MIT OR Apache-2.0
//! hcp-launcher
#![deny(unsafe_code)]
//!
//! Config model and target parsing for the service supervisor. The
//! supervisor consumes one declarative JSON document describing the
//! services of a workload: guarded setup steps, long-running services
//! with optional readiness touchfiles, per-service environment
//! transforms, and what to do with leftover command-line arguments.
//! Process execution lives in the binary; everything here is pure and
//! unit-testable.

use anyhow::{Result, bail};
use hcp_common::Config;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

/// Environment variables preserved across a `runuser` identity switch.
pub const RUNUSER_KEEP_ENV: &str = "HCP_CONFIG_FILE,HCP_CONFIG_SCOPE";

// ---------------------------------------------------------------------------
// Environment transforms
// ---------------------------------------------------------------------------

/// A `{pathadd, set, unset}` environment transform.
#[derive(Debug, Clone, Default)]
pub struct EnvTransform {
    pathadd: Vec<(String, String)>,
    set: Vec<(String, Value)>,
    unset: Vec<String>,
}

impl EnvTransform {
    /// Parse an `env` section. `at` names the section in errors.
    pub fn parse(spec: &Value, at: &str) -> Result<Self> {
        let Value::Object(spec) = spec else {
            bail!("'{at}' must be an object");
        };
        let mut out = Self::default();
        for (section, body) in spec {
            let Value::Object(body) = body else {
                bail!("'{at}:{section}' must be an object");
            };
            match section.as_str() {
                "pathadd" => {
                    for (k, v) in body {
                        let Value::String(v) = v else {
                            bail!("'{at}:pathadd:{k}' must be a string");
                        };
                        out.pathadd.push((k.clone(), v.clone()));
                    }
                }
                "set" => {
                    for (k, v) in body {
                        out.set.push((k.clone(), v.clone()));
                    }
                }
                "unset" => {
                    for (k, v) in body {
                        if !v.is_null() {
                            bail!("'{at}:unset:{k}' must be null");
                        }
                        out.unset.push(k.clone());
                    }
                }
                other => bail!("'{at}' supports pathadd/set/unset (not '{other}')"),
            }
        }
        Ok(out)
    }

    /// Derive a new environment from `base`: unset, then set (non-string
    /// values JSON-encoded), then pathadd (colon-appended).
    pub fn apply(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = base.clone();
        for k in &self.unset {
            env.remove(k);
        }
        for (k, v) in &self.set {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.insert(k.clone(), value);
        }
        for (k, v) in &self.pathadd {
            match env.get(k) {
                Some(cur) if !cur.is_empty() => {
                    let appended = format!("{cur}:{v}");
                    env.insert(k.clone(), appended);
                }
                _ => {
                    env.insert(k.clone(), v.clone());
                }
            }
        }
        env
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// The touch target guarding a setup step.
#[derive(Debug, Clone)]
pub enum Touch {
    /// Setup is complete when this file exists.
    File(PathBuf),
    /// Setup is complete when this directory exists.
    Dir(PathBuf),
}

impl Touch {
    /// Whether the target exists (with the right type).
    pub fn exists(&self) -> bool {
        match self {
            Self::File(p) => p.is_file(),
            Self::Dir(p) => p.is_dir(),
        }
    }

    /// The target path.
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::File(p) | Self::Dir(p) => p,
        }
    }
}

/// One setup step of a service.
#[derive(Debug, Clone)]
pub struct SetupStep {
    /// Command to run when the touch target is absent.
    pub exec: Option<Vec<String>>,
    /// Guarding touch target.
    pub touch: Option<Touch>,
    /// Tag for `setup-<tag>` filtering.
    pub tag: Option<String>,
}

/// One declared service.
#[derive(Debug, Clone)]
pub struct Service {
    /// Service name (its key in the config).
    pub name: String,
    /// Command line, already prefixed with `runuser` when uid/gid ask
    /// for an identity switch. `None` for setup-only services.
    pub exec: Option<Vec<String>>,
    /// Default extra arguments appended to `exec`.
    pub args: Vec<String>,
    /// Readiness touchfile polled after start.
    pub until: Option<PathBuf>,
    /// Tag for `start-<tag>` filtering.
    pub tag: Option<String>,
    /// Don't count this service when deciding whether to keep
    /// supervising.
    pub nowait: bool,
    /// Setup steps.
    pub setup: Vec<SetupStep>,
    /// Per-service environment transform.
    pub env: Option<EnvTransform>,
}

/// The parsed supervisor configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Workload id.
    pub id: String,
    /// Declared services, in config order.
    pub services: Vec<Service>,
    /// Targets used when argv names none.
    pub default_targets: Vec<String>,
    /// Which service receives passthrough arguments.
    pub args_for: Option<String>,
    /// Global environment transform.
    pub env: Option<EnvTransform>,
    /// Command exec'd on clean exit.
    pub lights_out: Option<Vec<String>>,
}

fn string_list(v: &Value, at: &str) -> Result<Vec<String>> {
    let items = match v {
        Value::String(s) => return Ok(vec![s.clone()]),
        Value::Array(items) => items,
        other => bail!("'{at}' should be a string or list of strings (not {other})"),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Value::String(s) = item else {
            bail!("'{at}' can only contain strings");
        };
        out.push(s.clone());
    }
    Ok(out)
}

fn opt_string(v: Option<Value>, at: &str) -> Result<Option<String>> {
    match v {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => bail!("'{at}' should be a string (not {other})"),
    }
}

impl LauncherConfig {
    /// Parse the supervisor config from the service's config world.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let id = cfg
            .extract_str(".id")?
            .unwrap_or_else(|| "unknown_id".to_string());

        let service_names = match cfg.extract(".services")? {
            None => Vec::new(),
            Some(v) => string_list(&v, "services")?,
        };
        let default_targets = match cfg.extract(".default_targets")? {
            None => vec!["setup".to_string(), "start".to_string()],
            Some(v) => string_list(&v, "default_targets")?,
        };
        let args_for = opt_string(cfg.extract(".args_for")?, "args_for")?.filter(|s| !s.is_empty());
        let env = match cfg.extract(".env")? {
            None => None,
            Some(v) => Some(EnvTransform::parse(&v, "env")?),
        };
        let lights_out = match cfg.extract(".lights_out")? {
            None => None,
            Some(v) => Some(string_list(&v, "lights_out")?),
        };

        let mut services = Vec::with_capacity(service_names.len());
        for name in &service_names {
            services.push(Self::parse_service(cfg, name)?);
        }

        Ok(Self {
            id,
            services,
            default_targets,
            args_for,
            env,
            lights_out,
        })
    }

    fn parse_service(cfg: &Config, name: &str) -> Result<Service> {
        let mut scoped = cfg.clone();
        scoped
            .scope_shrink(&format!(".{name}"))
            .map_err(|e| anyhow::anyhow!("service '{name}' missing from config: {e}"))?;

        let mut exec = match scoped.extract(".exec")? {
            None => None,
            Some(v) => Some(string_list(&v, &format!("{name}:exec"))?),
        };
        let mut until = None;
        let mut tag = None;
        let mut args = Vec::new();
        let mut nowait = false;
        if exec.is_some() {
            until = opt_string(scoped.extract(".until")?, &format!("{name}:until"))?
                .map(PathBuf::from);
            tag = opt_string(scoped.extract(".tag")?, &format!("{name}:tag"))?;
            let uid = opt_string(scoped.extract(".uid")?, &format!("{name}:uid"))?;
            let gid = opt_string(scoped.extract(".gid")?, &format!("{name}:gid"))?;
            if let Some(uid) = uid {
                // Identity switch: wrap the command in runuser, keeping
                // the config env-vars across the switch.
                let mut wrapped = vec![
                    "runuser".to_string(),
                    "-w".to_string(),
                    RUNUSER_KEEP_ENV.to_string(),
                ];
                if let Some(gid) = gid {
                    wrapped.push("-g".to_string());
                    wrapped.push(gid);
                }
                wrapped.push("-u".to_string());
                wrapped.push(uid);
                wrapped.push("--".to_string());
                wrapped.extend(exec.take().expect("exec checked above"));
                exec = Some(wrapped);
            }
            if let Some(xtra) = scoped.extract(".args")? {
                let Value::Array(_) = xtra else {
                    bail!("'{name}:args' must be a list");
                };
                args = string_list(&xtra, &format!("{name}:args"))?;
            }
            nowait = match scoped.extract(".nowait")? {
                None | Some(Value::Null) | Some(Value::Bool(false)) => false,
                Some(_) => true,
            };
        }

        let setup = match scoped.extract(".setup")? {
            None => Vec::new(),
            Some(Value::Object(step)) => {
                vec![Self::parse_setup(&Value::Object(step), name)?]
            }
            Some(Value::Array(steps)) => {
                let mut out = Vec::with_capacity(steps.len());
                for s in &steps {
                    out.push(Self::parse_setup(s, name)?);
                }
                out
            }
            Some(other) => bail!("'{name}:setup' must be an object or list (not {other})"),
        };

        let env = match scoped.extract(".env")? {
            None => None,
            Some(v) => Some(EnvTransform::parse(&v, &format!("{name}:env"))?),
        };

        Ok(Service {
            name: name.to_string(),
            exec,
            args,
            until,
            tag,
            nowait,
            setup,
            env,
        })
    }

    fn parse_setup(spec: &Value, name: &str) -> Result<SetupStep> {
        let Value::Object(map) = spec else {
            bail!("'{name}:setup[]' entries must be objects");
        };
        let exec = match map.get("exec") {
            None => None,
            Some(v) => Some(string_list(v, &format!("{name}:setup[]:exec"))?),
        };
        let touch = match (map.get("touchfile"), map.get("touchdir")) {
            (Some(_), Some(_)) => {
                bail!("'{name}:setup[]': touchfile and touchdir can't both be provided")
            }
            (Some(Value::String(p)), None) => Some(Touch::File(PathBuf::from(p))),
            (None, Some(Value::String(p))) => Some(Touch::Dir(PathBuf::from(p))),
            (None, None) => None,
            _ => bail!("'{name}:setup[]': touch target must be a string"),
        };
        let tag = match map.get("tag") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => bail!("'{name}:setup[]:tag' must be a string (not {other})"),
        };
        Ok(SetupStep { exec, touch, tag })
    }

    /// Find a service by name.
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// One action requested on the supervisor command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Run setup steps, optionally tag-filtered.
    Setup(Option<String>),
    /// Start services, optionally tag-filtered.
    Start(Option<String>),
    /// Replace the supervisor with the named service's command.
    Exec(String),
    /// Replace the supervisor with an arbitrary command.
    Custom(Vec<String>),
}

/// The parsed command line: targets to run, plus any passthrough
/// arguments captured for the `args_for` service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArgs {
    /// Actions, in order.
    pub targets: Vec<Target>,
    /// Replacement arguments for the `args_for` service.
    pub service_args: Option<Vec<String>>,
}

/// Interpret the supervisor's argv. Recognised tokens are consumed as
/// targets; a `-`-prefixed token (or `--`) routes the remaining argv to
/// the `args_for` service, prepending `default_targets` when nothing
/// was named yet; any other token turns the rest into a custom command.
pub fn parse_targets(tokens: &[String], config: &LauncherConfig) -> Result<ParsedArgs> {
    let mut actions: VecDeque<String> = tokens.iter().cloned().collect();
    let mut targets = Vec::new();
    let mut service_args = None;

    while let Some(action) = actions.pop_front() {
        if action == "none" {
            continue;
        } else if action == "setup" {
            targets.push(Target::Setup(None));
        } else if let Some(tag) = action.strip_prefix("setup-") {
            targets.push(Target::Setup(Some(tag.to_string())));
        } else if action == "start" {
            targets.push(Target::Start(None));
        } else if let Some(tag) = action.strip_prefix("start-") {
            targets.push(Target::Start(Some(tag.to_string())));
        } else if action == "custom" {
            targets.push(Target::Custom(actions.drain(..).collect()));
        } else if let Some(name) = action.strip_prefix("exec-") {
            targets.push(Target::Exec(name.to_string()));
        } else if action.starts_with('-') {
            let Some(args_for) = &config.args_for else {
                bail!("given arguments, but there's no 'args_for' service");
            };
            if config.service(args_for).is_none() {
                bail!("given arguments, but the service is missing: {args_for}");
            }
            if targets.is_empty() {
                // Nothing explicit was asked for, so the user wants the
                // defaults plus their arguments: replay everything
                // behind the default targets.
                actions.push_front(action);
                for t in config.default_targets.iter().rev() {
                    actions.push_front(t.clone());
                }
            } else {
                if action != "--" {
                    actions.push_front(action);
                }
                service_args = Some(actions.drain(..).collect());
            }
        } else {
            // Anything unrecognised starts a custom command.
            let mut rest: Vec<String> = vec![action];
            rest.extend(actions.drain(..));
            targets.push(Target::Custom(rest));
        }
    }

    Ok(ParsedArgs {
        targets,
        service_args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(world: Value) -> LauncherConfig {
        LauncherConfig::from_config(&Config::from_value(world)).unwrap()
    }

    fn basic() -> LauncherConfig {
        config(json!({
            "id": "aclient",
            "services": ["attester", "webapi"],
            "args_for": "webapi",
            "attester": {
                "setup": {"touchfile": "/tmp/x/attester-ready", "exec": ["/bin/true"]},
                "exec": "/hcp/attester.sh",
                "until": "/tmp/x/attested",
                "tag": "core"
            },
            "webapi": {
                "exec": ["/hcp/webapi.py", "--serve"],
                "args": ["--port", "8080"],
                "uid": "www-data",
                "gid": "www-data",
                "nowait": true,
                "env": {"set": {"VERBOSE": 2}, "pathadd": {"PATH": "/hcp/bin"}, "unset": {"TERM": null}}
            }
        }))
    }

    #[test]
    fn parses_services_in_order() {
        let cfg = basic();
        assert_eq!(cfg.id, "aclient");
        assert_eq!(cfg.services.len(), 2);
        assert_eq!(cfg.services[0].name, "attester");
        assert_eq!(cfg.default_targets, vec!["setup", "start"]);
    }

    #[test]
    fn exec_strings_normalise_and_uid_wraps_in_runuser() {
        let cfg = basic();
        let attester = cfg.service("attester").unwrap();
        assert_eq!(attester.exec.as_deref().unwrap(), ["/hcp/attester.sh"]);
        assert_eq!(attester.until.as_deref().unwrap().to_str().unwrap(), "/tmp/x/attested");

        let webapi = cfg.service("webapi").unwrap();
        let exec = webapi.exec.as_deref().unwrap();
        assert_eq!(
            exec,
            [
                "runuser",
                "-w",
                RUNUSER_KEEP_ENV,
                "-g",
                "www-data",
                "-u",
                "www-data",
                "--",
                "/hcp/webapi.py",
                "--serve"
            ]
        );
        assert!(webapi.nowait);
        assert_eq!(webapi.args, vec!["--port", "8080"]);
    }

    #[test]
    fn env_transforms_apply_in_order() {
        let cfg = basic();
        let transform = cfg.service("webapi").unwrap().env.as_ref().unwrap();
        let mut base = BTreeMap::new();
        base.insert("PATH".to_string(), "/usr/bin".to_string());
        base.insert("TERM".to_string(), "xterm".to_string());
        let env = transform.apply(&base);
        assert_eq!(env.get("PATH").unwrap(), "/usr/bin:/hcp/bin");
        // Non-string set values are JSON-encoded.
        assert_eq!(env.get("VERBOSE").unwrap(), "2");
        assert!(!env.contains_key("TERM"));
    }

    #[test]
    fn pathadd_on_empty_base_is_plain_assignment() {
        let t = EnvTransform::parse(&json!({"pathadd": {"PATH": "/hcp/bin"}}), "env").unwrap();
        let env = t.apply(&BTreeMap::new());
        assert_eq!(env.get("PATH").unwrap(), "/hcp/bin");
    }

    #[test]
    fn malformed_env_sections_are_rejected() {
        assert!(EnvTransform::parse(&json!({"frob": {}}), "env").is_err());
        assert!(EnvTransform::parse(&json!({"unset": {"X": 1}}), "env").is_err());
        assert!(EnvTransform::parse(&json!(42), "env").is_err());
    }

    #[test]
    fn plain_targets_parse() {
        let cfg = basic();
        let parsed = parse_targets(
            &["setup".to_string(), "start-core".to_string()],
            &cfg,
        )
        .unwrap();
        assert_eq!(
            parsed.targets,
            vec![Target::Setup(None), Target::Start(Some("core".to_string()))]
        );
        assert!(parsed.service_args.is_none());
    }

    #[test]
    fn custom_swallows_the_rest() {
        let cfg = basic();
        let parsed = parse_targets(
            &["custom".to_string(), "echo".to_string(), "hi".to_string()],
            &cfg,
        )
        .unwrap();
        assert_eq!(
            parsed.targets,
            vec![Target::Custom(vec!["echo".to_string(), "hi".to_string()])]
        );
    }

    #[test]
    fn unrecognised_tokens_become_custom() {
        let cfg = basic();
        let parsed = parse_targets(&["ls".to_string(), "-l".to_string()], &cfg).unwrap();
        assert_eq!(
            parsed.targets,
            vec![Target::Custom(vec!["ls".to_string(), "-l".to_string()])]
        );
    }

    #[test]
    fn dash_args_go_to_the_args_for_service_after_defaults() {
        let cfg = basic();
        let parsed = parse_targets(&["-v".to_string(), "-x".to_string()], &cfg).unwrap();
        assert_eq!(
            parsed.targets,
            vec![Target::Setup(None), Target::Start(None)]
        );
        assert_eq!(
            parsed.service_args.unwrap(),
            vec!["-v".to_string(), "-x".to_string()]
        );
    }

    #[test]
    fn double_dash_passes_non_dash_arguments() {
        let cfg = basic();
        let parsed = parse_targets(
            &["start".to_string(), "--".to_string(), "serve".to_string()],
            &cfg,
        )
        .unwrap();
        assert_eq!(parsed.targets, vec![Target::Start(None)]);
        assert_eq!(parsed.service_args.unwrap(), vec!["serve".to_string()]);
    }

    #[test]
    fn dash_args_without_args_for_fail() {
        let cfg = config(json!({"id": "x", "services": []}));
        assert!(parse_targets(&["-v".to_string()], &cfg).is_err());
    }

    #[test]
    fn exec_target_names_the_service() {
        let cfg = basic();
        let parsed = parse_targets(&["exec-webapi".to_string()], &cfg).unwrap();
        assert_eq!(parsed.targets, vec![Target::Exec("webapi".to_string())]);
    }
}
