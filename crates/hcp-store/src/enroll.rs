// SPDX-License-Identifier: MIT OR Apache-2.0
//! Enrollment staging: job-description composition, the policy consult,
//! and driving the external `attest-enroll` program into an ephemeral
//! directory. Nothing here touches the repository — the caller copies
//! the staged tree into place inside its own critical section.

use crate::{StoreError, copy_dir_all};
use hcp_common::{Config, dc_hostname, pop_domain, pop_hostname};
use hcp_json::{Expander, union};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// Key under which job descriptions carry their expansion variables.
pub const ENV_KEY: &str = "__env";

/// Environment variables that parameterise asset generation. Their
/// values are injected into the job description's `__env` for expansion
/// and exported to the `attest-enroll` child.
const ASSET_ENV_KEYS: &[&str] = &[
    "SIGNING_KEY_DIR",
    "SIGNING_KEY_PUB",
    "SIGNING_KEY_PRIV",
    "GENCERT_CA_DIR",
    "GENCERT_CA_CERT",
    "GENCERT_CA_PRIV",
];

/// Everything `add`/`reenroll` need beyond the store itself.
#[derive(Debug, Clone)]
pub struct EnrollConfig {
    /// Server profile applied under the client's request.
    pub preclient: Value,
    /// Server profile applied over the client's request.
    pub postclient: Value,
    /// Policy sidecar base URL; `None` disables the consult.
    pub policy_url: Option<String>,
    /// The external enrollment program.
    pub attest_enroll: PathBuf,
    /// Template `enroll.conf` copied into the ephemeral directory.
    pub enroll_conf: Option<PathBuf>,
    /// CHECKOUT hook handed to `attest-enroll`.
    pub checkout_hook: Option<PathBuf>,
    /// COMMIT hook handed to `attest-enroll`.
    pub commit_hook: Option<PathBuf>,
    /// Directory of asset-generator programs, prepended to PATH.
    pub genprogs_dir: Option<PathBuf>,
    /// TPM vendor trust-roots for EKcert validation.
    pub tpm_vendors: Option<PathBuf>,
    /// Signing-key / CA material locations (see [`ASSET_ENV_KEYS`]).
    pub asset_env: BTreeMap<String, String>,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            // Empty objects, not nulls: these are union operands and a
            // null right-hand side would replace the whole profile.
            preclient: json!({}),
            postclient: json!({}),
            policy_url: None,
            attest_enroll: PathBuf::from("/install-safeboot/sbin/attest-enroll"),
            enroll_conf: None,
            checkout_hook: None,
            commit_hook: None,
            genprogs_dir: None,
            tpm_vendors: None,
            asset_env: BTreeMap::new(),
        }
    }
}

impl EnrollConfig {
    /// Build from the service config (scope `.enrollsvc`) plus the
    /// asset-material environment variables.
    pub fn from_config(cfg: &Config) -> Result<Self, StoreError> {
        let get = |p: &str| cfg.extract(p).ok().flatten();
        let get_path = |p: &str| -> Option<PathBuf> {
            get(p).and_then(|v| v.as_str().map(PathBuf::from))
        };

        let mut asset_env = BTreeMap::new();
        for key in ASSET_ENV_KEYS {
            if let Ok(v) = std::env::var(key) {
                if !v.is_empty() {
                    asset_env.insert(key.to_string(), v);
                }
            }
        }

        Ok(Self {
            preclient: get(".enrollsvc.db_add.preclient").unwrap_or_else(|| json!({})),
            postclient: get(".enrollsvc.db_add.postclient").unwrap_or_else(|| json!({})),
            policy_url: get(".enrollsvc.policy_url")
                .and_then(|v| v.as_str().map(str::to_string)),
            attest_enroll: get_path(".enrollsvc.db_add.attest_enroll")
                .unwrap_or_else(|| PathBuf::from("/install-safeboot/sbin/attest-enroll")),
            enroll_conf: get_path(".enrollsvc.db_add.enroll_conf"),
            checkout_hook: get_path(".enrollsvc.db_add.checkout_hook"),
            commit_hook: get_path(".enrollsvc.db_add.commit_hook"),
            genprogs_dir: get_path(".enrollsvc.db_add.genprogs"),
            tpm_vendors: get_path(".enrollsvc.tpm_vendors"),
            asset_env,
        })
    }
}

/// Compose the final job description: `union(preclient, client)` then
/// `union(.., postclient)`, augmented with derived `__env` fields, then
/// variable-expanded (types propagate, sections are left alone).
pub fn compose_profile(
    cfg: &EnrollConfig,
    hostname: &str,
    client: &Value,
) -> Result<Value, StoreError> {
    let mut profile = union(&union(&cfg.preclient, client), &cfg.postclient);

    let hostname2dc = dc_hostname(hostname)?;
    let domain = match profile
        .get(ENV_KEY)
        .and_then(|e| e.get("ENROLL_DOMAIN"))
        .and_then(Value::as_str)
    {
        Some(d) => d.to_string(),
        None => {
            let (_, domain) = pop_hostname(hostname)?;
            hcp_json::overwrite_path(
                &mut profile,
                ".__env.ENROLL_DOMAIN",
                json!(domain),
            )
            .map_err(|e| StoreError::BadRequest(e.to_string()))?;
            domain.to_string()
        }
    };
    let (id, popped_domain) = pop_domain(hostname, &domain)?;
    let id = if popped_domain.is_some() {
        id
    } else {
        "unknown_id".to_string()
    };
    let domain2dc = dc_hostname(&domain)?;

    let mut env = Map::new();
    env.insert("ENROLL_ID".to_string(), json!(id));
    env.insert("ENROLL_HOSTNAME".to_string(), json!(hostname));
    env.insert("ENROLL_HOSTNAME2DC".to_string(), json!(hostname2dc));
    env.insert("ENROLL_DOMAIN2DC".to_string(), json!(domain2dc));
    for (k, v) in &cfg.asset_env {
        env.insert(k.clone(), json!(v));
    }
    profile = union(&profile, &json!({ENV_KEY: env}));

    // Parameter expansion: peel __env, expand everything else against
    // it, put it back.
    let vars = match profile.as_object_mut().and_then(|m| m.remove(ENV_KEY)) {
        Some(Value::Object(vars)) => vars,
        Some(other) => {
            return Err(StoreError::BadRequest(format!(
                "{ENV_KEY} must be an object, not {other}"
            )));
        }
        None => Map::new(),
    };
    let mut profile = Expander::vars_only().process_with(&vars, &profile)?;
    if let Some(m) = profile.as_object_mut() {
        m.insert(ENV_KEY.to_string(), Value::Object(vars));
    }

    // Fold genprogs_pre/genprogs/genprogs_post into the list of
    // generator programs to run, in order.
    let part = |key: &str| {
        profile
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let final_genprogs = format!(
        "{} {} {}",
        part("genprogs_pre"),
        part("genprogs"),
        part("genprogs_post")
    );
    let as_array: Vec<Value> = final_genprogs
        .split_whitespace()
        .map(|s| json!(s))
        .collect();
    if let Some(m) = profile.as_object_mut() {
        m.insert("final_genprogs".to_string(), Value::Array(as_array));
    }
    Ok(profile)
}

/// Consult the policy sidecar about the composed profile. Any non-200
/// answer is a refusal, as is any failure to get an answer at all.
pub fn policy_check(cfg: &EnrollConfig, profile: &Value) -> Result<(), StoreError> {
    let Some(url) = &cfg.policy_url else {
        return Ok(());
    };
    let request_uid = Uuid::new_v4().urn().to_string();
    let params = serde_json::to_string(profile)?;
    debug!(target: "hcp.store", %request_uid, "sending policy request");
    let response = reqwest::blocking::Client::new()
        .post(format!("{url}/run"))
        .form(&[
            ("hookname", "enrollsvc::add_request"),
            ("request_uid", request_uid.as_str()),
            ("params", params.as_str()),
        ])
        .send();
    let status = match response {
        Ok(r) => r.status().as_u16(),
        Err(e) => {
            warn!(target: "hcp.store", error = %e, "policy connection failed");
            403
        }
    };
    if status != 200 {
        return Err(StoreError::PolicyRefused { status });
    }
    Ok(())
}

/// Run `attest-enroll` into a fresh ephemeral directory and return it.
/// The directory must end up containing `ek.pub` (the program converts
/// other EK formats into it).
pub fn stage_enrollment(
    cfg: &EnrollConfig,
    profile: &Value,
    ekpub: &Path,
    hostname: &str,
) -> Result<TempDir, StoreError> {
    let ephemeral = TempDir::new()?;
    debug!(target: "hcp.store", dir = %ephemeral.path().display(), "staging enrollment");

    let final_genprogs = profile
        .get("final_genprogs")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let mut cmd = Command::new(&cfg.attest_enroll);
    cmd.arg("-v");
    if let Some(template) = &cfg.enroll_conf {
        let conf = ephemeral.path().join("enroll.conf");
        std::fs::copy(template, &conf)?;
        let mut f = OpenOptions::new().append(true).open(&conf)?;
        writeln!(f, "export GENPROGS=({final_genprogs})")?;
        cmd.arg("-C").arg(&conf);
    }
    if let Some(hook) = &cfg.checkout_hook {
        cmd.arg("-V").arg(format!("CHECKOUT={}", hook.display()));
    }
    if let Some(hook) = &cfg.commit_hook {
        cmd.arg("-V").arg(format!("COMMIT={}", hook.display()));
    }
    cmd.arg("-I").arg(ekpub).arg(hostname);

    cmd.env("ENROLL_JSON", serde_json::to_string(profile)?);
    cmd.env("EPHEMERAL_ENROLL", ephemeral.path());
    if let Some(vendors) = &cfg.tpm_vendors {
        cmd.env("TPM_VENDORS", vendors);
    }
    if let Some(url) = &cfg.policy_url {
        cmd.env("HCP_ENROLLSVC_POLICY", url);
    }
    for (k, v) in &cfg.asset_env {
        cmd.env(k, v);
    }
    if let Some(genprogs) = &cfg.genprogs_dir {
        let path = std::env::var("PATH").unwrap_or_default();
        cmd.env("PATH", format!("{}:{path}", genprogs.display()));
    }

    // The tool is extremely noisy; its stdout must never reach ours.
    let status = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .status()
        .map_err(StoreError::Io)?;
    if !status.success() {
        return Err(StoreError::AttestEnroll {
            code: status.code(),
        });
    }
    if !ephemeral.path().join("ek.pub").is_file() {
        return Err(StoreError::AttestEnroll { code: None });
    }
    Ok(ephemeral)
}

/// Copy a staged enrollment into its record directory and lay down the
/// `ekpubhash` and `clientprofile` files.
pub(crate) fn install_staged(
    staged: &Path,
    record_dir: &Path,
    ekpubhash: &str,
    client_json: &str,
) -> Result<(), StoreError> {
    copy_dir_all(staged, record_dir)?;
    std::fs::write(record_dir.join("ekpubhash"), ekpubhash)?;
    std::fs::write(record_dir.join("clientprofile"), client_json)?;
    Ok(())
}
