// SPDX-License-Identifier: MIT OR Apache-2.0
//! The six database operations.
//!
//! Each takes the store (and, for enrollments, the staging config) plus
//! the client's JSON request, and returns the response body with the
//! HTTP status the executor reports. Everything that mutates the
//! repository runs inside [`Store::critical`]: locked, committed on
//! success, rolled back on failure.

use crate::enroll::{EnrollConfig, compose_profile, install_staged, policy_check, stage_enrollment};
use crate::hn2ek::filter_by_hostname;
use crate::{HostEntry, Store, StoreError, halfhash, read_trimmed, valid_ekpubhash};
use hcp_common::valid_hostname;
use regex::Regex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// An operation's response body and HTTP status.
#[derive(Debug, Clone)]
pub struct OpOutcome {
    /// JSON document for the executor's stdout.
    pub body: Value,
    /// HTTP status for the executor's exit code.
    pub status: u16,
}

fn require_str<'a>(client: &'a Value, field: &str) -> Result<&'a str, StoreError> {
    client
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::BadRequest(format!("missing '{field}'")))
}

/// Enroll a new TPM: compose the job description, consult policy, stage
/// assets via `attest-enroll`, then install the record transactionally.
/// The TPM must not already be enrolled.
pub fn op_add(
    store: &Store,
    cfg: &EnrollConfig,
    ekpub: &Path,
    hostname: &str,
    client_json: &str,
) -> Result<OpOutcome, StoreError> {
    valid_hostname(hostname)?;
    if client_json.is_empty() {
        return Err(StoreError::BadRequest("empty JSON".to_string()));
    }
    if !ekpub.exists() {
        return Err(StoreError::BadRequest(format!(
            "no file at ekpub path: {}",
            ekpub.display()
        )));
    }
    let client: Value = serde_json::from_str(client_json)?;

    let profile = compose_profile(cfg, hostname, &client)?;
    debug!(target: "hcp.store", %hostname, "composed enrollment profile");
    policy_check(cfg, &profile)?;
    let staged = stage_enrollment(cfg, &profile, ekpub, hostname)?;

    // attest-enroll may have converted the EK; hash its output, not our
    // input.
    let ekpubhash = sha256_hex(&staged.path().join("ek.pub"))?;
    let record = store.record_dir(&ekpubhash)?;
    let half = halfhash(&ekpubhash).to_string();
    debug!(target: "hcp.store", ekpubhash = %half, "enrollment staged");

    store.critical(|| {
        if record.is_dir() {
            return Err(StoreError::AlreadyEnrolled(half.clone()));
        }
        store.hn2ek_add(hostname, &ekpubhash)?;
        install_staged(staged.path(), &record, &ekpubhash, client_json)?;
        store.git_commit(&format!("map {half} to {hostname}"))
    })?;

    info!(target: "hcp.store", ekpubhash = %halfhash(&ekpubhash), %hostname, "enrolled");
    Ok(OpOutcome {
        body: json!({
            "returncode": 0,
            "hostname": hostname,
            "ekpubhash": ekpubhash,
            "profile": client,
        }),
        status: 201,
    })
}

/// Regenerate an existing record wholesale, reusing its stored
/// `clientprofile`, `hostname` and `ek.pub`. The TPM must already be
/// enrolled.
pub fn op_reenroll(
    store: &Store,
    cfg: &EnrollConfig,
    client_json: &str,
) -> Result<OpOutcome, StoreError> {
    if client_json.is_empty() {
        return Err(StoreError::BadRequest("empty JSON".to_string()));
    }
    let request: Value = serde_json::from_str(client_json)?;
    let ekpubhash = require_str(&request, "ekpubhash")?.to_string();
    valid_ekpubhash(&ekpubhash)?;
    let record = store.record_dir(&ekpubhash)?;
    let half = halfhash(&ekpubhash).to_string();
    if !record.is_dir() {
        return Err(StoreError::NotEnrolled(half));
    }

    let stored = read_trimmed(&record.join("ekpubhash"))?;
    if stored != ekpubhash {
        return Err(StoreError::BadRequest(format!(
            "record mismatch: {ekpubhash} vs {stored}"
        )));
    }
    let client_json = read_trimmed(&record.join("clientprofile"))?;
    let client: Value = serde_json::from_str(&client_json)?;
    let hostname = read_trimmed(&record.join("hostname"))?;
    let ekpub = record.join("ek.pub");
    debug!(target: "hcp.store", ekpubhash = %half, %hostname, "reenrolling");

    let profile = compose_profile(cfg, &hostname, &client)?;
    policy_check(cfg, &profile)?;
    let staged = stage_enrollment(cfg, &profile, &ekpub, &hostname)?;

    store.critical(|| {
        if !record.is_dir() {
            return Err(StoreError::NotEnrolled(half.clone()));
        }
        // Rollback restores this if anything goes wrong below; the lock
        // keeps the intermediate state unseen and uncommitted.
        fs::remove_dir_all(&record)?;
        install_staged(staged.path(), &record, &ekpubhash, &client_json)?;
        store.git_commit(&format!("map {} to {hostname}", halfhash(&ekpubhash)))
    })?;

    info!(target: "hcp.store", ekpubhash = %halfhash(&ekpubhash), %hostname, "reenrolled");
    Ok(OpOutcome {
        body: json!({
            "returncode": 0,
            "hostname": hostname,
            "ekpubhash": ekpubhash,
            "profile": client,
        }),
        status: 201,
    })
}

/// Query records by ekpubhash prefix; with `delete` set, also remove the
/// matched records and their index entries in a single commit.
pub fn op_query(store: &Store, client: &Value, delete: bool) -> Result<OpOutcome, StoreError> {
    let prefix = require_str(client, "ekpubhash")?.to_string();
    let no_files = client.get("nofiles").and_then(Value::as_bool).unwrap_or(false);

    let entries = store.critical(|| {
        let matches = store.matching_records(&prefix)?;
        let mut entries = Vec::new();
        let mut removed: Vec<(String, String)> = Vec::new();
        for path in &matches {
            let ekpubhash = read_trimmed(&path.join("ekpubhash"))?;
            let hostname = read_trimmed(&path.join("hostname"))?;
            let mut entry = json!({
                "ekpubhash": &ekpubhash,
                "hostname": &hostname,
            });
            if !no_files {
                entry["files"] = json!(list_files(path)?);
            }
            entries.push(entry);
            if delete {
                fs::remove_dir_all(path)?;
                removed.push((hostname, ekpubhash));
            }
        }
        if delete && !matches.is_empty() {
            for (hostname, ekpubhash) in &removed {
                store.hn2ek_delete(hostname, ekpubhash)?;
            }
            store.git_commit(&format!("delete {prefix}"))?;
        }
        Ok(entries)
    })?;

    Ok(OpOutcome {
        body: json!({"entries": entries}),
        status: 200,
    })
}

/// Look up records by hostname regex over the index. Substring match,
/// never anchored.
pub fn op_find(store: &Store, client: &Value) -> Result<OpOutcome, StoreError> {
    let pattern = require_str(client, "hostname_regex")?;
    let re = Regex::new(pattern)
        .map_err(|e| StoreError::BadRequest(format!("bad hostname_regex: {e}")))?;

    store.lock()?;
    let index = store.hn2ek_read();
    store.unlock()?;
    let entries = filter_by_hostname(&index?, &re);

    Ok(OpOutcome {
        body: json!({
            "hostname_regex": pattern,
            "entries": entries,
        }),
        status: 200,
    })
}

/// Walk the whole tree, normalise `ekpubhash`/`hostname` files, rebuild
/// the index from scratch, and commit if anything changed.
pub fn op_janitor(store: &Store) -> Result<OpOutcome, StoreError> {
    let index = store.critical(|| {
        let mut index: Vec<HostEntry> = Vec::new();
        for path in store.matching_records("")? {
            let (ekpubhash, hostname) = scrub_entry(&path)?;
            index.push(HostEntry {
                hostname,
                ekpubhash,
            });
        }
        store.hn2ek_write(index)?;
        store.git_commit("Janitor")?;
        store.hn2ek_read()
    })?;

    Ok(OpOutcome {
        body: json!({"hn2ek": index}),
        status: 200,
    })
}

/// Strip embedded newlines from a record's identity files, rewriting
/// them only when their content actually changes.
fn scrub_entry(path: &Path) -> Result<(String, String), StoreError> {
    let mut out = Vec::with_capacity(2);
    for name in ["ekpubhash", "hostname"] {
        let file = path.join(name);
        let raw = fs::read_to_string(&file)?;
        let clean = raw.replace('\n', "");
        if clean != raw {
            fs::write(&file, &clean)?;
        }
        out.push(clean);
    }
    let hostname = out.pop().expect("two entries pushed");
    let ekpubhash = out.pop().expect("two entries pushed");
    Ok((ekpubhash, hostname))
}

fn list_files(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut files: Vec<String> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    files.sort();
    Ok(files)
}

fn sha256_hex(path: &Path) -> Result<String, StoreError> {
    let mut hasher = Sha256::new();
    hasher.update(fs::read(path)?);
    Ok(format!("{:x}", hasher.finalize()))
}
