// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The background reenroller.
//!
//! Periodically scans the record tree for `hint-reenroll-<stamp>` files
//! and reenrolls every record whose deadline has passed, invoking the
//! operation executor directly — same binary, same status-code contract
//! as the web layer, just without the web layer.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use hcp_common::{Config, datetime2hint, exit2http};
use hcp_store::{Store, due_hints, halfhash, scan_hints};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reenroller", version, about = "HCP reenrollment scheduler")]
struct Args {
    /// Run a single sweep and exit.
    #[arg(long)]
    once: bool,

    /// Seconds between sweeps (overrides the config).
    #[arg(long)]
    period: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hcp=info")),
        )
        .init();

    let cfg = Config::from_env().context("load service config")?;
    let state_dir = cfg
        .extract_str(".enrollsvc.state")
        .context("read .enrollsvc.state")?
        .context("missing .enrollsvc.state")?;
    let store = Store::new(Path::new(&state_dir));
    let op_bin = cfg
        .extract_str(".enrollsvc.op_bin")
        .context("read .enrollsvc.op_bin")?
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("enrollsvc-op"));
    let period = args.period.unwrap_or_else(|| {
        cfg.extract(".enrollsvc.reenroller.period")
            .ok()
            .flatten()
            .and_then(|v| v.as_u64())
            .unwrap_or(300)
    });

    loop {
        sweep(&store, &op_bin)?;
        if args.once {
            return Ok(());
        }
        std::thread::sleep(Duration::from_secs(period));
    }
}

fn sweep(store: &Store, op_bin: &Path) -> Result<()> {
    let hints = scan_hints(store).context("scan reenrollment hints")?;
    let now = datetime2hint(Utc::now());
    let due = due_hints(&hints, &now);
    info!(
        target: "hcp.reenroller",
        %now,
        pending = hints.len(),
        due = due.len(),
        "sweep"
    );

    for hint in due {
        let short = halfhash(&hint.ekpubhash);
        info!(target: "hcp.reenroller", ekpubhash = %short, stamp = %hint.stamp, "reenrolling");
        let client = serde_json::json!({"ekpubhash": hint.ekpubhash}).to_string();
        let out = Command::new(op_bin)
            .arg("reenroll")
            .arg(&client)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("invoke {}", op_bin.display()))?;
        let status = exit2http(out.status.code().unwrap_or(50));
        if status != 201 {
            error!(
                target: "hcp.reenroller",
                ekpubhash = %short,
                status,
                stdout = %String::from_utf8_lossy(&out.stdout),
                stderr = %String::from_utf8_lossy(&out.stderr),
                "reenroll failed"
            );
            bail!("reenroll of '{short}' failed with status {status}");
        }
    }
    Ok(())
}
