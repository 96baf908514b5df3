// SPDX-License-Identifier: MIT OR Apache-2.0
//! The privilege-separation channel.
//!
//! The web worker never touches enrollment state itself: every verb is
//! delegated to the `enrollsvc-op` executor, optionally behind a
//! pinholed `sudo -u <dbuser>` so the OS enforces the boundary. The
//! child's environment is scrubbed down to an allow-list, its exit code
//! is an HTTP status compressed into 0–99, and its stdout is the
//! response body.

use hcp_common::exit2http;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Environment variables that survive the scrub.
const ENV_ALLOWLIST: &[&str] = &["HCP_CONFIG_FILE", "HCP_CONFIG_SCOPE", "PATH"];

/// What came back across the boundary.
#[derive(Debug, Clone)]
pub struct OpOutput {
    /// HTTP status decoded from the exit code.
    pub status: u16,
    /// The executor's stdout (JSON on success, a terse line on failure).
    pub stdout: String,
}

/// Invoker for the operation executor.
#[derive(Debug, Clone)]
pub struct OpInvoker {
    /// Path of the `enrollsvc-op` binary.
    pub op_bin: PathBuf,
    /// Identity to `sudo` to; `None` invokes directly (tests,
    /// single-identity deployments).
    pub sudo_user: Option<String>,
}

impl OpInvoker {
    /// Invoke a verb with its JSON-stringified arguments.
    pub async fn invoke(&self, verb: &str, args: &[String]) -> std::io::Result<OpOutput> {
        let mut cmd = match &self.sudo_user {
            Some(user) => {
                let mut c = Command::new("sudo");
                c.arg("-u").arg(user).arg(&self.op_bin);
                c
            }
            None => Command::new(&self.op_bin),
        };
        cmd.arg(verb).args(args);

        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(v) = std::env::var(key) {
                cmd.env(key, v);
            }
        }

        debug!(target: "hcp.enrollsvc", %verb, "invoking executor");
        let out = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        for line in String::from_utf8_lossy(&out.stderr).lines() {
            if !line.is_empty() {
                warn!(target: "hcp.enrollsvc.op", "{line}");
            }
        }

        let status = exit2http(out.status.code().unwrap_or(50));
        debug!(target: "hcp.enrollsvc", %verb, exit = ?out.status.code(), status, "executor done");
        Ok(OpOutput {
            status,
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
        })
    }
}
