// SPDX-License-Identifier: MIT OR Apache-2.0
//! Git plumbing for the enrollment repository.
//!
//! Commits and hard resets are the only ways a mutation concludes. All
//! commands run with the repository working tree as the current
//! directory and captured output, so executor stdout stays clean.

use crate::{Store, StoreError};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::debug;

fn run_git(repo: &Path, args: &[&str]) -> Result<String, StoreError> {
    debug!(target: "hcp.store", "running git {args:?}");
    let out = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(StoreError::Io)?;
    if !out.status.success() {
        debug!(
            target: "hcp.store",
            stdout = %String::from_utf8_lossy(&out.stdout),
            stderr = %String::from_utf8_lossy(&out.stderr),
            "git command failed"
        );
        return Err(StoreError::Git {
            args: args.join(" "),
            code: out.status.code(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

impl Store {
    /// Commit outstanding changes, if any. A clean tree is a no-op.
    pub fn git_commit(&self, msg: &str) -> Result<(), StoreError> {
        let status = run_git(self.repo_path(), &["status", "--porcelain"])?;
        if status.is_empty() {
            debug!(target: "hcp.store", "git_commit: no changes to commit");
            return Ok(());
        }
        debug!(target: "hcp.store", "git_commit: committing changes");
        run_git(self.repo_path(), &["add", "-A"])?;
        run_git(self.repo_path(), &["commit", "-m", msg])?;
        Ok(())
    }

    /// Throw away everything since HEAD, tracked and untracked.
    pub fn git_reset(&self) -> Result<(), StoreError> {
        run_git(self.repo_path(), &["reset", "--hard"])?;
        run_git(self.repo_path(), &["clean", "-f", "-d", "-x"])?;
        Ok(())
    }

    /// `status --porcelain` output; empty means the tree is clean.
    pub fn git_status(&self) -> Result<String, StoreError> {
        run_git(self.repo_path(), &["status", "--porcelain"])
    }

    /// Number of commits on HEAD.
    pub fn git_commit_count(&self) -> Result<usize, StoreError> {
        let out = run_git(self.repo_path(), &["rev-list", "--count", "HEAD"])?;
        out.trim()
            .parse()
            .map_err(|_| StoreError::BadRequest("unparseable rev-list output".to_string()))
    }

    /// Subject line of the HEAD commit.
    pub fn git_head_subject(&self) -> Result<String, StoreError> {
        Ok(run_git(self.repo_path(), &["log", "-1", "--format=%s"])?
            .trim_end()
            .to_string())
    }

    /// Create a fresh repository: record-tree root, empty index file, a
    /// local committer identity, and a baseline commit. Used by first
    /// boot provisioning and tests; production repositories usually
    /// arrive via replication instead.
    pub fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.record_root())?;
        run_git(self.repo_path(), &["init", "-q"])?;
        run_git(self.repo_path(), &["config", "user.name", "enrollsvc"])?;
        run_git(self.repo_path(), &["config", "user.email", "enrollsvc@localhost"])?;
        fs::write(self.hn2ek_path(), "[]")?;
        run_git(self.repo_path(), &["add", "-A"])?;
        run_git(self.repo_path(), &["commit", "-q", "-m", "initial"])?;
        Ok(())
    }
}
