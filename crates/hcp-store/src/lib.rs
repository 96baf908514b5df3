// SPDX-License-Identifier: MIT OR Apache-2.0
//! hcp-store
#![deny(unsafe_code)]
//!
//! The enrollment database: a content-addressed record tree inside a git
//! working tree, with a `hostname → ekpubhash` side index, a
//! lock-directory mutex, and commit/rollback as the only way mutations
//! conclude. The six operations (`add`, `reenroll`, `query`, `delete`,
//! `find`, `janitor`) live in [`ops`]; the enrollment staging pipeline in
//! [`enroll`]; reenrollment-hint scanning in [`hints`].

pub mod enroll;
pub mod git;
pub mod hints;
pub mod hn2ek;
pub mod lock;
pub mod ops;

pub use enroll::EnrollConfig;
pub use hints::{ReenrollHint, due_hints, scan_hints};
pub use hn2ek::HostEntry;
pub use ops::{OpOutcome, op_add, op_find, op_janitor, op_query, op_reenroll};

use hcp_common::HostnameError;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::error;

/// Name of the record-tree root directory inside the repository.
const RECORD_ROOT: &str = "ekpubhash";

/// Name of the hostname index file at the repository root.
const HN2EK_BASENAME: &str = "hn2ek";

/// Errors from store operations, each carrying the HTTP status the
/// executor contract reports for it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An ekpubhash was not 64 lowercase hex characters.
    #[error("invalid ekpubhash: {0}")]
    InvalidEkpubhash(String),

    /// An ekpubhash prefix contained non-hex characters or was too long.
    #[error("invalid ekpubhash prefix: {0}")]
    InvalidPrefix(String),

    /// A hostname failed validation.
    #[error(transparent)]
    Hostname(#[from] HostnameError),

    /// The client request was malformed (missing field, bad regex, ...).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// `add` found the TPM already enrolled.
    #[error("existing ekpub: {0}")]
    AlreadyEnrolled(String),

    /// `reenroll` found the TPM not enrolled.
    #[error("unknown ekpub: {0}")]
    NotEnrolled(String),

    /// The policy sidecar refused (or could not be reached, which is
    /// deliberately treated the same way).
    #[error("policy-checker refused enrollment: {status}")]
    PolicyRefused {
        /// Status the sidecar answered with, or 403 on transport failure.
        status: u16,
    },

    /// The external attestation/enrollment program failed.
    #[error("attest-enroll failed with code {code:?}")]
    AttestEnroll {
        /// Its exit code, if it exited at all.
        code: Option<i32>,
    },

    /// A git command failed.
    #[error("git {args} failed (code={code:?})")]
    Git {
        /// The arguments that were run.
        args: String,
        /// The exit code, if any.
        code: Option<i32>,
    },

    /// Rollback itself failed: the repository is in an unknown state and
    /// the lock has been left in place for manual intervention.
    #[error("CATASTROPHIC: rollback failed, DB stays locked for manual intervention: {0}")]
    Catastrophic(String),

    /// Filesystem failure.
    #[error("store I/O error")]
    Io(#[from] io::Error),

    /// JSON (de)serialization failure.
    #[error("store JSON error")]
    Json(#[from] serde_json::Error),

    /// Job-description expansion failure.
    #[error(transparent)]
    Expand(#[from] hcp_json::ExpandError),
}

impl StoreError {
    /// The HTTP status this error reports through the executor contract.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidEkpubhash(_)
            | Self::InvalidPrefix(_)
            | Self::Hostname(_)
            | Self::BadRequest(_) => 400,
            Self::PolicyRefused { .. } => 403,
            Self::NotEnrolled(_) => 404,
            _ => 500,
        }
    }
}

fn ekpubhash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-f0-9]{64}$").expect("ekpubhash regex compiles"))
}

/// Validate a full ekpubhash (64 lowercase hex characters).
pub fn valid_ekpubhash(h: &str) -> Result<(), StoreError> {
    if ekpubhash_re().is_match(h) {
        Ok(())
    } else {
        Err(StoreError::InvalidEkpubhash(h.to_string()))
    }
}

/// Validate an ekpubhash prefix (0–64 lowercase hex characters).
pub fn valid_ekpubhash_prefix(p: &str) -> Result<(), StoreError> {
    if p.len() <= 64 && p.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
        Ok(())
    } else {
        Err(StoreError::InvalidPrefix(p.to_string()))
    }
}

/// First 16 hex characters, for log lines and commit messages.
pub fn halfhash(h: &str) -> &str {
    &h[..h.len().min(16)]
}

/// Read a small record file, tolerating a trailing newline (historical
/// records carry one; the janitor normalises them).
pub fn read_trimmed(path: &Path) -> io::Result<String> {
    let s = fs::read_to_string(path)?;
    Ok(s.trim_end_matches('\n').to_string())
}

/// Recursively copy a directory tree.
pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Handle on the enrollment repository and its lock.
#[derive(Debug, Clone)]
pub struct Store {
    repo: PathBuf,
    lockdir: PathBuf,
}

impl Store {
    /// Conventional layout under a service state directory:
    /// `<state>/db/enrolldb.git` with the lock as a sibling.
    pub fn new(state_dir: &Path) -> Self {
        let db = state_dir.join("db");
        Self {
            repo: db.join("enrolldb.git"),
            lockdir: db.join("lock-enrolldb.git"),
        }
    }

    /// Explicit paths (tests, unconventional layouts).
    pub fn at(repo: PathBuf, lockdir: PathBuf) -> Self {
        Self { repo, lockdir }
    }

    /// The repository working tree.
    pub fn repo_path(&self) -> &Path {
        &self.repo
    }

    /// The lock directory.
    pub fn lock_path(&self) -> &Path {
        &self.lockdir
    }

    /// Root of the content-addressed record tree.
    pub fn record_root(&self) -> PathBuf {
        self.repo.join(RECORD_ROOT)
    }

    /// Path of the hostname index.
    pub fn hn2ek_path(&self) -> PathBuf {
        self.repo.join(HN2EK_BASENAME)
    }

    /// The canonical record directory for an ekpubhash:
    /// `<root>/<h[..2]>/<h[..6]>/<h[..32]>`.
    pub fn record_dir(&self, ekpubhash: &str) -> Result<PathBuf, StoreError> {
        valid_ekpubhash(ekpubhash)?;
        Ok(self
            .record_root()
            .join(&ekpubhash[..2])
            .join(&ekpubhash[..6])
            .join(&ekpubhash[..32]))
    }

    /// All record directories whose ekpubhash starts with `prefix`,
    /// sorted. Only the first 32 characters can select a directory —
    /// longer prefixes match on their first 32, like the original glob.
    pub fn matching_records(&self, prefix: &str) -> Result<Vec<PathBuf>, StoreError> {
        valid_ekpubhash_prefix(prefix)?;
        let root = self.record_root();

        let level1 = if prefix.len() >= 2 {
            existing_dir(root.join(&prefix[..2]))
        } else {
            list_prefixed(&root, prefix)?
        };

        let mut out = Vec::new();
        for d1 in level1 {
            let level2 = if prefix.len() >= 6 {
                existing_dir(d1.join(&prefix[..6]))
            } else {
                list_prefixed(&d1, prefix)?
            };
            for d2 in level2 {
                let level3 = if prefix.len() >= 32 {
                    existing_dir(d2.join(&prefix[..32]))
                } else {
                    list_prefixed(&d2, prefix)?
                };
                out.extend(level3);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Run a fallible body inside the repository critical section.
    ///
    /// On failure the working tree is rolled back to HEAD before the
    /// lock is released and the error propagated. If the rollback itself
    /// fails, the lock is deliberately left in place and a catastrophic
    /// error returned — an operator has to look at the repository before
    /// anything else touches it.
    pub fn critical<T>(
        &self,
        body: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.lock()?;
        match body() {
            Ok(v) => {
                self.unlock()?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rollback) = self.git_reset() {
                    error!(
                        target: "hcp.store",
                        error = %rollback,
                        "rollback failed, leaving the repository locked"
                    );
                    return Err(StoreError::Catastrophic(rollback.to_string()));
                }
                self.unlock()?;
                Err(e)
            }
        }
    }
}

fn existing_dir(path: PathBuf) -> Vec<PathBuf> {
    if path.is_dir() { vec![path] } else { Vec::new() }
}

fn list_prefixed(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, StoreError> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: &str = "0d3fe10000000000aaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbcccccccccccccccc";

    #[test]
    fn validates_hashes_and_prefixes() {
        valid_ekpubhash(H).unwrap();
        assert!(valid_ekpubhash(&H[..63]).is_err());
        assert!(valid_ekpubhash(&H.to_uppercase()).is_err());
        valid_ekpubhash_prefix("").unwrap();
        valid_ekpubhash_prefix("0d3f").unwrap();
        valid_ekpubhash_prefix(H).unwrap();
        assert!(valid_ekpubhash_prefix("xyz").is_err());
        assert!(valid_ekpubhash_prefix(&format!("{H}0")).is_err());
    }

    #[test]
    fn record_paths_are_content_addressed() {
        let store = Store::new(Path::new("/state"));
        let dir = store.record_dir(H).unwrap();
        assert_eq!(
            dir,
            Path::new("/state/db/enrolldb.git/ekpubhash")
                .join(&H[..2])
                .join(&H[..6])
                .join(&H[..32])
        );
        assert_eq!(dir.file_name().unwrap().to_str().unwrap(), &H[..32]);
    }

    #[test]
    fn halfhash_is_sixteen_chars() {
        assert_eq!(halfhash(H), "0d3fe10000000000");
    }

    #[test]
    fn prefix_search_walks_the_hierarchy() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path());
        let a = store.record_dir(H).unwrap();
        let other = format!("0e{}", &H[2..]);
        let b = store.record_dir(&other).unwrap();
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        assert_eq!(store.matching_records("").unwrap().len(), 2);
        assert_eq!(store.matching_records("0d").unwrap(), vec![a.clone()]);
        assert_eq!(store.matching_records("0d3fe1").unwrap(), vec![a.clone()]);
        assert_eq!(store.matching_records("0e").unwrap(), vec![b]);
        assert!(store.matching_records("ff").unwrap().is_empty());
        // Beyond 32 characters only the directory-selecting part counts.
        assert_eq!(store.matching_records(H).unwrap(), vec![a]);
    }

    #[test]
    fn read_trimmed_tolerates_trailing_newlines() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("hostname");
        fs::write(&p, "host1.example.com\n").unwrap();
        assert_eq!(read_trimmed(&p).unwrap(), "host1.example.com");
        fs::write(&p, "host1.example.com").unwrap();
        assert_eq!(read_trimmed(&p).unwrap(), "host1.example.com");
    }
}
