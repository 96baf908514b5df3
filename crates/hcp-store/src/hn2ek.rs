// SPDX-License-Identifier: MIT OR Apache-2.0
//! The hostname → ekpubhash index.
//!
//! The record tree is inherently indexed by ekpubhash; `find` wants the
//! other direction. Rather than walking the tree per lookup, a single
//! JSON array at the repository root associates the two, maintained
//! alongside every mutation and regenerable from scratch by the janitor.
//! The caller holds the repository lock across read-modify-write; there
//! is no cached state, every interaction goes to the filesystem.

use crate::{Store, StoreError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;

/// One index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    /// Hostname the assets were issued for.
    pub hostname: String,
    /// The TPM's endorsement-key hash.
    pub ekpubhash: String,
}

impl Store {
    /// Read the index.
    pub fn hn2ek_read(&self) -> Result<Vec<HostEntry>, StoreError> {
        let text = fs::read_to_string(self.hn2ek_path())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the index, sorted by hostname.
    pub fn hn2ek_write(&self, mut entries: Vec<HostEntry>) -> Result<(), StoreError> {
        entries.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        fs::write(self.hn2ek_path(), serde_json::to_string(&entries)?)?;
        Ok(())
    }

    /// Insert an entry (read-modify-write).
    pub fn hn2ek_add(&self, hostname: &str, ekpubhash: &str) -> Result<(), StoreError> {
        let mut entries = self.hn2ek_read()?;
        entries.push(HostEntry {
            hostname: hostname.to_string(),
            ekpubhash: ekpubhash.to_string(),
        });
        self.hn2ek_write(entries)
    }

    /// Remove an exact entry (read-modify-write).
    pub fn hn2ek_delete(&self, hostname: &str, ekpubhash: &str) -> Result<(), StoreError> {
        let entries = self
            .hn2ek_read()?
            .into_iter()
            .filter(|e| !(e.hostname == hostname && e.ekpubhash == ekpubhash))
            .collect();
        self.hn2ek_write(entries)
    }
}

/// Filter entries whose hostname matches the regex — substring search,
/// not fullmatch.
pub fn filter_by_hostname(entries: &[HostEntry], re: &Regex) -> Vec<HostEntry> {
    entries
        .iter()
        .filter(|e| re.is_match(&e.hostname))
        .cloned()
        .collect()
}
