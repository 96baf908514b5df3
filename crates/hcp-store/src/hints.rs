// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reenrollment scheduling hints.
//!
//! A record may carry a `hint-reenroll-<YYYYMMDDhhmmss>` file naming its
//! reenrollment deadline. The scanner lists them across the whole tree,
//! drops scratch variants (anything with a dot after the stamp prefix),
//! and sorts by stamp so the earliest deadlines come first.

use crate::{Store, StoreError, read_trimmed};
use std::path::PathBuf;
use walkdir::WalkDir;

const HINT_PREFIX: &str = "hint-reenroll-";

/// One scheduling hint found in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReenrollHint {
    /// The record directory carrying the hint.
    pub record_dir: PathBuf,
    /// The record's ekpubhash.
    pub ekpubhash: String,
    /// The `YYYYMMDDhhmmss` stamp from the hint filename.
    pub stamp: String,
}

/// Scan the whole record tree for reenrollment hints, sorted by stamp.
pub fn scan_hints(store: &Store) -> Result<Vec<ReenrollHint>, StoreError> {
    let mut hints = Vec::new();
    for entry in WalkDir::new(store.record_root())
        .min_depth(4)
        .max_depth(4)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stamp) = name.strip_prefix(HINT_PREFIX) else {
            continue;
        };
        // Dotted variants are scratch files, deliberately excluded.
        if stamp.contains('.') {
            continue;
        }
        let record_dir = entry
            .path()
            .parent()
            .expect("hint files sit inside record dirs")
            .to_path_buf();
        let ekpubhash = read_trimmed(&record_dir.join("ekpubhash"))?;
        hints.push(ReenrollHint {
            record_dir,
            ekpubhash,
            stamp: stamp.to_string(),
        });
    }
    hints.sort_by(|a, b| a.stamp.cmp(&b.stamp));
    Ok(hints)
}

/// The prefix of `hints` (already stamp-sorted) that is due at
/// `now_stamp` — everything up to the first future deadline.
pub fn due_hints(hints: &[ReenrollHint], now_stamp: &str) -> Vec<ReenrollHint> {
    hints
        .iter()
        .take_while(|h| h.stamp.as_str() <= now_stamp)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const H1: &str = "0d3fe10000000000aaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbcccccccccccccccc";
    const H2: &str = "1caffe0000000000aaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbcccccccccccccccc";

    fn record_with_hint(store: &Store, h: &str, stamp: &str) -> PathBuf {
        let dir = store.record_dir(h).unwrap();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ekpubhash"), h).unwrap();
        fs::write(dir.join(format!("{HINT_PREFIX}{stamp}")), "").unwrap();
        dir
    }

    #[test]
    fn scans_sorted_and_skips_scratch_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path());
        let d1 = record_with_hint(&store, H1, "20300101000000");
        record_with_hint(&store, H2, "20200101000000");
        // A scratch file next to a real hint must be ignored.
        fs::write(d1.join(format!("{HINT_PREFIX}20100101000000.tmp")), "").unwrap();

        let hints = scan_hints(&store).unwrap();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].ekpubhash, H2);
        assert_eq!(hints[0].stamp, "20200101000000");
        assert_eq!(hints[1].ekpubhash, H1);
    }

    #[test]
    fn due_selection_stops_at_the_first_future_stamp() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path());
        record_with_hint(&store, H1, "20300101000000");
        record_with_hint(&store, H2, "20200101000000");

        let hints = scan_hints(&store).unwrap();
        let due = due_hints(&hints, "20250101000000");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].ekpubhash, H2);

        assert!(due_hints(&hints, "20100101000000").is_empty());
        assert_eq!(due_hints(&hints, "20990101000000").len(), 2);
    }
}
