// SPDX-License-Identifier: MIT OR Apache-2.0
//! Touchfiles and timestamp hints.

use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

/// Create (or freshen) a touchfile, creating parent directories first.
pub fn touch(path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.is_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Render a timestamp as `YYYYMMDDhhmmss` — one-second granularity, and
/// lexicographic order equals chronological order, so these strings sort
/// usefully inside filenames.
pub fn datetime2hint(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S").to_string()
}
