// SPDX-License-Identifier: MIT OR Apache-2.0
//! The repository lock.
//!
//! Directory creation is the mutex: atomic on every filesystem we care
//! about, zero dependencies, and when something catastrophic happens the
//! stale lock is plainly visible to an operator. A crash between create
//! and remove leaves the lock in place deliberately.

use crate::Store;
use std::io;
use std::thread;
use std::time::Duration;

/// How long to sleep between lock attempts.
const LOCK_RETRY: Duration = Duration::from_millis(200);

impl Store {
    /// Take the repository lock, retrying every 200 ms until it is ours.
    pub fn lock(&self) -> io::Result<()> {
        loop {
            match std::fs::create_dir(self.lock_path()) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the repository lock.
    pub fn unlock(&self) -> io::Result<()> {
        std::fs::remove_dir(self.lock_path())
    }
}
