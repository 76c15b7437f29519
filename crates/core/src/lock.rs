//! Advisory lock files and atomic writes for descriptor mutation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ManagerError, Result};

const LOCK_WAIT: Duration = Duration::from_secs(10);
const STALE_AFTER: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_millis(20);

/// Distinguishes locks taken by the same process.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Contents of a `.lock` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    token: u64,
    acquired_at: String,
}

/// Exclusive hold on `<target>.lock`, released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    /// Record written on acquisition. Drop leaves a lock file alone once it
    /// no longer holds this record.
    record: Option<Vec<u8>>,
}

impl FileLock {
    /// Waits for the lock with the default timeout and staleness bound.
    pub fn acquire(target: &Path) -> Result<Self> {
        Self::acquire_with(target, LOCK_WAIT, STALE_AFTER)
    }

    /// Waits up to `wait` for the lock. A lock file older than `stale_after`
    /// is treated as abandoned and reclaimed under a guard file.
    pub fn acquire_with(target: &Path, wait: Duration, stale_after: Duration) -> Result<Self> {
        let path = lock_path(target);
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
                        acquired_at: Utc::now().to_rfc3339(),
                    };
                    let record = serde_json::to_vec(&record)
                        .ok()
                        .filter(|contents| file.write_all(contents).is_ok());
                    debug!(lock = %path.display(), "Acquired lock.");
                    return Ok(Self { path, record });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, stale_after) && reclaim_stale(&path, stale_after) {
                        continue;
                    }
                    if started.elapsed() >= wait {
                        return Err(ManagerError::descriptor(
                            target,
                            format!("timed out waiting for lock {}", path.display()),
                        ));
                    }
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(err) => return Err(ManagerError::io(&path, err)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(record) = &self.record
            && fs::read(&self.path).ok().as_ref() != Some(record)
        {
            warn!(lock = %self.path.display(), "Lock was reclaimed by another holder.");
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            debug!(lock = %self.path.display(), error = %err, "Failed to remove lock file.");
        }
    }
}

/// `<target>.lock`.
pub fn lock_path(target: &Path) -> PathBuf {
    sibling_with_suffix(target, ".lock")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Removes the stale lock file `path` while holding `<path>.reclaim`.
///
/// Staleness is checked again under the guard, so a lock created by a waiter
/// that reclaimed first is never removed. Returns true when the file was
/// removed; false sends the caller back to waiting.
fn reclaim_stale(path: &Path, stale_after: Duration) -> bool {
    let guard = sibling_with_suffix(path, ".reclaim");
    match OpenOptions::new().write(true).create_new(true).open(&guard) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            // A guard outlives a reclaim only when its owner died mid-way.
            if is_stale(&guard, stale_after) {
                let _ = fs::remove_file(&guard);
            }
            return false;
        }
        Err(err) => {
            debug!(guard = %guard.display(), error = %err, "Failed to create reclaim guard.");
            return false;
        }
    }

    let removed = is_stale(path, stale_after) && fs::remove_file(path).is_ok();
    if removed {
        warn!(lock = %path.display(), "Removed stale lock file.");
    }
    if let Err(err) = fs::remove_file(&guard) {
        debug!(guard = %guard.display(), error = %err, "Failed to remove reclaim guard.");
    }
    removed
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= stale_after)
}

/// Replaces `path` with `contents` through a temp file in the same directory,
/// so readers see either the old or the new file and never a partial one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|err| ManagerError::io(dir, err))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| ManagerError::io(dir, err))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| ManagerError::io(tmp.path(), err))?;
    tmp.persist(path)
        .map_err(|err| ManagerError::io(path, err.error))?;
    Ok(())
}
