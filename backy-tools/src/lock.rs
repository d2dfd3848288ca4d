//! File-based advisory locks.
//!
//! Exclusive acquisition is non-blocking (`try_exclusive_lock`): a held
//! lock fails the call immediately rather than waiting. Shared acquisition
//! blocks until available. Locks are not reentrant — a locked method that
//! needs a lock it already holds must be given an escape hatch by its
//! caller (see `skip_lock` usage in `backy-revision`).

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use backy_api_types::BackyError;

/// A held lock; the underlying fd (and thus the OS-level flock) is released
/// on drop, including on process crash.
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open_lockfile(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).read(true).write(true).open(path)
}

/// Acquire an exclusive lock on `path`. Fails immediately (does not block)
/// if another process already holds it.
pub fn try_exclusive_lock(path: &Path) -> Result<LockGuard, BackyError> {
    let file = open_lockfile(path)?;
    file.try_lock_exclusive().map_err(|_| {
        BackyError::LockContention(path.display().to_string())
    })?;
    Ok(LockGuard { file })
}

/// Acquire a shared lock on `path`, blocking until available.
pub fn shared_lock(path: &Path) -> Result<LockGuard, BackyError> {
    let file = open_lockfile(path)?;
    file.lock_shared()
        .map_err(|err| BackyError::Other(anyhow::anyhow!("shared lock on {path:?} failed: {err}")))?;
    Ok(LockGuard { file })
}

/// Try to upgrade acquisition semantics for the exclusive `.purge` lock used
/// during garbage collection; non-blocking like `try_exclusive_lock`.
pub fn try_exclusive_purge_lock(repo_dir: &Path) -> Result<LockGuard, BackyError> {
    try_exclusive_lock(&repo_dir.join(".purge"))
}

/// Shared `.purge` lock held during backup/verify/restore so a concurrent
/// GC can't delete chunks out from under a reader.
pub fn shared_purge_lock(repo_dir: &Path) -> Result<LockGuard, BackyError> {
    shared_lock(&repo_dir.join(".purge"))
}

/// Exclusive `.backup` lock held during backup, tag edits, expire, distrust,
/// push and pull.
pub fn try_exclusive_backup_lock(repo_dir: &Path) -> Result<LockGuard, BackyError> {
    try_exclusive_lock(&repo_dir.join(".backup"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_is_non_reentrant_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".backup");
        let _first = try_exclusive_lock(&path).unwrap();
        assert!(try_exclusive_lock(&path).is_err());
    }

    #[test]
    fn lock_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".backup");
        {
            let _guard = try_exclusive_lock(&path).unwrap();
        }
        let _again = try_exclusive_lock(&path).unwrap();
    }
}
