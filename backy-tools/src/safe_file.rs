//! Atomic file replacement: write to a sibling temp file in the same
//! directory, fsync, then rename over the target. Used for revision info
//! files, chunk map files and chunk payloads so a crash never leaves a
//! half-written file at the real path.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, Result};

/// Write `data` to `path` atomically with the given file mode.
pub fn write_atomic_mode(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .context("target path has no parent directory")?;
    let tmp_path = tmp_path_in(dir, path)?;

    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp_path)
            .with_context(|| format!("creating temp file {tmp_path:?}"))?;
        tmp.write_all(data)?;
        tmp.sync_all()?;
    }

    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {tmp_path:?} to {path:?}"))?;

    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }

    Ok(())
}

/// Write `data` to `path` atomically with default (0644) permissions.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    write_atomic_mode(path, data, 0o644)
}

fn tmp_path_in(dir: &Path, target: &Path) -> Result<std::path::PathBuf> {
    let file_name = target
        .file_name()
        .context("target path has no file name")?
        .to_string_lossy();
    let pid = std::process::id();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    Ok(dir.join(format!(".{file_name}.tmp.{pid}.{nanos}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_creates_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.rev");
        write_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn write_atomic_mode_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.lzo");
        write_atomic_mode(&path, b"data", 0o440).unwrap();
        let perm = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(perm, 0o440);
    }
}
