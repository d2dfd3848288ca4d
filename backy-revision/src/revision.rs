//! A single revision's metadata: the `<uuid>.rev` YAML sidecar file plus
//! the in-memory bookkeeping the repository needs to order and select
//! revisions.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use backy_api_types::{BackyError, Trust};
use backy_tools::safe_file;

/// On-disk shape of a `<uuid>.rev` file. Field order matches what a reader
/// skimming the YAML expects: identity, lineage, then mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub uuid: String,
    pub timestamp: DateTime<Utc>,
    pub parent: Option<String>,
    #[serde(default)]
    pub stats: serde_yaml::Mapping,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub trust: Trust,
    #[serde(default)]
    pub server: String,
    /// Server-synced baseline for local tag edits: the tag set as last
    /// confirmed by the owning peer. `None` for revisions that have never
    /// been synced (freshly created locally, or written before sync
    /// existed). Compared against `tags` to find pending push work.
    #[serde(default)]
    pub orig_tags: Option<BTreeSet<String>>,
}

/// A revision plus the path it was loaded from or will be written to.
#[derive(Debug, Clone)]
pub struct Revision {
    pub path: PathBuf,
    pub info: RevisionInfo,
}

impl Revision {
    /// A brand new, local revision with a fresh uuid and `timestamp = now`.
    pub fn new(repo_dir: &Path, parent: Option<String>) -> Self {
        let uuid = Uuid::new_v4().to_string();
        let info = RevisionInfo {
            uuid: uuid.clone(),
            timestamp: Utc::now(),
            parent,
            stats: serde_yaml::Mapping::new(),
            tags: BTreeSet::new(),
            trust: Trust::Trusted,
            server: String::new(),
            orig_tags: None,
        };
        Revision {
            path: repo_dir.join(format!("{uuid}.rev")),
            info,
        }
    }

    /// Build a revision from metadata fetched off a peer during a pull —
    /// the path is derived the same way `new` derives it, from the uuid
    /// already carried in `info`.
    pub fn from_info(repo_dir: &Path, info: RevisionInfo) -> Self {
        Revision {
            path: repo_dir.join(format!("{}.rev", info.uuid)),
            info,
        }
    }

    pub fn load(path: PathBuf) -> Result<Self, BackyError> {
        let raw = fs::read(&path)?;
        let info: RevisionInfo = serde_yaml::from_slice(&raw)
            .map_err(|err| BackyError::Other(anyhow::anyhow!("parsing {path:?}: {err}")))?;
        Ok(Revision { path, info })
    }

    pub fn uuid(&self) -> &str {
        &self.info.uuid
    }

    pub fn is_local(&self) -> bool {
        self.info.server.is_empty()
    }

    /// True if this revision's tags diverge from the last server-confirmed
    /// baseline and so need to be pushed.
    pub fn has_pending_tag_changes(&self) -> bool {
        match &self.info.orig_tags {
            Some(orig) => *orig != self.info.tags,
            None => !self.info.tags.is_empty(),
        }
    }

    /// Mapping-file path for this revision's chunked data, as a sibling of
    /// the `.rev` file.
    pub fn data_path(&self) -> PathBuf {
        self.path.with_extension("")
    }

    /// Write the `.rev` file atomically and set it read-only (0440) — a
    /// revision is only writable for the duration of a mutating method.
    pub fn write(&self) -> Result<(), BackyError> {
        let yaml = serde_yaml::to_string(&self.info)
            .map_err(|err| BackyError::Other(anyhow::anyhow!("serializing revision: {err}")))?;
        safe_file::write_atomic_mode(&self.path, yaml.as_bytes(), 0o440)
            .map_err(BackyError::Other)?;
        Ok(())
    }

    /// Temporarily relax permissions to 0640 so a mutation can be written,
    /// then restore 0440. Mirrors the original's `writable()`/`readonly()`
    /// context manager pair.
    pub fn writable(&self) -> Result<(), BackyError> {
        if self.path.exists() {
            let mut perm = fs::metadata(&self.path)?.permissions();
            perm.set_mode(0o640);
            fs::set_permissions(&self.path, perm)?;
        }
        Ok(())
    }

    pub fn readonly(&self) -> Result<(), BackyError> {
        if self.path.exists() {
            let mut perm = fs::metadata(&self.path)?.permissions();
            perm.set_mode(0o440);
            fs::set_permissions(&self.path, perm)?;
        }
        Ok(())
    }

    pub fn distrust(&mut self) {
        self.info.trust = Trust::Distrusted;
    }

    pub fn verify(&mut self) {
        self.info.trust = Trust::Verified;
    }

    /// A revision counts as "clean" once its backup pipeline has recorded a
    /// `duration` stat; revisions left without one (crash mid-backup) are
    /// reaped by the next `Repository::clean_incomplete` pass.
    pub fn is_clean(&self) -> bool {
        self.info.stats.contains_key("duration")
    }

    pub fn duration(&self) -> Option<f64> {
        self.info.stats.get("duration").and_then(|v| v.as_f64())
    }

    /// Remove this revision's `.rev` file and its chunk mapping sidecar.
    /// Does not touch the chunk store itself — a later `purge` reclaims
    /// any chunks this revision was the last referent of.
    pub fn remove(&self) -> Result<(), BackyError> {
        let data_path = self.data_path();
        if data_path.exists() {
            fs::remove_file(&data_path)?;
        }
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.tags.insert("daily".to_string());
        rev.write().unwrap();

        let loaded = Revision::load(rev.path.clone()).unwrap();
        assert_eq!(loaded.uuid(), rev.uuid());
        assert!(loaded.info.tags.contains("daily"));
    }

    #[test]
    fn written_rev_file_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let rev = Revision::new(dir.path(), None);
        rev.write().unwrap();
        let mode = fs::metadata(&rev.path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o440);
    }

    #[test]
    fn distrust_then_verify_updates_trust() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.distrust();
        assert_eq!(rev.info.trust, Trust::Distrusted);
        rev.verify();
        assert_eq!(rev.info.trust, Trust::Verified);
    }

    #[test]
    fn fresh_revision_is_local() {
        let dir = tempfile::tempdir().unwrap();
        let rev = Revision::new(dir.path(), None);
        assert!(rev.is_local());
    }
}
