//! The revision graph for one repository: scanning `<uuid>.rev` files into
//! an ordered history, evaluating selection expressions against it, and the
//! mutating operations (`forget`, `distrust`, `tags`) that drive retention
//! and the admin API.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;

use backy_api_types::{is_manual_tag, BackyError, Trust};
use backy_tools::lock;

use crate::revision::Revision;
use crate::selection;

/// `tags()` mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagAction {
    Set,
    Add,
    Remove,
}

/// The ordered history of one repository's revisions, plus the directory
/// they live in. Revisions are owned here, not shared by reference, per
/// the design note on cyclic references — callers look them up by index.
pub struct Repository {
    dir: PathBuf,
    history: Vec<Revision>,
}

impl Repository {
    /// Open (creating the directory if necessary) and perform an initial
    /// scan.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BackyError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut repo = Repository {
            dir,
            history: Vec::new(),
        };
        repo.scan()?;
        Ok(repo)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history(&self) -> &[Revision] {
        &self.history
    }

    pub fn revision(&self, idx: usize) -> &Revision {
        &self.history[idx]
    }

    pub fn revision_mut(&mut self, idx: usize) -> &mut Revision {
        &mut self.history[idx]
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Option<&Revision> {
        self.history.iter().find(|r| r.uuid() == uuid)
    }

    /// Re-read every `<uuid>.rev` file in the repository directory,
    /// skipping symlinks (used as human-readable pointers), silently
    /// dropping a duplicate uuid after the first one seen, and sorting the
    /// result ascending by timestamp.
    pub fn scan(&mut self) -> Result<(), BackyError> {
        let mut seen_uuids = HashSet::new();
        let mut history = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("rev") {
                continue;
            }
            let meta = fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                continue;
            }
            let rev = match Revision::load(path.clone()) {
                Ok(rev) => rev,
                Err(err) => {
                    warn!("skipping unreadable revision file {path:?}: {err}");
                    continue;
                }
            };
            if !seen_uuids.insert(rev.uuid().to_string()) {
                continue;
            }
            history.push(rev);
        }

        history.sort_by_key(|r| r.info.timestamp);
        self.history = history;
        Ok(())
    }

    /// The most recent timestamp each tag was carried by, across history.
    pub fn last_by_tag(&self) -> HashMap<String, DateTime<Utc>> {
        let mut last: HashMap<String, DateTime<Utc>> = HashMap::new();
        for rev in &self.history {
            for tag in &rev.info.tags {
                last.entry(tag.clone())
                    .and_modify(|t| {
                        if rev.info.timestamp > *t {
                            *t = rev.info.timestamp;
                        }
                    })
                    .or_insert(rev.info.timestamp);
            }
        }
        last
    }

    /// The timestamp of the most recent clean (`duration`-stat-bearing)
    /// local revision, used to compute SLA overdue-ness.
    pub fn last_clean_backup(&self) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .rev()
            .find(|r| r.is_clean())
            .map(|r| r.info.timestamp)
    }

    /// Remove any local revision lacking a `duration` stat: leftovers from
    /// a backup that was interrupted mid-flight. Run at the start of every
    /// backup before a parent is selected.
    pub fn clean_incomplete(&mut self) -> Result<Vec<String>, BackyError> {
        let mut removed = Vec::new();
        for rev in &self.history {
            if rev.is_local() && !rev.is_clean() {
                rev.remove()?;
                removed.push(rev.uuid().to_string());
            }
        }
        if !removed.is_empty() {
            self.scan()?;
        }
        Ok(removed)
    }

    /// Newest local revision with a valid parent chain, usable as the
    /// parent of a differential backup; `None` means a full backup.
    pub fn newest_local(&self) -> Option<&Revision> {
        self.history.iter().rev().find(|r| r.is_local())
    }

    /// Every chunk hash referenced by any local revision's chunk map, used
    /// as the `used` set for a garbage collection pass.
    pub fn referenced_hashes(&self) -> Result<HashSet<String>, BackyError> {
        let mut hashes = HashSet::new();
        for rev in self.history.iter().filter(|r| r.is_local()) {
            let path = rev.data_path();
            if !path.exists() {
                continue;
            }
            let raw = fs::read(&path)?;
            if raw.len() < 2 || &raw[0..2] != b"{\"" {
                continue;
            }
            #[derive(serde::Deserialize)]
            struct ChunkMapFile {
                mapping: HashMap<String, String>,
            }
            let parsed: ChunkMapFile = serde_json::from_slice(&raw)
                .map_err(|err| BackyError::Backend(format!("reading {path:?}: {err}")))?;
            hashes.extend(parsed.mapping.into_values());
        }
        Ok(hashes)
    }

    /// True if any local revision in history is currently distrusted —
    /// drives the chunk store's force-writes latch.
    pub fn any_local_distrusted(&self) -> bool {
        self.history
            .iter()
            .any(|r| r.is_local() && r.info.trust == Trust::Distrusted)
    }

    pub fn find_revisions(&self, spec: &str) -> Result<Vec<usize>, BackyError> {
        selection::evaluate(spec, &self.history)
    }

    pub fn select(&self, spec: &str) -> Result<Vec<&Revision>, BackyError> {
        Ok(self
            .find_revisions(spec)?
            .into_iter()
            .map(|i| &self.history[i])
            .collect())
    }

    /// Remove the selected revisions' info and chunk-map files. Requires
    /// the repository's exclusive backup lock.
    pub fn forget(&mut self, spec: &str) -> Result<Vec<String>, BackyError> {
        let _lock = lock::try_exclusive_backup_lock(&self.dir)?;
        self.forget_impl(spec)
    }

    fn forget_impl(&mut self, spec: &str) -> Result<Vec<String>, BackyError> {
        let idxs = self.find_revisions(spec)?;
        let mut removed = Vec::with_capacity(idxs.len());
        for idx in idxs {
            let rev = &self.history[idx];
            rev.remove()?;
            removed.push(rev.uuid().to_string());
        }
        self.scan()?;
        Ok(removed)
    }

    /// Mark the selected revisions DISTRUSTED. Refuses outright if any
    /// selected revision is remote (`server != ""`).
    pub fn distrust(&mut self, spec: &str) -> Result<(), BackyError> {
        let _lock = lock::try_exclusive_backup_lock(&self.dir)?;
        let idxs = self.find_revisions(spec)?;
        for idx in &idxs {
            if !self.history[*idx].is_local() {
                return Err(BackyError::RemoteRevisionModification(format!(
                    "cannot distrust remote revision {}; edit it on {}",
                    self.history[*idx].uuid(),
                    self.history[*idx].info.server
                )));
            }
        }
        for idx in idxs {
            let rev = &mut self.history[idx];
            rev.writable()?;
            rev.distrust();
            rev.write()?;
            rev.readonly()?;
        }
        Ok(())
    }

    /// Mark the selected local revisions VERIFIED.
    pub fn verify(&mut self, spec: &str) -> Result<(), BackyError> {
        let _lock = lock::try_exclusive_backup_lock(&self.dir)?;
        let idxs = self.find_revisions(spec)?;
        for idx in idxs {
            let rev = &mut self.history[idx];
            rev.writable()?;
            rev.verify();
            rev.write()?;
            rev.readonly()?;
        }
        Ok(())
    }

    /// Apply a tag mutation to the selected revisions.
    ///
    /// `expect`, if set, refuses the whole operation (no revision touched)
    /// unless every targeted revision's current tags equal it —
    /// optimistic concurrency for the admin API's tag endpoint.
    /// `schedule_tags` validates non-remove actions against the job's
    /// schedule unless `force` is set; unknown tags are refused.
    #[allow(clippy::too_many_arguments)]
    pub fn tags(
        &mut self,
        action: TagAction,
        spec: &str,
        tags: BTreeSet<String>,
        expect: Option<&BTreeSet<String>>,
        autoremove: bool,
        schedule_tags: Option<&BTreeSet<String>>,
        force: bool,
    ) -> Result<(), BackyError> {
        let _lock = lock::try_exclusive_backup_lock(&self.dir)?;
        let idxs = self.find_revisions(spec)?;

        if action != TagAction::Remove && !force {
            if let Some(schedule_tags) = schedule_tags {
                let unknown: Vec<String> = tags
                    .iter()
                    .filter(|t| !is_manual_tag(t) && !schedule_tags.contains(*t))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(BackyError::UnknownTags(unknown));
                }
            }
        }

        if let Some(expect) = expect {
            for idx in &idxs {
                if &self.history[*idx].info.tags != expect {
                    return Err(BackyError::TagExpectationFailed(
                        self.history[*idx].uuid().to_string(),
                    ));
                }
            }
        }

        let mut to_remove = Vec::new();
        for idx in idxs {
            let rev = &mut self.history[idx];
            match action {
                TagAction::Set => rev.info.tags = tags.clone(),
                TagAction::Add => rev.info.tags.extend(tags.iter().cloned()),
                TagAction::Remove => {
                    for t in &tags {
                        rev.info.tags.remove(t);
                    }
                }
            }
            if autoremove && rev.info.tags.is_empty() {
                to_remove.push(idx);
                continue;
            }
            rev.writable()?;
            rev.write()?;
            rev.readonly()?;
        }
        for idx in to_remove {
            self.history[idx].remove()?;
        }
        self.scan()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_sorts_ascending_and_dedups_uuids() {
        let dir = tempfile::tempdir().unwrap();
        let mut r1 = Revision::new(dir.path(), None);
        r1.info.timestamp = Utc::now() - chrono::Duration::hours(2);
        r1.write().unwrap();
        let mut r2 = Revision::new(dir.path(), None);
        r2.info.timestamp = Utc::now() - chrono::Duration::hours(1);
        r2.write().unwrap();

        // A duplicate uuid written under a second path must be ignored.
        let dup_path = dir.path().join("dup.rev");
        std::fs::write(&dup_path, std::fs::read(&r1.path).unwrap()).unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        assert_eq!(repo.history().len(), 2);
        assert!(repo.history()[0].info.timestamp <= repo.history()[1].info.timestamp);
    }

    #[test]
    fn forget_removes_info_and_data_files() {
        let dir = tempfile::tempdir().unwrap();
        let rev = Revision::new(dir.path(), None);
        rev.write().unwrap();
        std::fs::write(rev.data_path(), b"map").unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let uuid = repo.history()[0].uuid().to_string();
        let removed = repo.forget(&uuid).unwrap();
        assert_eq!(removed, vec![uuid]);
        assert!(repo.history().is_empty());
    }

    #[test]
    fn distrust_refuses_remote_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.server = "peer-a".to_string();
        rev.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let uuid = repo.history()[0].uuid().to_string();
        assert!(repo.distrust(&uuid).is_err());
    }

    #[test]
    fn tags_set_with_matching_expect_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.tags.insert("daily".to_string());
        rev.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let uuid = repo.history()[0].uuid().to_string();
        let expect: BTreeSet<String> = ["daily".to_string()].into_iter().collect();
        let new_tags: BTreeSet<String> = ["weekly".to_string()].into_iter().collect();
        repo.tags(
            TagAction::Set,
            &uuid,
            new_tags.clone(),
            Some(&expect),
            false,
            None,
            true,
        )
        .unwrap();
        assert_eq!(repo.history()[0].info.tags, new_tags);
    }

    #[test]
    fn tags_set_with_stale_expect_fails_and_leaves_revision_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.tags.insert("daily".to_string());
        rev.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let uuid = repo.history()[0].uuid().to_string();
        let stale_expect: BTreeSet<String> = ["weekly".to_string()].into_iter().collect();
        let new_tags: BTreeSet<String> = ["monthly".to_string()].into_iter().collect();
        let err = repo.tags(
            TagAction::Set,
            &uuid,
            new_tags,
            Some(&stale_expect),
            false,
            None,
            true,
        );
        assert!(err.is_err());
        assert!(repo.history()[0].info.tags.contains("daily"));
    }

    #[test]
    fn tags_autoremove_deletes_emptied_revision() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.tags.insert("daily".to_string());
        rev.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let uuid = repo.history()[0].uuid().to_string();
        repo.tags(
            TagAction::Remove,
            &uuid,
            ["daily".to_string()].into_iter().collect(),
            None,
            true,
            None,
            true,
        )
        .unwrap();
        assert!(repo.history().is_empty());
    }

    #[test]
    fn clean_incomplete_reaps_durationless_local_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let incomplete = Revision::new(dir.path(), None);
        incomplete.write().unwrap();
        let mut complete = Revision::new(dir.path(), None);
        complete
            .info
            .stats
            .insert("duration".into(), 12.5.into());
        complete.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let removed = repo.clean_incomplete().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(repo.history().len(), 1);
        assert!(repo.history()[0].is_clean());
    }
}
