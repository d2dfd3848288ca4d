//! Push/pull metadata reconciliation between neighbours backing up the
//! same source. Both directions operate directly on `Revision` files
//! rather than through `Repository`'s locking mutators: the caller already
//! holds the job's exclusive backup lock for the duration of the sync, and
//! flock is not reentrant within a process.

use std::collections::BTreeSet;

use log::{debug, warn};

use backy_revision::{Repository, Revision};

use crate::client::Peer;

/// For every revision this repository tracks under a configured peer's
/// name, push any local tag edits back to that peer and adopt the result
/// as the new sync baseline. A revision whose tags were pushed down to
/// empty is removed locally and the peer is asked to purge it.
pub fn push_metadata(repo: &mut Repository, peers: &[Peer], job: &str) -> usize {
    let mut errors = 0;

    for peer in peers {
        let pending: Vec<usize> = repo
            .history()
            .iter()
            .enumerate()
            .filter(|(_, rev)| rev.info.server == peer.name && rev.has_pending_tag_changes())
            .map(|(idx, _)| idx)
            .collect();
        if pending.is_empty() {
            continue;
        }

        let mut purge_required = false;
        for idx in pending {
            let uuid = repo.revision(idx).uuid().to_string();
            let old_tags = repo
                .revision(idx)
                .info
                .orig_tags
                .clone()
                .unwrap_or_default();
            let new_tags = repo.revision(idx).info.tags.clone();

            match peer.client.put_tags(job, &uuid, &old_tags, &new_tags, true) {
                Ok(()) if new_tags.is_empty() => {
                    if let Err(err) = repo.revision(idx).remove() {
                        warn!("push {job}: removing emptied revision {uuid}: {err}");
                        errors += 1;
                    }
                    purge_required = true;
                }
                Ok(()) => {
                    let rev = repo.revision_mut(idx);
                    rev.info.orig_tags = Some(new_tags);
                    if let Err(err) = rev
                        .writable()
                        .and_then(|_| rev.write())
                        .and_then(|_| rev.readonly())
                    {
                        warn!("push {job}: recording pushed tags for {uuid}: {err}");
                        errors += 1;
                    }
                }
                Err(err) => {
                    warn!("push {job}: pushing tags for {uuid} to {}: {err}", peer.name);
                    errors += 1;
                }
            }
        }

        if purge_required {
            if let Err(err) = peer.client.run_purge(job) {
                warn!("push {job}: requesting purge on {}: {err}", peer.name);
                errors += 1;
            }
        }
    }

    if let Err(err) = repo.scan() {
        warn!("push {job}: rescanning after push: {err}");
        errors += 1;
    }
    debug!("push-end job={job} errors={errors}");
    errors
}

/// Reconcile this repository's view of every configured peer's history:
/// fetch each peer's clean revisions, drop local copies the peer no
/// longer has, and write or refresh everything the peer reports that we
/// don't already have an up-to-date copy of. Revisions owned by a peer no
/// longer in `peers` at all are dropped outright first.
pub fn pull_metadata(repo: &mut Repository, peers: &[Peer], job: &str) -> usize {
    let mut errors = 0;
    let known: BTreeSet<&str> = peers.iter().map(|p| p.name.as_str()).collect();

    let orphaned: Vec<String> = repo
        .history()
        .iter()
        .filter(|rev| !rev.info.server.is_empty() && !known.contains(rev.info.server.as_str()))
        .map(|rev| rev.uuid().to_string())
        .collect();
    for uuid in &orphaned {
        if let Some(rev) = repo.find_by_uuid(uuid) {
            if let Err(err) = rev.remove() {
                warn!("pull {job}: dropping revision {uuid} of de-configured peer: {err}");
                errors += 1;
            }
        }
    }

    for peer in peers {
        if let Err(err) = peer.client.touch_backup(job) {
            warn!("pull {job}: touching {}: {err}", peer.name);
            errors += 1;
            continue;
        }

        let remote = match peer.client.get_revs(job, true) {
            Ok(revs) => revs,
            Err(err) => {
                warn!("pull {job}: fetching revisions from {}: {err}", peer.name);
                errors += 1;
                continue;
            }
        };
        let remote_uuids: BTreeSet<&str> = remote.iter().map(|r| r.uuid.as_str()).collect();

        let stale: Vec<String> = repo
            .history()
            .iter()
            .filter(|rev| rev.info.server == peer.name && !remote_uuids.contains(rev.uuid()))
            .map(|rev| rev.uuid().to_string())
            .collect();
        for uuid in &stale {
            if let Some(rev) = repo.find_by_uuid(uuid) {
                if let Err(err) = rev.remove() {
                    warn!("pull {job}: removing stale revision {uuid}: {err}");
                    errors += 1;
                }
            }
        }

        for mut info in remote {
            info.server = peer.name.clone();
            let up_to_date = repo.find_by_uuid(&info.uuid).is_some_and(|existing| {
                existing.info.tags == info.tags
                    && existing.info.trust == info.trust
                    && existing.info.parent == info.parent
            });
            if up_to_date {
                continue;
            }
            let rev = Revision::from_info(repo.dir(), info);
            if let Err(err) = rev
                .writable()
                .and_then(|_| rev.write())
                .and_then(|_| rev.readonly())
            {
                warn!(
                    "pull {job}: writing revision {} from {}: {err}",
                    rev.uuid(),
                    peer.name
                );
                errors += 1;
            }
        }
    }

    if let Err(err) = repo.scan() {
        warn!("pull {job}: rescanning after pull: {err}");
        errors += 1;
    }
    debug!("pull-end job={job} errors={errors}");
    errors
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use backy_api_types::{BackyError, StatusDict, Trust};
    use backy_revision::RevisionInfo;

    use super::*;
    use crate::client::PeerClient;

    struct FakePeer {
        revs: Mutex<Vec<RevisionInfo>>,
        put_calls: Mutex<Vec<(String, BTreeSet<String>)>>,
        purged: Mutex<bool>,
    }

    impl PeerClient for FakePeer {
        fn fetch_status(&self, _job_filter: &str) -> Result<Vec<StatusDict>, BackyError> {
            Ok(Vec::new())
        }

        fn touch_backup(&self, _job: &str) -> Result<(), BackyError> {
            Ok(())
        }

        fn get_revs(&self, _job: &str, _only_clean: bool) -> Result<Vec<RevisionInfo>, BackyError> {
            Ok(self.revs.lock().unwrap().clone())
        }

        fn put_tags(
            &self,
            _job: &str,
            spec: &str,
            _old_tags: &BTreeSet<String>,
            new_tags: &BTreeSet<String>,
            _autoremove: bool,
        ) -> Result<(), BackyError> {
            self.put_calls
                .lock()
                .unwrap()
                .push((spec.to_string(), new_tags.clone()));
            Ok(())
        }

        fn run_purge(&self, _job: &str) -> Result<(), BackyError> {
            *self.purged.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn pull_adds_new_remote_revision() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::open(dir.path()).unwrap();

        let remote_info = RevisionInfo {
            uuid: "11111111-1111-1111-1111-111111111111".to_string(),
            timestamp: chrono::Utc::now(),
            parent: None,
            stats: serde_yaml::Mapping::new(),
            tags: ["daily".to_string()].into_iter().collect(),
            trust: Trust::Trusted,
            server: String::new(),
            orig_tags: None,
        };
        let peer = Peer {
            name: "peer-a".to_string(),
            client: Box::new(FakePeer {
                revs: Mutex::new(vec![remote_info]),
                put_calls: Mutex::new(Vec::new()),
                purged: Mutex::new(false),
            }),
        };

        let errors = pull_metadata(&mut repo, &[peer], "job");
        assert_eq!(errors, 0);
        assert_eq!(repo.history().len(), 1);
        assert_eq!(repo.history()[0].info.server, "peer-a");
    }

    #[test]
    fn pull_drops_revision_no_longer_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.server = "peer-a".to_string();
        rev.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        assert_eq!(repo.history().len(), 1);

        let peer = Peer {
            name: "peer-a".to_string(),
            client: Box::new(FakePeer {
                revs: Mutex::new(Vec::new()),
                put_calls: Mutex::new(Vec::new()),
                purged: Mutex::new(false),
            }),
        };
        pull_metadata(&mut repo, &[peer], "job");
        assert!(repo.history().is_empty());
    }

    #[test]
    fn pull_drops_revisions_of_removed_peer() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.server = "peer-gone".to_string();
        rev.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        pull_metadata(&mut repo, &[], "job");
        assert!(repo.history().is_empty());
    }

    #[test]
    fn push_sends_pending_tag_change_and_updates_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.server = "peer-a".to_string();
        rev.info.orig_tags = Some(["daily".to_string()].into_iter().collect());
        rev.info.tags = ["weekly".to_string()].into_iter().collect();
        rev.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let fake = FakePeer {
            revs: Mutex::new(Vec::new()),
            put_calls: Mutex::new(Vec::new()),
            purged: Mutex::new(false),
        };
        let peer = Peer {
            name: "peer-a".to_string(),
            client: Box::new(fake),
        };

        let errors = push_metadata(&mut repo, &[peer], "job");
        assert_eq!(errors, 0);
        assert!(!repo.history()[0].has_pending_tag_changes());
    }

    #[test]
    fn push_removes_revision_emptied_of_tags() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = Revision::new(dir.path(), None);
        rev.info.server = "peer-a".to_string();
        rev.info.orig_tags = Some(["daily".to_string()].into_iter().collect());
        rev.info.tags = BTreeSet::new();
        rev.write().unwrap();

        let mut repo = Repository::open(dir.path()).unwrap();
        let peer = Peer {
            name: "peer-a".to_string(),
            client: Box::new(FakePeer {
                revs: Mutex::new(Vec::new()),
                put_calls: Mutex::new(Vec::new()),
                purged: Mutex::new(false),
            }),
        };
        push_metadata(&mut repo, &[peer], "job");
        assert!(repo.history().is_empty());
    }
}
