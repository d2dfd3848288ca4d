//! One job: a source, its repository (chunk store + revision graph), a
//! retention schedule and the configured peers it replicates against.
//! `run_once` is a single pass through the scheduler state machine
//! (deadline -> neighbour check -> leader monitoring, or deadline ->
//! worker slot -> backup/expire/push/pull -> gc/callback); `run_forever`
//! just loops it, matching the daemon's per-job `Job.run_forever` task.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration, Utc};
use log::{debug, warn};

use backy_api_types::{BackyError, GarbageCollectionStatus, StatusDict};
use backy_chunkstore::ChunkStore;
use backy_peer::{
    job_spread, pull_metadata, push_metadata, JobState, Peer, Scheduler, WorkerPools, WorkerSpeed,
};
use backy_revision::{QuarantineStore, Repository, Revision, Schedule};
use backy_tools::lock;

use crate::config::SourceConfig;
use crate::source::Source;

/// One configured backup target: its source, repository and schedule,
/// plus the scheduling state driving its run loop.
pub struct Job {
    pub name: String,
    pub schedule: Schedule,
    pub source: Box<dyn Source>,
    pub repo: Repository,
    pub store: Arc<ChunkStore>,
    pub quarantine: QuarantineStore,
    pub peers: Arc<Vec<Peer>>,
    pub scheduler: Scheduler,
    state: Mutex<JobState>,
}

impl Job {
    pub fn open(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        schedule: Schedule,
        source_config: &SourceConfig,
        peers: Arc<Vec<Peer>>,
    ) -> Result<Self, BackyError> {
        let name = name.into();
        let dir = dir.into();

        let repo = Repository::open(&dir)?;
        let store = Arc::new(ChunkStore::open(dir.join("chunks"))?);
        store.set_force_writes(repo.any_local_distrusted());
        store.seed_known(repo.referenced_hashes()?);
        let quarantine = QuarantineStore::open(&dir)?;
        let source = crate::source::from_config(source_config)?;
        let scheduler = Scheduler::new(name.clone());

        Ok(Job {
            name,
            schedule,
            source,
            repo,
            store,
            quarantine,
            peers,
            scheduler,
            state: Mutex::new(JobState::Finished),
        })
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn state_label(&self) -> String {
        self.state.lock().unwrap().to_string()
    }

    fn last_clean_duration(&self) -> Option<f64> {
        self.repo
            .history()
            .iter()
            .rev()
            .find(|r| r.is_clean() && r.is_local())
            .and_then(|r| r.duration())
    }

    /// The job's entry in `GET /v1/status`: SLA overdue-ness, the next
    /// scheduled run, and how far out of sync with its peers it is.
    pub fn status(&self) -> StatusDict {
        let now = Utc::now();
        let clean_local: Vec<&Revision> = self
            .repo
            .history()
            .iter()
            .filter(|r| r.is_clean() && r.is_local())
            .collect();
        let last = clean_local.last().copied();
        let last_time = last.map(|r| r.info.timestamp);
        let last_duration = last.and_then(|r| r.duration());
        let last_tags =
            last.map(|r| r.info.tags.iter().cloned().collect::<Vec<_>>().join(","));

        let max_interval = self.schedule.max_interval().unwrap_or_else(|| Duration::hours(1));
        let spread = job_spread(&self.name, max_interval.num_seconds().max(1));
        let (next_time, next_tags) = self.schedule.next(now, spread, &self.repo);

        let min_interval = self.schedule.min_interval().unwrap_or_else(Duration::zero);
        let sla_overdue = last_time
            .map(|t| (now - t - min_interval * 3 / 2).num_seconds().max(0))
            .unwrap_or(0);

        let manual_tags = last
            .map(|r| {
                r.info
                    .tags
                    .iter()
                    .filter(|t| backy_api_types::is_manual_tag(t))
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();

        let unsynced_revs = self
            .repo
            .history()
            .iter()
            .filter(|r| r.has_pending_tag_changes())
            .count();

        StatusDict {
            job: self.name.clone(),
            sla: sla_overdue == 0,
            sla_overdue,
            status: self.state_label(),
            last_time,
            last_tags,
            last_duration,
            next_time: Some(next_time),
            next_tags: Some(next_tags.into_iter().collect::<Vec<_>>().join(",")),
            manual_tags,
            local_revs: clean_local.len(),
            unsynced_revs,
            problem_reports: self.quarantine.report_ids().to_vec(),
        }
    }

    /// Take a full local backup carrying `tags`, then expire and
    /// reconcile metadata with peers. Runs under the repository's
    /// exclusive `.backup` lock for its whole duration, since
    /// `push_metadata`/`pull_metadata` assume the caller already holds
    /// it and operate on the revision graph without locking themselves.
    pub fn run_backup_cycle(&mut self, tags: HashSet<String>) -> Result<(), BackyError> {
        let dir = self.repo.dir().to_path_buf();
        let _lock = lock::try_exclusive_backup_lock(&dir)?;

        self.repo.clean_incomplete()?;
        let parent = self.repo.newest_local().map(|r| r.uuid().to_string());
        let mut revision = Revision::new(&dir, parent);
        revision.info.tags = tags;
        revision.write()?;

        let outcome = {
            let _purge_guard = lock::shared_purge_lock(&dir)?;
            let started = Instant::now();
            self.source
                .backup(self.store.clone(), &revision)
                .map(|bytes_written| (bytes_written, started.elapsed().as_secs_f64()))
        };

        match outcome {
            Ok((bytes_written, duration)) => {
                revision.writable()?;
                revision
                    .info
                    .stats
                    .insert("duration".into(), duration.into());
                revision
                    .info
                    .stats
                    .insert("bytes_written".into(), (bytes_written as i64).into());
                revision.write()?;
                revision.readonly()?;
            }
            Err(err) => {
                revision.remove()?;
                return Err(err);
            }
        }

        self.repo.scan()?;
        let removed = self.schedule.expire(&mut self.repo)?;
        debug!("expire-complete job={} removed={}", self.name, removed.len());

        push_metadata(&mut self.repo, &self.peers, &self.name);
        pull_metadata(&mut self.repo, &self.peers, &self.name);
        Ok(())
    }

    /// Release source-side resources, then purge every chunk no local
    /// revision references any more. Runs under the exclusive `.purge`
    /// lock so a concurrent backup's reads can't race a deletion.
    pub fn run_gc(&mut self) -> Result<GarbageCollectionStatus, BackyError> {
        self.source.gc()?;
        let dir = self.repo.dir().to_path_buf();
        let _lock = lock::try_exclusive_purge_lock(&dir)?;
        self.repo.scan()?;
        let used = self.repo.referenced_hashes()?;
        self.store.purge(&used)
    }

    /// Invoke the configured post-backup callback, passing the job name
    /// as its sole argument.
    pub fn run_callback(&self, callback: &Path) -> Result<(), BackyError> {
        let status = std::process::Command::new(callback)
            .arg(&self.name)
            .status()?;
        if !status.success() {
            return Err(BackyError::Backend(format!(
                "callback {callback:?} exited with {status}"
            )));
        }
        Ok(())
    }

    /// One pass through the scheduler: wait for the deadline (or an
    /// immediate trigger), check whether a neighbour is already ahead and
    /// has this round covered, and otherwise run the backup pipeline
    /// under a worker-pool permit sized by how fast the job's last clean
    /// run was.
    pub async fn run_once(&mut self, worker_pools: &WorkerPools, job_filter: &str, callback: Option<&Path>) {
        let now = Utc::now();
        let max_interval = self.schedule.max_interval().unwrap_or_else(|| Duration::hours(1));
        let spread = job_spread(&self.name, max_interval.num_seconds().max(1));
        let (scheduled, tags) = self.schedule.next(now, spread, &self.repo);
        let deadline = self.scheduler.next_deadline(scheduled, now);

        self.set_state(JobState::WaitingForDeadline);
        let run_immediately = self.scheduler.wait_for_deadline(deadline).await;

        if !run_immediately {
            self.set_state(JobState::CheckingNeighbours);
            let local_revs = self
                .repo
                .history()
                .iter()
                .filter(|r| r.is_clean() && r.is_local())
                .count();
            let decision = self
                .scheduler
                .check_neighbours(local_revs, job_filter, &self.peers)
                .await;

            if let (Some(leader_name), Some(leader_status)) =
                (decision.leader.clone(), decision.leader_status.clone())
            {
                if let Some(leader) = self.peers.iter().find(|p| p.name == leader_name) {
                    self.set_state(JobState::MonitoringLeader(leader_name.clone()));
                    let leader_finished = self
                        .scheduler
                        .wait_for_leader(leader, job_filter, leader_status, scheduled)
                        .await;
                    if leader_finished {
                        let dir = self.repo.dir().to_path_buf();
                        match lock::try_exclusive_backup_lock(&dir) {
                            Ok(_lock) => {
                                pull_metadata(&mut self.repo, &self.peers, &self.name);
                            }
                            Err(err) => warn!("pull after leader job={}: {err}", self.name),
                        }
                        self.set_state(JobState::Finished);
                        return;
                    }
                }
            }
        }

        let speed = Scheduler::worker_speed(self.last_clean_duration());
        self.set_state(JobState::WaitingForWorkerSlot(speed.to_string()));
        let pool = match speed {
            WorkerSpeed::Fast => &worker_pools.fast,
            WorkerSpeed::Slow => &worker_pools.slow,
        };
        let _permit = pool
            .acquire()
            .await
            .expect("worker pool semaphore is never closed");

        self.set_state(JobState::Running(speed.to_string()));
        // run_backup_cycle/run_gc/run_callback are synchronous, CPU- and
        // I/O-heavy (compression, hashing, disk flushes); block_in_place
        // hands this worker thread's other tasks off to the rest of the
        // multi_thread runtime's pool for the duration, rather than
        // stalling them behind one job's backup.
        let result = tokio::task::block_in_place(|| {
            self.run_backup_cycle(tags)?;
            self.scheduler.record_success();
            if let Err(err) = self.run_gc() {
                warn!("gc failed job={}: {err}", self.name);
            }
            if let Some(callback) = callback {
                if let Err(err) = self.run_callback(callback) {
                    warn!("callback failed job={}: {err}", self.name);
                }
            }
            Ok::<(), BackyError>(())
        });
        match result {
            Ok(()) => self.set_state(JobState::Finished),
            Err(err) => {
                warn!("backup failed job={}: {err}", self.name);
                self.scheduler.record_failure();
                self.set_state(JobState::Failed);
            }
        }
    }

    /// Run `run_once` forever. Each iteration re-derives the next
    /// deadline from the current history, so a manually triggered or
    /// externally pulled revision is picked up on the very next pass.
    pub async fn run_forever(&mut self, worker_pools: &WorkerPools, job_filter: &str, callback: Option<&Path>) {
        loop {
            self.run_once(worker_pools, job_filter, callback).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn schedule() -> Schedule {
        let mut schedule = Schedule::new();
        let mut config = BTreeMap::new();
        config.insert(
            "daily".to_string(),
            backy_revision::ScheduleEntry {
                interval: "1d".to_string(),
                keep: 7,
            },
        );
        schedule.configure(config).unwrap();
        schedule
    }

    fn file_source_config(dir: &tempfile::TempDir) -> SourceConfig {
        let filename = dir.path().join("source.img");
        std::fs::write(&filename, vec![5u8; 4096]).unwrap();
        SourceConfig {
            type_: "file".to_string(),
            filename: Some(filename),
            cow: true,
        }
    }

    #[test]
    fn run_backup_cycle_produces_a_clean_local_revision() {
        let dir = tempfile::tempdir().unwrap();
        let source_config = file_source_config(&dir);
        let mut job = Job::open(
            "test01",
            dir.path().join("repo"),
            schedule(),
            &source_config,
            Arc::new(Vec::new()),
        )
        .unwrap();

        job.run_backup_cycle(["daily".to_string()].into_iter().collect())
            .unwrap();

        assert_eq!(job.repo.history().len(), 1);
        assert!(job.repo.history()[0].is_clean());
        assert!(job.repo.history()[0].info.tags.contains("daily"));
    }

    #[test]
    fn status_reports_sla_met_right_after_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let source_config = file_source_config(&dir);
        let mut job = Job::open(
            "test01",
            dir.path().join("repo"),
            schedule(),
            &source_config,
            Arc::new(Vec::new()),
        )
        .unwrap();
        job.run_backup_cycle(["daily".to_string()].into_iter().collect())
            .unwrap();

        let status = job.status();
        assert!(status.sla);
        assert_eq!(status.sla_overdue, 0);
        assert_eq!(status.local_revs, 1);
    }

    #[test]
    fn run_gc_purges_chunks_of_forgotten_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let source_config = file_source_config(&dir);
        let mut job = Job::open(
            "test01",
            dir.path().join("repo"),
            schedule(),
            &source_config,
            Arc::new(Vec::new()),
        )
        .unwrap();
        job.run_backup_cycle(["daily".to_string()].into_iter().collect())
            .unwrap();
        let uuid = job.repo.history()[0].uuid().to_string();
        job.repo.forget(&uuid).unwrap();

        let status = job.run_gc().unwrap();
        assert!(status.removed_chunks > 0);
    }
}
