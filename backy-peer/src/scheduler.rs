//! The per-job scheduler: a loop that repeatedly computes the next
//! deadline, waits for it (or an immediate trigger), checks whether a
//! neighbour is already ahead and has this covered, and otherwise runs
//! the backup/expiry/gc/sync pipeline itself under a worker-pool permit.
//! Errors feed an exponential backoff that replaces the schedule-derived
//! deadline until a run finally succeeds.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;

use backy_api_types::StatusDict;

use crate::backoff::backoff_seconds;
use crate::client::Peer;
use crate::election::{elect_leader, LeaderDecision};

/// How long the leader-monitoring poll waits between status refreshes.
const LEADER_POLL_INTERVAL: Duration = Duration::from_secs(300);
/// A leader less than this far from its own next run is close enough
/// that we don't bother stepping on it.
const LEADER_GRACE: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSpeed {
    /// Last clean backup took 10 minutes or more (or there is no history
    /// yet) — run under the slow pool's tighter concurrency cap.
    Slow,
    /// Last clean backup finished in under 10 minutes — safe to run
    /// under the fast pool's higher concurrency cap.
    Fast,
}

impl fmt::Display for WorkerSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerSpeed::Slow => "slow",
            WorkerSpeed::Fast => "fast",
        })
    }
}

/// Where a job's scheduler loop currently is, exposed for `backy status`
/// and the admin API's status listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    WaitingForDeadline,
    CheckingNeighbours,
    MonitoringLeader(String),
    WaitingForWorkerSlot(String),
    Running(String),
    Finished,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::WaitingForDeadline => write!(f, "waiting for deadline"),
            JobState::CheckingNeighbours => write!(f, "checking neighbours"),
            JobState::MonitoringLeader(leader) => write!(f, "monitoring ({leader})"),
            JobState::WaitingForWorkerSlot(speed) => write!(f, "waiting for worker slot ({speed})"),
            JobState::Running(speed) => write!(f, "running ({speed})"),
            JobState::Finished => write!(f, "finished"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// The worker-pool permits a job run waits for before starting its
/// backup pipeline, shared across every job on this node.
pub struct WorkerPools {
    pub slow: Arc<Semaphore>,
    pub fast: Arc<Semaphore>,
}

impl WorkerPools {
    pub fn new(slow_permits: usize, fast_permits: usize) -> Self {
        WorkerPools {
            slow: Arc::new(Semaphore::new(slow_permits)),
            fast: Arc::new(Semaphore::new(fast_permits)),
        }
    }
}

/// Per-job scheduling state: the deadline-wakeup trigger, and the
/// consecutive-error counter that drives backoff.
pub struct Scheduler {
    pub name: String,
    pub run_immediately: Arc<Notify>,
    pub errors: u32,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Scheduler {
            name: name.into(),
            run_immediately: Arc::new(Notify::new()),
            errors: 0,
        }
    }

    /// The next deadline to use this iteration: the schedule's own
    /// suggestion, unless we're recovering from a failed run, in which
    /// case backoff overrides it — we still want this job queued at its
    /// current tags, just delayed by the backoff interval instead of
    /// waiting for the next scheduled slot.
    pub fn next_deadline(&self, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.errors > 0 {
            now + chrono::Duration::seconds(backoff_seconds(self.errors))
        } else {
            scheduled
        }
    }

    pub fn record_success(&mut self) {
        self.errors = 0;
    }

    pub fn record_failure(&mut self) {
        self.errors += 1;
    }

    /// Wait until `deadline` or until `run_immediately` is notified,
    /// whichever comes first. Returns `true` if woken by the notification
    /// rather than the deadline elapsing.
    pub async fn wait_for_deadline(&self, deadline: DateTime<Utc>) -> bool {
        let remaining = deadline - Utc::now();
        let remaining = remaining.to_std().unwrap_or(Duration::ZERO);
        timeout(remaining, self.run_immediately.notified())
            .await
            .is_ok()
    }

    /// Speed a job should run at, based on how long its last clean run
    /// took. `None` (no history, or the history entry has no duration
    /// stat) defaults to `Slow`.
    pub fn worker_speed(last_clean_duration: Option<f64>) -> WorkerSpeed {
        match last_clean_duration {
            Some(secs) if secs < 600.0 => WorkerSpeed::Fast,
            _ => WorkerSpeed::Slow,
        }
    }

    /// Ask every configured peer for this job's status and elect a
    /// leader by local revision count. Returns `None` if no peer could be
    /// reached or the election tied — in both cases this node should run
    /// its own backup.
    pub async fn check_neighbours(
        &self,
        local_revs: usize,
        job_filter: &str,
        peers: &[Peer],
    ) -> LeaderDecision {
        let mut statuses = Vec::new();
        for peer in peers {
            match peer.client.fetch_status(job_filter) {
                Ok(mut found) if !found.is_empty() => statuses.push((peer.name.clone(), found.remove(0))),
                Ok(_) => {}
                Err(err) => {
                    info!("check-neighbours: {} unreachable: {err}", peer.name);
                }
            }
        }
        let decision = elect_leader(local_revs, &statuses);
        info!("leader-found leader={:?} local_revs={local_revs}", decision.leader);
        decision
    }

    /// Once a leader is elected, poll its status until it has either
    /// just finished a run, stopped entirely, or scheduled its next run
    /// too far from ours to matter — or until we're told to run anyway.
    /// Returns `true` only if the leader's own recent run means we can
    /// skip this round and just sync metadata from it.
    pub async fn wait_for_leader(
        &self,
        leader: &Peer,
        job_filter: &str,
        mut status: StatusDict,
        our_next_time: DateTime<Utc>,
    ) -> bool {
        loop {
            if let Some(last_time) = status.last_time {
                if our_next_time - last_time < LEADER_GRACE {
                    info!("leader-finished leader={}", leader.name);
                    return true;
                }
            }
            if status.status.is_empty() {
                info!("leader-stopped leader={}", leader.name);
                return false;
            }
            if let Some(next_time) = status.next_time {
                if next_time - our_next_time > LEADER_GRACE {
                    info!("leader-not-scheduled leader={}", leader.name);
                    return false;
                }
            }

            if timeout(LEADER_POLL_INTERVAL, self.run_immediately.notified())
                .await
                .is_ok()
            {
                info!("run-immediately-triggered leader={}", leader.name);
                return false;
            }

            match leader.client.fetch_status(job_filter) {
                Ok(mut found) if !found.is_empty() => status = found.remove(0),
                _ => {
                    warn!("leader-failed leader={}", leader.name);
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_uses_schedule_when_no_errors() {
        let sched = Scheduler::new("job");
        let now = Utc::now();
        let scheduled = now + chrono::Duration::hours(1);
        assert_eq!(sched.next_deadline(scheduled, now), scheduled);
    }

    #[test]
    fn deadline_overridden_by_backoff_after_errors() {
        let mut sched = Scheduler::new("job");
        sched.record_failure();
        let now = Utc::now();
        let scheduled = now + chrono::Duration::hours(1);
        let deadline = sched.next_deadline(scheduled, now);
        assert!(deadline < scheduled);
        assert_eq!((deadline - now).num_seconds(), backoff_seconds(1));
    }

    #[test]
    fn worker_speed_defaults_to_slow_with_no_history() {
        assert_eq!(Scheduler::worker_speed(None), WorkerSpeed::Slow);
    }

    #[test]
    fn worker_speed_fast_under_ten_minutes() {
        assert_eq!(Scheduler::worker_speed(Some(59.0)), WorkerSpeed::Fast);
        assert_eq!(Scheduler::worker_speed(Some(600.0)), WorkerSpeed::Slow);
    }

    #[tokio::test]
    async fn wait_for_deadline_returns_true_on_notify() {
        let sched = Scheduler::new("job");
        let notify = sched.run_immediately.clone();
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let waiter = tokio::spawn(async move {
            let s = Scheduler {
                name: "job".to_string(),
                run_immediately: notify,
                errors: 0,
            };
            s.wait_for_deadline(deadline).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sched.run_immediately.notify_one();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_deadline_returns_false_on_timeout() {
        let sched = Scheduler::new("job");
        let deadline = Utc::now() + chrono::Duration::milliseconds(20);
        assert!(!sched.wait_for_deadline(deadline).await);
    }
}
