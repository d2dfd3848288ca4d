//! Leader election for one job: whichever node (local or a peer) reports
//! the highest local revision count becomes leader for this round. A tie,
//! including a tie with ourselves, elects no one — every tied node backs
//! up independently and the push/pull phase reconciles the duplication
//! afterward.

use backy_api_types::StatusDict;

#[derive(Debug, Clone)]
pub struct LeaderDecision {
    /// `None` if we are the leader, or if the election tied.
    pub leader: Option<String>,
    pub leader_status: Option<StatusDict>,
}

impl LeaderDecision {
    pub fn is_self(&self) -> bool {
        self.leader.is_none()
    }
}

/// `statuses` is the job's status as reported by each peer we could reach,
/// paired with that peer's name; unreachable peers are simply absent.
pub fn elect_leader(local_revs: usize, statuses: &[(String, StatusDict)]) -> LeaderDecision {
    let mut leader_revs = local_revs;
    let mut leader: Option<String> = None;
    let mut leader_status: Option<StatusDict> = None;
    let mut tied = false;

    for (name, status) in statuses {
        if status.local_revs > leader_revs {
            leader_revs = status.local_revs;
            leader = Some(name.clone());
            leader_status = Some(status.clone());
            tied = false;
        } else if status.local_revs == leader_revs {
            tied = true;
        }
    }

    if tied {
        return LeaderDecision {
            leader: None,
            leader_status: None,
        };
    }

    LeaderDecision {
        leader,
        leader_status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(local_revs: usize) -> StatusDict {
        StatusDict {
            job: "test".into(),
            sla: true,
            sla_overdue: 0,
            status: "finished".into(),
            last_time: None,
            last_tags: None,
            last_duration: None,
            next_time: None,
            next_tags: None,
            manual_tags: String::new(),
            local_revs,
            unsynced_revs: 0,
            problem_reports: Vec::new(),
        }
    }

    #[test]
    fn peer_with_more_revisions_is_leader() {
        let decision = elect_leader(3, &[("peer-a".to_string(), status(5))]);
        assert_eq!(decision.leader.as_deref(), Some("peer-a"));
    }

    #[test]
    fn equal_counts_elect_no_one() {
        let decision = elect_leader(5, &[("peer-a".to_string(), status(5))]);
        assert!(decision.is_self());
        assert!(decision.leader_status.is_none());
    }

    #[test]
    fn local_wins_when_strictly_ahead() {
        let decision = elect_leader(5, &[("peer-a".to_string(), status(2))]);
        assert!(decision.is_self());
    }

    #[test]
    fn two_peers_tied_for_the_lead_elect_no_one() {
        let decision = elect_leader(
            1,
            &[
                ("peer-a".to_string(), status(5)),
                ("peer-b".to_string(), status(5)),
            ],
        );
        assert!(decision.is_self());
    }
}
