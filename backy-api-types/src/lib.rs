//! Shared types used across the backy workspace: trust/tag vocabulary,
//! the typed error hierarchy from the error handling design, and the
//! small wire-level structs returned by the admin API and garbage
//! collection.

pub mod error;

pub use error::BackyError;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tags beginning with this prefix are user-owned and exempt from
/// schedule-driven expiry.
pub const TAG_MANUAL_PREFIX: &str = "manual:";

/// True if `tag` is user-controlled and not subject to schedule expiry.
pub fn is_manual_tag(tag: &str) -> bool {
    tag.starts_with(TAG_MANUAL_PREFIX)
}

/// Remove manual tags from a tag set, leaving only schedule-origin tags.
pub fn filter_schedule_tags<'a, I: IntoIterator<Item = &'a String>>(
    tags: I,
) -> std::collections::BTreeSet<String> {
    tags.into_iter()
        .filter(|t| !is_manual_tag(t))
        .cloned()
        .collect()
}

/// Per-revision trust state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trust {
    /// Default state for freshly created or legacy revisions.
    Trusted,
    /// A verification mismatch or chunk corruption was observed; the chunk
    /// store's force-writes mode is engaged while any revision is in this
    /// state.
    Distrusted,
    /// Passed a full verification pass.
    Verified,
}

impl Default for Trust {
    fn default() -> Self {
        Trust::Trusted
    }
}

impl fmt::Display for Trust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trust::Trusted => "trusted",
            Trust::Distrusted => "distrusted",
            Trust::Verified => "verified",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Trust {
    type Err = error::BackyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trusted" => Ok(Trust::Trusted),
            "distrusted" => Ok(Trust::Distrusted),
            "verified" => Ok(Trust::Verified),
            other => Err(error::BackyError::InvalidTrust(other.to_string())),
        }
    }
}

/// Running totals produced by a garbage collection sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GarbageCollectionStatus {
    pub chunk_count: usize,
    pub disk_bytes: u64,
    pub disk_chunks: usize,
    pub removed_bytes: u64,
    pub removed_chunks: usize,
    pub pending_bytes: u64,
    pub pending_chunks: usize,
}

/// A verification run's tally, surfaced by `validate_chunks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    pub total: usize,
    pub errors: usize,
    pub bad_hashes: Vec<String>,
}

/// One entry of `GET /v1/status` — per-job scheduling and health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDict {
    pub job: String,
    pub sla: bool,
    pub sla_overdue: i64,
    pub status: String,
    pub last_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_tags: Option<String>,
    pub last_duration: Option<f64>,
    pub next_time: Option<chrono::DateTime<chrono::Utc>>,
    pub next_tags: Option<String>,
    pub manual_tags: String,
    pub local_revs: usize,
    pub unsynced_revs: usize,
    pub problem_reports: Vec<String>,
}

/// A job descriptor, as returned by `GET /v1/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub source: String,
    pub schedule_name: String,
}

/// Body of `PUT /v1/backups/{name}/revs/{spec}/tags`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagUpdateRequest {
    pub old_tags: Vec<String>,
    pub new_tags: Vec<String>,
}

/// `check` CLI exit codes; codes compose by taking the max.
pub mod check_exit_code {
    pub const OK: i32 = 0;
    pub const QUARANTINE_REPORTS: i32 = 1;
    pub const SLA_VIOLATED: i32 = 2;
}
