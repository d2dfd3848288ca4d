//! The revision graph and retention engine: per-repository history of
//! backups, the selection language used to address them, schedule-driven
//! expiry, and quarantine reporting for verification mismatches.

pub mod quarantine;
pub mod repository;
pub mod revision;
pub mod schedule;
pub mod selection;

pub use quarantine::{QuarantineReport, QuarantineStore};
pub use repository::{Repository, TagAction};
pub use revision::{Revision, RevisionInfo};
pub use schedule::{parse_duration, Schedule, ScheduleEntry};
