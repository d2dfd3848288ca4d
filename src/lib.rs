//! Library crate backing the `backy` CLI: daemon configuration, the
//! `Source` backends jobs back up through, and the per-job scheduler loop
//! that wires a repository, a chunk store and the peer replication layer
//! together.

pub mod config;
pub mod job;
pub mod source;

pub use config::{DaemonConfig, GlobalConfig, JobConfig, PeerConfig, SourceConfig};
pub use job::Job;
pub use source::{from_config, Source};
