//! Peer replication: the admin-API client trait used to talk to
//! neighbours backing up the same source, leader election, the per-job
//! scheduler state machine, and the push/pull metadata sync protocol.

pub mod backoff;
pub mod client;
pub mod election;
pub mod scheduler;
pub mod sync;

pub use backoff::{backoff_seconds, job_spread};
pub use client::{Peer, PeerClient, ReqwestPeerClient};
pub use election::{elect_leader, LeaderDecision};
pub use scheduler::{JobState, Scheduler, WorkerPools, WorkerSpeed};
pub use sync::{pull_metadata, push_metadata};
