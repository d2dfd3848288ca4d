//! Locking discipline and atomic-file helpers.
//!
//! Every repository-level lock (`.backup`, `.purge`) and the daemon's
//! base-directory lock are built on the same primitive: a lock file that is
//! opened fresh per call, flocked, and closed on release so the OS reclaims
//! it automatically if the process crashes.

pub mod lock;
pub mod safe_file;

pub use lock::{try_exclusive_lock, LockGuard};
pub use safe_file::{write_atomic, write_atomic_mode};
