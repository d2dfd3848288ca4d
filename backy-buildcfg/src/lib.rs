//! Build-time configuration for backy.
//!
//! Houses the handful of compile-time constants and environment variable
//! overrides that the rest of the workspace depends on so they live in one
//! place instead of being copy-pasted across crates.

pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default base directory a daemon instance owns; individual repositories
/// live as subdirectories underneath it.
pub const DEFAULT_BASE_DIR: &str = "/srv/backy";

/// Process-level lock file that prevents two daemons from sharing a base
/// directory. Exit code 69 (EX_UNAVAILABLE) is used when it can't be taken.
pub const BASE_DIR_LOCK_FILE: &str = ".lock";
pub const EXIT_CODE_DAEMON_ALREADY_RUNNING: i32 = 69;

/// Fixed maximum chunk size used by the chunked file engine (4 MiB).
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Target number of chunks the chunked file engine keeps resident before
/// trimming; trimming kicks in once the live set exceeds `2 * FLUSH_TARGET`.
pub const FLUSH_TARGET: usize = 10;

/// Helper to read an environment variable override, falling back to a
/// compiled-in default. Mirrors the `BACKY_*`/`BACKY_RBD_*` indirections
/// used to point at embedded tooling during tests.
pub fn env_override(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Path to the `backy` CLI used by operations that shell out to themselves
/// (e.g. the scheduler invoking a backup as a subprocess).
pub fn backy_cmd() -> String {
    env_override("BACKY_CMD", "/usr/bin/backy")
}

/// Path to the `rbd` CLI wrapper.
pub fn backy_rbd_cmd() -> String {
    env_override("BACKY_RBD_CMD", "/usr/bin/backy-rbd")
}

/// Path to `cp`, used by the cowfile source for cheap reflink copies.
pub fn cp_cmd() -> String {
    env_override("BACKY_CP", "/bin/cp")
}

/// Path to the native `rbd` binary.
pub fn rbd_cmd() -> String {
    env_override("BACKY_RBD", "/usr/bin/rbd")
}

/// Path to `bash`, used to run small glue scripts around source commands.
pub fn bash_cmd() -> String {
    env_override("BACKY_BASH", "/bin/bash")
}
