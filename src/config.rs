//! Daemon configuration: `/etc/backy.conf` (or `$BACKY_BASE_DIR`-relative in
//! tests), a single YAML document covering global settings, schedules, peers
//! and jobs. Mirrors the teacher's section-parser style (`pbs-config`):
//! deserialize into typed structs with `serde(default)` for optional
//! sections, then validate cross-references (a job's `schedule` name must
//! resolve) once the whole document is in hand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use backy_api_types::BackyError;
use backy_revision::ScheduleEntry;

fn default_worker_limit() -> usize {
    1
}

/// `global:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(rename = "base-dir")]
    pub base_dir: PathBuf,
    #[serde(rename = "worker-limit", default = "default_worker_limit")]
    pub worker_limit: usize,
    #[serde(rename = "backup-completed-callback", default)]
    pub backup_completed_callback: Option<PathBuf>,
}

/// `peers.<name>:` entry — a neighbour's admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub url: String,
    pub token: String,
}

/// One job's `source:` section. Only the `file` type is implemented; other
/// type tags parse but are rejected at `Source::from_config` time with a
/// clear error rather than silently being ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub type_: String,
    pub filename: Option<PathBuf>,
    #[serde(default = "default_cow")]
    pub cow: bool,
}

fn default_cow() -> bool {
    true
}

/// `jobs.<name>:` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub schedule: String,
    pub source: SourceConfig,
}

/// The whole of `backy.conf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub global: GlobalConfig,
    #[serde(default)]
    pub schedules: BTreeMap<String, BTreeMap<String, ScheduleEntry>>,
    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

impl DaemonConfig {
    /// Load and validate one config file. Per-job errors are collected
    /// rather than aborting the whole load, so one malformed job doesn't
    /// prevent the rest of the fleet from starting; returns the parsed
    /// config alongside the list of job names that failed validation.
    pub fn load(path: &Path) -> Result<(Self, Vec<(String, BackyError)>), BackyError> {
        let raw = std::fs::read(path)?;
        let config: DaemonConfig = serde_yaml::from_slice(&raw)
            .map_err(|err| BackyError::Other(anyhow::anyhow!("parsing {path:?}: {err}")))?;

        let mut errors = Vec::new();
        for (name, job) in &config.jobs {
            if !config.schedules.contains_key(&job.schedule) {
                errors.push((
                    name.clone(),
                    BackyError::Other(anyhow::anyhow!(
                        "job {name:?} references unknown schedule {:?}",
                        job.schedule
                    )),
                ));
            }
        }
        Ok((config, errors))
    }

    pub fn job_path(&self, job_name: &str) -> PathBuf {
        self.global.base_dir.join(job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backy.conf");
        std::fs::write(
            &path,
            r#"
global:
  base-dir: /srv/backy
schedules:
  default:
    daily:
      interval: 1d
      keep: 7
jobs:
  test01:
    schedule: default
    source:
      type: file
      filename: /dev/null
"#,
        )
        .unwrap();

        let (config, errors) = DaemonConfig::load(&path).unwrap();
        assert!(errors.is_empty());
        assert_eq!(config.global.worker_limit, 1);
        assert_eq!(config.jobs["test01"].schedule, "default");
    }

    #[test]
    fn job_with_unknown_schedule_is_reported_but_others_still_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backy.conf");
        std::fs::write(
            &path,
            r#"
global:
  base-dir: /srv/backy
schedules:
  default:
    daily:
      interval: 1d
      keep: 7
jobs:
  broken:
    schedule: missing
    source:
      type: file
      filename: /dev/null
  fine:
    schedule: default
    source:
      type: file
      filename: /dev/null
"#,
        )
        .unwrap();

        let (config, errors) = DaemonConfig::load(&path).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "broken");
        assert_eq!(config.jobs.len(), 2);
    }
}
