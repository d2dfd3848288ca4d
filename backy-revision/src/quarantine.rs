//! Quarantine: when restore-time verification finds a chunk whose content
//! no longer matches its stored hash, both the expected and the actual
//! bytes are preserved here for forensics instead of silently repairing
//! or discarding them.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use backy_api_types::BackyError;
use backy_tools::safe_file;

/// One verification mismatch: the chunk the revision graph expected to
/// read (`source`) versus the bytes actually found on disk (`target`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineReport {
    pub uuid: String,
    pub source_hash: String,
    pub target_hash: String,
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub context: String,
    #[serde(skip)]
    source_chunk: Vec<u8>,
    #[serde(skip)]
    target_chunk: Vec<u8>,
}

/// MD5 is used here purely as a quarantine-chunk cache key, not as the
/// store's content-addressing hash — a collision only means two distinct
/// mismatches happen to share a forensics blob.
fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

impl QuarantineReport {
    pub fn new(source_chunk: Vec<u8>, target_chunk: Vec<u8>, offset: u64, context: String) -> Self {
        let source_hash = md5_hex(&source_chunk);
        let target_hash = md5_hex(&target_chunk);
        QuarantineReport {
            uuid: Uuid::new_v4().to_string(),
            source_hash,
            target_hash,
            offset,
            timestamp: Utc::now(),
            context,
            source_chunk,
            target_chunk,
        }
    }
}

/// Repository-scoped store of quarantine reports and the chunk blobs they
/// reference, under `<repo>/quarantine/`.
pub struct QuarantineStore {
    path: PathBuf,
    chunks_path: PathBuf,
    report_ids: Vec<String>,
}

impl QuarantineStore {
    pub fn open(repo_dir: &Path) -> Result<Self, BackyError> {
        let path = repo_dir.join("quarantine");
        fs::create_dir_all(&path)?;
        let chunks_path = path.join("chunks");
        fs::create_dir_all(&chunks_path)?;
        let mut store = QuarantineStore {
            path,
            chunks_path,
            report_ids: Vec::new(),
        };
        store.scan()?;
        Ok(store)
    }

    pub fn report_ids(&self) -> &[String] {
        &self.report_ids
    }

    pub fn add_report(&mut self, report: &QuarantineReport) -> Result<(), BackyError> {
        self.store_chunk(&report.source_chunk, &report.source_hash)?;
        self.store_chunk(&report.target_chunk, &report.target_hash)?;
        self.store_report(report)?;
        self.report_ids.push(report.uuid.clone());
        Ok(())
    }

    fn store_report(&self, report: &QuarantineReport) -> Result<(), BackyError> {
        let path = self.path.join(format!("{}.report", report.uuid));
        if path.exists() {
            return Ok(());
        }
        let yaml = serde_yaml::to_string(report)
            .map_err(|err| BackyError::Other(anyhow::anyhow!("serializing report: {err}")))?;
        safe_file::write_atomic(&path, yaml.as_bytes()).map_err(BackyError::Other)?;
        Ok(())
    }

    fn store_chunk(&self, chunk: &[u8], hash: &str) -> Result<(), BackyError> {
        let path = self.chunks_path.join(hash);
        if path.exists() {
            return Ok(());
        }
        safe_file::write_atomic(&path, chunk).map_err(BackyError::Other)?;
        Ok(())
    }

    pub fn scan(&mut self) -> Result<(), BackyError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(uuid) = name.strip_suffix(".report") {
                ids.push(uuid.to_string());
            }
        }
        ids.sort();
        self.report_ids = ids;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_report_persists_report_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = QuarantineStore::open(dir.path()).unwrap();
        let report = QuarantineReport::new(
            b"expected".to_vec(),
            b"actual!!".to_vec(),
            4096,
            "verify pass".to_string(),
        );
        store.add_report(&report).unwrap();

        assert_eq!(store.report_ids().len(), 1);
        assert!(dir.path().join("quarantine").join(format!("{}.report", report.uuid)).exists());
        assert!(dir
            .path()
            .join("quarantine")
            .join("chunks")
            .join(&report.source_hash)
            .exists());
    }

    #[test]
    fn reopening_store_rescans_existing_reports() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = QuarantineStore::open(dir.path()).unwrap();
            let report = QuarantineReport::new(b"a".to_vec(), b"b".to_vec(), 0, "ctx".to_string());
            store.add_report(&report).unwrap();
        }
        let reopened = QuarantineStore::open(dir.path()).unwrap();
        assert_eq!(reopened.report_ids().len(), 1);
    }
}
