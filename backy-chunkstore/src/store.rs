//! The chunk store itself: a directory of LZO-compressed, content-addressed
//! chunk files plus the bookkeeping needed to deduplicate writes and garbage
//! collect chunks no revision references any more.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};
use walkdir::WalkDir;

use backy_api_types::{BackyError, GarbageCollectionStatus, VerifyReport};

use crate::format::{compress_chunk, decompress_chunk};
use crate::hash::chunk_hash;

const STORE_SENTINEL: &str = "store";
const STORE_VERSION: &str = "v2";
const CHUNK_SUFFIX: &str = ".chunk.lzo";
const CHUNK_FILE_MODE: u32 = 0o440;

/// Aggregate counters returned from a store-wide directory scan, used both
/// by `validate_chunks` bookkeeping and by callers wanting disk usage.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub disk_bytes: u64,
}

/// Content-addressed chunk pool for a single repository.
///
/// One `ChunkStore` owns one `<repo>/chunks` directory. It does not itself
/// acquire the repository's `.backup`/`.purge` locks — callers (the
/// revision graph and the GC entry point) are expected to hold the
/// appropriate lock before calling mutating methods here.
pub struct ChunkStore {
    base: PathBuf,
    /// Hashes already known to be on disk, populated from a prior scan or
    /// accumulated as chunks are written this session.
    known: Mutex<HashSet<String>>,
    /// Like Python's `Store.seen`: hashes we know we already wrote this
    /// session, so repeated identical chunks in the same backup run skip
    /// the existence check entirely.
    seen: Mutex<HashSet<String>>,
    /// When set, `insert_chunk` always writes even if a chunk with that
    /// hash already appears to exist on disk (used to repair chunks that
    /// failed verification).
    force_writes: AtomicBool,
}

impl ChunkStore {
    /// Open (creating if necessary) the chunk store rooted at `base`. `base`
    /// becomes `<repo>/chunks`.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, BackyError> {
        let base = base.into();
        fs::create_dir_all(&base)?;

        let sentinel = base.join(STORE_SENTINEL);
        match fs::read_to_string(&sentinel) {
            Ok(contents) if contents.trim() == STORE_VERSION => {}
            Ok(other) => {
                return Err(BackyError::Backend(format!(
                    "chunk store at {base:?} has unknown format tag {other:?}"
                )));
            }
            Err(_) => {
                Self::migrate_v1_layout(&base)?;
                Self::initialize_layout(&base)?;
                fs::write(&sentinel, STORE_VERSION)?;
            }
        }

        Ok(Self {
            base,
            known: Mutex::new(HashSet::new()),
            seen: Mutex::new(HashSet::new()),
            force_writes: AtomicBool::new(false),
        })
    }

    /// Pre-create the 256 two-hex-digit subdirectories chunks are sharded
    /// into, so individual writes never need to `create_dir` on the hot
    /// path.
    fn initialize_layout(base: &Path) -> Result<(), BackyError> {
        for i in 0u16..256 {
            let subdir = base.join(format!("{i:02x}"));
            fs::create_dir_all(&subdir)?;
        }
        Ok(())
    }

    /// One-shot migration run the first time a store without a sentinel
    /// file is opened: flatten any legacy 3-level `<xx>/<yy>/<hash>.chunk.lzo`
    /// layout to the 2-level layout this store otherwise always uses. A
    /// freshly created store has no first-level directories yet, so this is
    /// a no-op for it.
    fn migrate_v1_layout(base: &Path) -> Result<(), BackyError> {
        let Ok(top_entries) = fs::read_dir(base) else {
            return Ok(());
        };
        for top in top_entries {
            let top = top?;
            if !top.file_type()?.is_dir() {
                continue;
            }
            let top_path = top.path();
            let Ok(sub_entries) = fs::read_dir(&top_path) else {
                continue;
            };
            for sub in sub_entries {
                let sub = sub?;
                if !sub.file_type()?.is_dir() {
                    continue;
                }
                let sub_path = sub.path();
                for file in fs::read_dir(&sub_path)? {
                    let file = file?;
                    if !file.file_type()?.is_file() {
                        continue;
                    }
                    let target = top_path.join(file.file_name());
                    fs::rename(file.path(), target)?;
                }
                fs::remove_dir(&sub_path)?;
            }
        }
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Load previously known hashes (e.g. from a revision graph scan) so
    /// `insert_chunk` can skip redundant existence checks.
    pub fn seed_known(&self, hashes: impl IntoIterator<Item = String>) {
        let mut known = self.known.lock().unwrap();
        known.extend(hashes);
    }

    pub fn set_force_writes(&self, force: bool) {
        self.force_writes.store(force, Ordering::Relaxed);
    }

    fn chunk_path(&self, hash: &str) -> PathBuf {
        self.base.join(&hash[0..2]).join(format!("{hash}{CHUNK_SUFFIX}"))
    }

    /// Insert `data` into the store, returning its content hash. Writes are
    /// skipped when the hash was already seen this session, or (absent
    /// `force_writes`) when a chunk file with that name already exists.
    pub fn insert_chunk(&self, data: &[u8]) -> Result<String, BackyError> {
        let hash = chunk_hash(data);

        if self.seen.lock().unwrap().contains(&hash) {
            return Ok(hash);
        }

        let target = self.chunk_path(&hash);
        let force = self.force_writes.load(Ordering::Relaxed);
        if force || !target.exists() {
            self.write_chunk_file(&target, data)?;
        }

        self.seen.lock().unwrap().insert(hash.clone());
        self.known.lock().unwrap().insert(hash.clone());
        Ok(hash)
    }

    fn write_chunk_file(&self, target: &Path, data: &[u8]) -> Result<(), BackyError> {
        let framed = compress_chunk(data)?;
        let parent = target
            .parent()
            .expect("chunk path always has a two-hex-digit parent");

        let tmp_path = parent.join(format!(
            ".tmp.{}.{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or_default()
        ));

        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(CHUNK_FILE_MODE)
                .open(&tmp_path)?;
            tmp.write_all(&framed)?;
            tmp.sync_all()?;
        }
        // chmod before rename: a crash between these two calls loses
        // nothing we depend on, and avoids a metadata flush after the
        // rename has already landed.
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(CHUNK_FILE_MODE))?;
        fs::rename(&tmp_path, target)?;
        Ok(())
    }

    /// Load and verify a chunk, recomputing its hash to catch silent disk
    /// corruption.
    pub fn load_chunk(&self, hash: &str) -> Result<Vec<u8>, BackyError> {
        let path = self.chunk_path(hash);
        let framed = fs::read(&path)
            .map_err(|err| BackyError::Backend(format!("reading chunk {hash}: {err}")))?;
        let data = decompress_chunk(&framed)?;
        let actual = chunk_hash(&data);
        if actual != hash {
            return Err(BackyError::InconsistentHash {
                hash: hash.to_string(),
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(data)
    }

    /// Iterate all chunk hashes currently on disk, reporting scan progress
    /// via `on_progress(percent)`.
    pub fn walk(&self, mut on_progress: impl FnMut(u8)) -> Result<Vec<String>, BackyError> {
        let mut hashes = Vec::new();
        let mut last_percentage = 0u8;
        let entries: Vec<_> = WalkDir::new(&self.base)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .collect();
        let total = entries.len().max(1);

        for (i, entry) in entries.into_iter().enumerate() {
            let entry = entry.map_err(|err| BackyError::Backend(err.to_string()))?;
            let name = entry.file_name().to_string_lossy();
            if let Some(hash) = name.strip_suffix(CHUNK_SUFFIX) {
                hashes.push(hash.to_string());
            }
            let percentage = ((i + 1) * 100 / total) as u8;
            if percentage != last_percentage {
                on_progress(percentage);
                last_percentage = percentage;
            }
        }

        Ok(hashes)
    }

    /// Decompress and re-hash every chunk on disk, reporting any mismatches.
    /// Does not delete anything; callers decide how to act on a non-empty
    /// `bad_hashes` list (typically: mark the owning revisions distrusted).
    pub fn validate_chunks(&self, mut on_progress: impl FnMut(u8)) -> Result<VerifyReport, BackyError> {
        let hashes = self.walk(&mut on_progress)?;
        let mut report = VerifyReport {
            total: hashes.len(),
            errors: 0,
            bad_hashes: Vec::new(),
        };

        for hash in hashes {
            match self.load_chunk(&hash) {
                Ok(_) => {}
                Err(err) => {
                    warn!("chunk {hash} failed verification: {err}");
                    report.errors += 1;
                    report.bad_hashes.push(hash);
                }
            }
        }

        Ok(report)
    }

    /// Delete every chunk not present in `used`. The caller must hold the
    /// repository's exclusive `.purge` lock for the duration of this call;
    /// `ChunkStore` does not acquire it itself.
    pub fn purge(&self, used: &HashSet<String>) -> Result<GarbageCollectionStatus, BackyError> {
        let mut status = GarbageCollectionStatus::default();

        let on_disk = self.walk(|_| {})?;
        for hash in on_disk {
            let path = self.chunk_path(&hash);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            if used.contains(&hash) {
                status.disk_chunks += 1;
                status.disk_bytes += size;
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    status.removed_chunks += 1;
                    status.removed_bytes += size;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!("chunk {hash} already gone during purge");
                }
                Err(err) => return Err(BackyError::Backend(format!("removing chunk {hash}: {err}"))),
            }
        }

        self.known.lock().unwrap().retain(|h| used.contains(h));
        info!(
            "purge complete: kept {} chunks ({} bytes), removed {} chunks ({} bytes)",
            status.disk_chunks, status.disk_bytes, status.removed_chunks, status.removed_bytes
        );
        Ok(status)
    }

    pub fn stats(&self) -> Result<StoreStats, BackyError> {
        let mut stats = StoreStats::default();
        for hash in self.walk(|_| {})? {
            let path = self.chunk_path(&hash);
            stats.chunk_count += 1;
            stats.disk_bytes += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("chunks")).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_then_load_round_trips() {
        let (_dir, store) = open_store();
        let data = vec![42u8; 4096];
        let hash = store.insert_chunk(&data).unwrap();
        assert_eq!(store.load_chunk(&hash).unwrap(), data);
    }

    #[test]
    fn identical_content_writes_once() {
        let (_dir, store) = open_store();
        let data = vec![9u8; 128];
        let h1 = store.insert_chunk(&data).unwrap();
        let h2 = store.insert_chunk(&data).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.stats().unwrap().chunk_count, 1);
    }

    #[test]
    fn purge_removes_unreferenced_chunks() {
        let (_dir, store) = open_store();
        let keep = store.insert_chunk(b"keep me").unwrap();
        let drop_hash = store.insert_chunk(b"drop me").unwrap();

        let mut used = HashSet::new();
        used.insert(keep.clone());

        let status = store.purge(&used).unwrap();
        assert_eq!(status.removed_chunks, 1);
        assert_eq!(status.disk_chunks, 1);

        assert!(store.load_chunk(&keep).is_ok());
        assert!(store.load_chunk(&drop_hash).is_err());
    }

    #[test]
    fn load_chunk_detects_corruption() {
        let (_dir, store) = open_store();
        let hash = store.insert_chunk(b"some data").unwrap();
        let path = store.chunk_path(&hash);
        let mut framed = fs::read(&path).unwrap();
        // flip a payload byte, leaving the header intact
        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        fs::write(&path, framed).unwrap();

        assert!(store.load_chunk(&hash).is_err());
    }

    #[test]
    fn open_flattens_legacy_three_level_layout() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("chunks");
        let hash = chunk_hash(b"legacy chunk");
        fs::create_dir_all(base.join(&hash[0..2]).join(&hash[2..4])).unwrap();
        let framed = compress_chunk(b"legacy chunk").unwrap();
        fs::write(
            base.join(&hash[0..2])
                .join(&hash[2..4])
                .join(format!("{hash}{CHUNK_SUFFIX}")),
            framed,
        )
        .unwrap();

        let store = ChunkStore::open(&base).unwrap();
        assert!(base.join(&hash[0..2]).join(format!("{hash}{CHUNK_SUFFIX}")).exists());
        assert!(!base.join(&hash[0..2]).join(&hash[2..4]).exists());
        assert_eq!(store.load_chunk(&hash).unwrap(), b"legacy chunk");
    }

    #[test]
    fn reopen_rejects_foreign_version_tag() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("chunks");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join(STORE_SENTINEL), "v1").unwrap();
        assert!(ChunkStore::open(&base).is_err());
    }
}
