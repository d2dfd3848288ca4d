//! The chunked, sparse, seekable file itself: a mapping from chunk index to
//! chunk hash, materialized as a small JSON side-file next to the bulk data
//! that lives deduplicated in the chunk store.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use backy_api_types::BackyError;
use backy_buildcfg::{CHUNK_SIZE, FLUSH_TARGET};
use backy_chunkstore::ChunkStore;
use backy_tools::safe_file;

use crate::chunk::Chunk;

/// `seek` whence values. `End`'s offset is subtracted from the file's
/// current size rather than added to it, by design — this matches the
/// convention the chunked storage format has always used on disk, not the
/// POSIX `lseek` convention.
#[derive(Debug, Clone, Copy)]
pub enum Whence {
    Start,
    End,
    Current,
}

#[derive(Debug, Clone, Copy, Default)]
struct Mode {
    read: bool,
    write: bool,
    append: bool,
}

impl Mode {
    fn parse(spec: &str) -> Self {
        let mut m = Mode {
            read: spec.contains('r'),
            write: spec.contains('w'),
            append: spec.contains('a'),
        };
        if spec.contains('+') || m.append {
            m.write = true;
        }
        m
    }
}

#[derive(Debug, Default, Clone)]
pub struct FileStats {
    pub bytes_written: u64,
    pub write_full: u64,
    pub write_partial: u64,
}

#[derive(Serialize, Deserialize)]
struct ChunkMapFile {
    mapping: HashMap<String, String>,
    size: u64,
}

/// A file-like random-access byte stream whose storage lives in a
/// `ChunkStore`, addressed by a small on-disk index of chunk hashes.
pub struct ChunkedFile {
    name: PathBuf,
    store: Arc<ChunkStore>,
    mode: Mode,
    closed: bool,

    position: u64,
    size: u64,
    stats: FileStats,

    mapping: BTreeMap<u64, String>,
    chunks: HashMap<u64, Chunk>,
    access_stats: HashMap<u64, (u64, Instant)>,
}

impl ChunkedFile {
    /// Open `path` (the chunk-map side-file) against `store`. `mode` is any
    /// combination of `r`, `w`, `a`, `+` (`+` and `a` both imply `w`).
    pub fn open(path: impl AsRef<Path>, store: Arc<ChunkStore>, mode: &str) -> Result<Self, BackyError> {
        let mode = Mode::parse(mode);
        let path = path.as_ref().to_path_buf();

        if !path.exists() && !mode.write {
            return Err(BackyError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file not found: {path:?}"),
            )));
        }

        let (mapping, size) = if !path.exists() {
            (BTreeMap::new(), 0)
        } else {
            Self::load_map(&path)?
        };

        let position = if mode.append { size } else { 0 };

        Ok(Self {
            name: path,
            store,
            mode,
            closed: false,
            position,
            size,
            stats: FileStats::default(),
            mapping,
            chunks: HashMap::new(),
            access_stats: HashMap::new(),
        })
    }

    fn load_map(path: &Path) -> Result<(BTreeMap<u64, String>, u64), BackyError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 2 || &bytes[0..2] != b"{\"" {
            return Err(BackyError::Backend(format!(
                "{path:?} does not look like a chunked file map"
            )));
        }
        let parsed: ChunkMapFile =
            serde_json::from_slice(&bytes).map_err(|err| BackyError::Backend(err.to_string()))?;
        let mapping = parsed
            .mapping
            .into_iter()
            .map(|(k, v)| {
                k.parse::<u64>()
                    .map(|id| (id, v))
                    .map_err(|_| BackyError::Backend(format!("non-integer chunk index {k:?}")))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok((mapping, parsed.size))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tell(&self) -> u64 {
        assert!(!self.closed);
        self.position
    }

    pub fn stats(&self) -> &FileStats {
        &self.stats
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, BackyError> {
        assert!(!self.closed);
        let position = match whence {
            Whence::Start => offset,
            Whence::End => self.size as i64 - offset,
            Whence::Current => self.position as i64 + offset,
        };
        if position < 0 {
            return Err(BackyError::Backend(
                "cannot seek before the beginning of a file".into(),
            ));
        }
        let position = position as u64;
        if position > self.size {
            self.truncate(Some(position))?;
        }
        self.position = position;
        Ok(position)
    }

    fn current_chunk(&mut self) -> Result<(u64, usize), BackyError> {
        let chunk_id = self.position / CHUNK_SIZE as u64;
        let offset = (self.position % CHUNK_SIZE as u64) as usize;

        if !self.chunks.contains_key(&chunk_id) {
            self.flush_chunks(FLUSH_TARGET)?;
            let hash = self.mapping.get(&chunk_id).cloned();
            self.chunks.insert(chunk_id, Chunk::new(hash));
        }

        let stat = self
            .access_stats
            .entry(chunk_id)
            .or_insert((0, Instant::now()));
        stat.0 += 1;
        stat.1 = Instant::now();

        Ok((chunk_id, offset))
    }

    /// Evict and flush the least-recently-used chunks once the resident set
    /// exceeds `2 * target`, keeping the top `target` by access score.
    fn flush_chunks(&mut self, target: usize) -> Result<(), BackyError> {
        if self.chunks.len() < 2 * target {
            return Ok(());
        }

        let mut ids: Vec<u64> = self.chunks.keys().copied().collect();
        let stats = &self.access_stats;
        ids.sort_by(|a, b| {
            let sa = stats.get(a).copied();
            let sb = stats.get(b).copied();
            match (sa, sb) {
                (Some(sa), Some(sb)) => sb.0.cmp(&sa.0).then_with(|| sb.1.cmp(&sa.1)),
                _ => std::cmp::Ordering::Equal,
            }
        });

        let to_remove = ids.split_off(target.min(ids.len()));
        for id in to_remove {
            if let Some(mut chunk) = self.chunks.remove(&id) {
                if let Some(hash) = chunk.flush(&self.store)? {
                    self.mapping.insert(id, hash);
                }
            }
        }
        Ok(())
    }

    pub fn read(&mut self, size: i64) -> Result<Vec<u8>, BackyError> {
        assert!(self.mode.read && !self.closed);
        let mut result = Vec::new();
        let max_size = (self.size as i64 - self.position as i64).max(0);
        let mut remaining = if size < 0 { max_size } else { size.min(max_size) };

        while remaining > 0 {
            let (chunk_id, offset) = self.current_chunk()?;
            let chunk = self.chunks.get_mut(&chunk_id).expect("just inserted");
            let (data, rem) = chunk.read(&self.store, offset, remaining)?;
            if data.is_empty() {
                return Err(BackyError::Backend(format!(
                    "under-run: chunk {chunk_id} seems to be missing data"
                )));
            }
            self.position += data.len() as u64;
            result.extend_from_slice(&data);
            remaining = rem;
        }

        Ok(result)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), BackyError> {
        assert!(self.mode.write && !self.closed);
        self.stats.bytes_written += data.len() as u64;

        let mut remaining_data = data.to_vec();
        while !remaining_data.is_empty() {
            let (chunk_id, offset) = self.current_chunk()?;
            let full_overwrite = offset == 0 && remaining_data.len() >= CHUNK_SIZE;
            let chunk = self.chunks.get_mut(&chunk_id).expect("just inserted");
            let (written, rest) = chunk.write(&self.store, offset, &remaining_data)?;
            if full_overwrite {
                self.stats.write_full += 1;
            } else {
                self.stats.write_partial += 1;
            }
            self.position += written as u64;
            if self.position > self.size {
                self.size = self.position;
            }
            remaining_data = rest;
        }
        Ok(())
    }

    /// Extend or shrink the file to exactly `target` bytes (or the current
    /// position, if `target` is `None`). Growing the file fills the gap
    /// with a single zero chunk whose hash is reused across every
    /// subsequent whole chunk, so a large sparse extension costs one
    /// physical chunk regardless of its logical size.
    pub fn truncate(&mut self, target: Option<u64>) -> Result<(), BackyError> {
        assert!(self.mode.write && !self.closed);
        let target = target.unwrap_or(self.position);
        let chunk_size = CHUNK_SIZE as u64;

        let mut to_remove: Vec<u64> = self
            .mapping
            .keys()
            .chain(self.chunks.keys())
            .copied()
            .filter(|id| id * chunk_size >= target)
            .collect();
        to_remove.sort_unstable();
        to_remove.dedup();
        for id in to_remove {
            self.mapping.remove(&id);
            self.chunks.remove(&id);
        }

        let orig_pos = self.position;
        self.position = self.size;

        if target > self.position {
            let fill = (target - self.position).min(chunk_size) as usize;
            let data = vec![0u8; fill];
            let (chunk_id, offset) = self.current_chunk()?;
            let chunk = self.chunks.get_mut(&chunk_id).expect("just inserted");
            let (written, _) = chunk.write(&self.store, offset, &data)?;
            self.position += written as u64;
        }

        if target > self.position {
            let (chunk_id, offset) = self.current_chunk()?;
            assert_eq!(offset, 0);
            let zero_chunk = vec![0u8; CHUNK_SIZE];
            let chunk = self.chunks.get_mut(&chunk_id).expect("just inserted");
            let (written, _) = chunk.write(&self.store, offset, &zero_chunk)?;
            assert_eq!(written, CHUNK_SIZE);
            self.position += chunk_size;
            let empty_hash = chunk
                .flush(&self.store)?
                .expect("a chunk just marked dirty always produces a hash");
            self.mapping.insert(chunk_id, empty_hash.clone());

            while target > self.position {
                let id = self.position / chunk_size;
                self.mapping.insert(id, empty_hash.clone());
                self.position += chunk_size;
            }
        }

        assert!(self.position >= target);
        self.position = orig_pos;
        self.size = target;
        Ok(())
    }

    /// Flush all resident chunks and atomically persist the chunk map.
    pub fn flush(&mut self) -> Result<(), BackyError> {
        assert!(self.mode.write && !self.closed);
        self.flush_chunks(0)?;

        let map_file = ChunkMapFile {
            mapping: self
                .mapping
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            size: self.size,
        };
        let data = serde_json::to_vec(&map_file).map_err(|err| BackyError::Backend(err.to_string()))?;
        safe_file::write_atomic(&self.name, &data)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), BackyError> {
        assert!(!self.closed);
        if self.mode.write {
            self.flush()?;
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> Arc<ChunkStore> {
        Arc::new(ChunkStore::open(dir.path().join("chunks")).unwrap())
    }

    #[test]
    fn write_close_reopen_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("rev-map");
        let store = store(&dir);

        let mut f = ChunkedFile::open(&map_path, store.clone(), "rw").unwrap();
        f.write(b"hello world").unwrap();
        f.close().unwrap();

        let mut f = ChunkedFile::open(&map_path, store, "r").unwrap();
        assert_eq!(f.size(), 11);
        assert_eq!(f.read(-1).unwrap(), b"hello world");
    }

    #[test]
    fn dedup_across_repeated_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("rev-map");
        let store = store(&dir);

        let mut f = ChunkedFile::open(&map_path, store.clone(), "rw").unwrap();
        let block = vec![0x20u8; CHUNK_SIZE];
        for _ in 0..5 {
            f.write(&block).unwrap();
        }
        f.close().unwrap();

        assert_eq!(store.stats().unwrap().chunk_count, 1);
    }

    #[test]
    fn sparse_grow_fills_with_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("rev-map");
        let store = store(&dir);

        let mut f = ChunkedFile::open(&map_path, store.clone(), "rw").unwrap();
        f.write(b"asdf").unwrap();
        let target = 20 * 1024 * 1024 + 100;
        f.seek(target, Whence::Start).unwrap();
        f.write(b"csdf").unwrap();
        f.close().unwrap();

        let mut f = ChunkedFile::open(&map_path, store, "r").unwrap();
        assert_eq!(f.size(), 20 * 1024 * 1024 + 104);
        let data = f.read(-1).unwrap();
        assert_eq!(&data[0..4], b"asdf");
        assert!(data[4..(20 * 1024 * 1024 + 100) as usize]
            .iter()
            .all(|&b| b == 0));
        assert_eq!(&data[data.len() - 4..], b"csdf");
    }

    #[test]
    fn truncate_then_reopen_reports_zeroed_tail() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("rev-map");
        let store = store(&dir);

        let mut f = ChunkedFile::open(&map_path, store.clone(), "rw").unwrap();
        f.write(b"abc").unwrap();
        f.truncate(Some(10)).unwrap();
        f.close().unwrap();

        let mut f = ChunkedFile::open(&map_path, store, "r").unwrap();
        assert_eq!(f.size(), 10);
        let data = f.read(-1).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(&data[0..3], b"abc");
        assert!(data[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read_past_eof_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("rev-map");
        let store = store(&dir);

        let mut f = ChunkedFile::open(&map_path, store.clone(), "rw").unwrap();
        f.write(b"abc").unwrap();
        f.close().unwrap();

        let mut f = ChunkedFile::open(&map_path, store, "r").unwrap();
        f.seek(3, Whence::Start).unwrap();
        assert_eq!(f.read(-1).unwrap(), b"");
    }

    #[test]
    fn opening_missing_file_read_only_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(ChunkedFile::open(dir.path().join("missing"), store, "r").is_err());
    }

    #[test]
    fn inconsistent_chunk_detected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("rev-map");
        let store = store(&dir);

        let mut f = ChunkedFile::open(&map_path, store.clone(), "rw").unwrap();
        f.write(b"some data").unwrap();
        f.close().unwrap();

        // Corrupt the single chunk on disk.
        let hash = store.walk(|_| {}).unwrap().into_iter().next().unwrap();
        let corrupt = backy_chunkstore::format::compress_chunk(b"wrong contents").unwrap();
        let path = store
            .base()
            .join(&hash[0..2])
            .join(format!("{hash}.chunk.lzo"));
        std::fs::write(&path, corrupt).unwrap();

        let mut f = ChunkedFile::open(&map_path, store, "r").unwrap();
        assert!(f.read(-1).is_err());
    }
}
