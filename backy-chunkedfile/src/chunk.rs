//! A single in-memory chunk slot: a lazily-loaded buffer that tracks
//! whether it has unflushed writes.

use backy_api_types::BackyError;
use backy_buildcfg::CHUNK_SIZE;
use backy_chunkstore::ChunkStore;

/// One CHUNK_SIZE-aligned slot of a chunked file, resident in RAM while the
/// file has it open for reading or writing.
pub struct Chunk {
    hash: Option<String>,
    data: Option<Vec<u8>>,
    clean: bool,
}

impl Chunk {
    /// A chunk known to already exist on disk under `hash`, or a brand new
    /// one (`hash = None`) that has no backing data yet.
    pub fn new(hash: Option<String>) -> Self {
        Self {
            hash,
            data: None,
            clean: true,
        }
    }

    fn ensure_loaded(&mut self, store: &ChunkStore) -> Result<(), BackyError> {
        if self.data.is_some() {
            return Ok(());
        }
        let data = match &self.hash {
            Some(hash) => store.load_chunk(hash)?,
            None => Vec::new(),
        };
        self.data = Some(data);
        Ok(())
    }

    /// Read up to `size` bytes starting at `offset` within this chunk.
    /// `size < 0` means "read to the end of the chunk's data". Returns the
    /// bytes read and the remainder of the caller's request that this
    /// chunk could not satisfy (`-1` if `size` was unbounded).
    pub fn read(
        &mut self,
        store: &ChunkStore,
        offset: usize,
        size: i64,
    ) -> Result<(Vec<u8>, i64), BackyError> {
        self.ensure_loaded(store)?;
        let buf = self.data.as_ref().expect("just ensured loaded");
        let available = buf.len().saturating_sub(offset);
        let take = if size < 0 {
            available
        } else {
            (size as usize).min(available)
        };
        let data = buf[offset..offset + take].to_vec();
        let remaining = if size < 0 {
            -1
        } else {
            (size - data.len() as i64).max(0)
        };
        Ok((data, remaining))
    }

    /// Write `data` at `offset`, clipped to this chunk's CHUNK_SIZE bound.
    /// Returns the number of bytes consumed and the leftover slice the
    /// caller should write into the next chunk. A full-chunk overwrite at
    /// offset 0 replaces the buffer outright without reading any existing
    /// content first.
    pub fn write(
        &mut self,
        store: &ChunkStore,
        offset: usize,
        data: &[u8],
    ) -> Result<(usize, Vec<u8>), BackyError> {
        let room = CHUNK_SIZE.saturating_sub(offset);
        let (data, remaining) = if data.len() > room {
            (&data[..room], data[room..].to_vec())
        } else {
            (data, Vec::new())
        };

        if offset == 0 && data.len() == CHUNK_SIZE {
            self.data = Some(data.to_vec());
        } else {
            self.ensure_loaded(store)?;
            let buf = self.data.as_mut().expect("just ensured loaded");
            let end = offset + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset..end].copy_from_slice(data);
        }
        self.clean = false;

        Ok((data.len(), remaining))
    }

    /// Persist this chunk's data if it has pending writes, returning the
    /// new content hash. A no-op on a clean chunk.
    pub fn flush(&mut self, store: &ChunkStore) -> Result<Option<String>, BackyError> {
        if self.clean {
            return Ok(None);
        }
        let data = self.data.clone().unwrap_or_default();
        let hash = store.insert_chunk(&data)?;
        self.hash = Some(hash.clone());
        self.clean = true;
        Ok(Some(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("chunks")).unwrap();
        (dir, store)
    }

    #[test]
    fn fresh_chunk_reads_as_empty() {
        let (_dir, store) = store();
        let mut chunk = Chunk::new(None);
        let (data, remaining) = chunk.read(&store, 0, -1).unwrap();
        assert!(data.is_empty());
        assert_eq!(remaining, -1);
    }

    #[test]
    fn write_then_flush_then_reload_round_trips() {
        let (_dir, store) = store();
        let mut chunk = Chunk::new(None);
        chunk.write(&store, 0, b"hello").unwrap();
        let hash = chunk.flush(&store).unwrap().unwrap();

        let mut reloaded = Chunk::new(Some(hash));
        let (data, _) = reloaded.read(&store, 0, -1).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn clean_chunk_flush_is_a_noop() {
        let (_dir, store) = store();
        let mut chunk = Chunk::new(None);
        assert_eq!(chunk.flush(&store).unwrap(), None);
    }

    #[test]
    fn write_past_current_length_zero_fills_gap() {
        let (_dir, store) = store();
        let mut chunk = Chunk::new(None);
        chunk.write(&store, 5, b"hi").unwrap();
        let (data, _) = chunk.read(&store, 0, -1).unwrap();
        assert_eq!(data, b"\x00\x00\x00\x00\x00hi");
    }

    #[test]
    fn write_beyond_chunk_size_returns_remainder() {
        let (_dir, store) = store();
        let mut chunk = Chunk::new(None);
        let data = vec![1u8; CHUNK_SIZE + 10];
        let (written, remaining) = chunk.write(&store, 0, &data).unwrap();
        assert_eq!(written, CHUNK_SIZE);
        assert_eq!(remaining.len(), 10);
    }
}
