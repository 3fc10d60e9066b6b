//! Memory-mapped chunk storage.
//!
//! A store file for `N` chunks is laid out as `N · CHUNK_SIZE` data bytes
//! followed by `N · 3` id bytes, one 24-bit little-endian chunk id per slot.
//! Slot `i` holds the i-th *received* chunk; the slot index has no relation
//! to the chunk id stored alongside it. A freshly created file is all
//! zeroes, which doubles as the "unoccupied" sentinel — occupancy proper is
//! tracked by the decoder's in-memory id tracker, since 0 is a valid id.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::chunk::{Chunk, CHUNK_ID_BYTES, CHUNK_SIZE};
use crate::error::{FecError, FecResult};

/// A movable, non-copyable handle on one chunk file and its mapping.
#[derive(Debug)]
pub struct ChunkStore {
    // Held to keep the descriptor alive for the mapping's lifetime.
    _file: File,
    map: MmapMut,
    path: PathBuf,
    chunk_count: usize,
    recoverable: bool,
}

impl ChunkStore {
    /// Bytes a store for `chunk_count` slots occupies on disk.
    #[must_use]
    pub fn file_size(chunk_count: usize) -> u64 {
        (chunk_count * (CHUNK_SIZE + CHUNK_ID_BYTES)) as u64
    }

    /// Open or create the store file at `path`, sized for `chunk_count`
    /// slots, and map it read-write/shared.
    ///
    /// A pre-existing file that already holds any nonzero byte is flagged
    /// recoverable so the caller can replay its contents.
    ///
    /// # Errors
    ///
    /// Any filesystem or mapping failure.
    pub fn create(path: &Path, chunk_count: usize) -> FecResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let preexisting = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(Self::file_size(chunk_count))?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let recoverable = preexisting && map.iter().any(|b| *b != 0);
        Ok(Self {
            _file: file,
            map,
            path: path.to_path_buf(),
            chunk_count,
            recoverable,
        })
    }

    /// Map an existing store file as-is.
    ///
    /// # Errors
    ///
    /// Returns [`FecError::StoreSize`] if the file on disk does not match
    /// the expected layout, or any filesystem/mapping failure.
    pub fn open(path: &Path, chunk_count: usize) -> FecResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let expected = Self::file_size(chunk_count);
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(FecError::StoreSize {
                path: path.to_path_buf(),
                actual,
                expected,
            });
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: file,
            map,
            path: path.to_path_buf(),
            chunk_count,
            recoverable: false,
        })
    }

    /// Copy `chunk` into slot `slot` and record its 24-bit id.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range slot.
    pub fn insert(&mut self, chunk: &Chunk, chunk_id: u32, slot: usize) {
        assert!(slot < self.chunk_count, "invalid chunk slot {slot}");
        let data_at = slot * CHUNK_SIZE;
        self.map[data_at..data_at + CHUNK_SIZE].copy_from_slice(chunk);
        let id_at = self.chunk_count * CHUNK_SIZE + slot * CHUNK_ID_BYTES;
        let le = chunk_id.to_le_bytes();
        self.map[id_at..id_at + CHUNK_ID_BYTES].copy_from_slice(&le[..CHUNK_ID_BYTES]);
    }

    /// The chunk stored in `slot`.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range slot.
    #[must_use]
    pub fn chunk(&self, slot: usize) -> &Chunk {
        assert!(slot < self.chunk_count, "invalid chunk slot {slot}");
        let at = slot * CHUNK_SIZE;
        self.map[at..at + CHUNK_SIZE]
            .try_into()
            .expect("slot slice is CHUNK_SIZE bytes")
    }

    /// The 24-bit id recorded for `slot`.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range slot.
    #[must_use]
    pub fn chunk_id(&self, slot: usize) -> u32 {
        assert!(slot < self.chunk_count, "invalid chunk id slot {slot}");
        let at = self.chunk_count * CHUNK_SIZE + slot * CHUNK_ID_BYTES;
        let mut le = [0u8; 4];
        le[..CHUNK_ID_BYTES].copy_from_slice(&self.map[at..at + CHUNK_ID_BYTES]);
        u32::from_le_bytes(le)
    }

    /// Mapped size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Whether the backing file pre-existed with content when this store
    /// was created. Always false for [`ChunkStore::open`].
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the backing file to `new_path`; the mapping stays valid.
    ///
    /// # Errors
    ///
    /// Any filesystem failure.
    pub fn rename(&mut self, new_path: &Path) -> FecResult<()> {
        fs::rename(&self.path, new_path)?;
        self.path = new_path.to_path_buf();
        Ok(())
    }

    /// Advise the OS to reclaim the backing pages, then unlink the file.
    /// Idempotent: a file someone else already removed is not an error.
    pub fn remove(self) {
        #[cfg(target_os = "linux")]
        {
            use memmap2::UncheckedAdvice;
            // Reclaims the page-cache backing before the unlink.
            let _ = unsafe { self.map.unchecked_advise(UncheckedAdvice::Remove) };
        }
        let path = self.path.clone();
        drop(self.map);
        drop(self._file);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), %err, "failed to unlink chunk store");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(dir: &tempfile::TempDir, name: &str, chunks: usize) -> ChunkStore {
        ChunkStore::create(&dir.path().join(name), chunks).unwrap()
    }

    fn filled_chunk(byte: u8) -> Chunk {
        [byte; CHUNK_SIZE]
    }

    #[test]
    fn created_store_is_zeroed_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir, "s", 5);
        assert_eq!(store.len() as u64, ChunkStore::file_size(5));
        assert!(!store.is_recoverable());
        for slot in 0..5 {
            assert_eq!(store.chunk_id(slot), 0);
            assert!(store.chunk(slot).iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn insert_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = temp_store(&dir, "s", 5);
        store.insert(&filled_chunk(0xaa), 1, 0);
        store.insert(&filled_chunk(0xbb), 12, 2);
        store.insert(&filled_chunk(0xcc), 123, 4);
        assert_eq!(store.chunk_id(0), 1);
        assert_eq!(store.chunk_id(2), 12);
        assert_eq!(store.chunk_id(4), 123);
        assert_eq!(store.chunk(2)[0], 0xbb);

        // Rewrite an occupied slot.
        store.insert(&filled_chunk(0xdd), 7, 2);
        assert_eq!(store.chunk_id(2), 7);
        assert_eq!(store.chunk(2)[CHUNK_SIZE - 1], 0xdd);
    }

    #[test]
    fn chunk_ids_are_24_bit() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = temp_store(&dir, "s", 2);
        store.insert(&filled_chunk(1), 0x00ff_ffff, 0);
        assert_eq!(store.chunk_id(0), 0x00ff_ffff);
        // The neighbouring slot's id bytes are untouched.
        assert_eq!(store.chunk_id(1), 0);
    }

    #[test]
    #[should_panic(expected = "invalid chunk slot")]
    fn out_of_range_slot_panics() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir, "s", 2);
        let _ = store.chunk(2);
    }

    #[test]
    fn reopen_preserves_content_and_flags_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        {
            let mut store = ChunkStore::create(&path, 3).unwrap();
            store.insert(&filled_chunk(9), 42, 0);
        }
        let again = ChunkStore::create(&path, 3).unwrap();
        assert!(again.is_recoverable());
        assert_eq!(again.chunk_id(0), 42);
        assert_eq!(again.chunk(0)[0], 9);

        let opened = ChunkStore::open(&path, 3).unwrap();
        assert!(!opened.is_recoverable());
    }

    #[test]
    fn open_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        drop(ChunkStore::create(&path, 3).unwrap());
        let err = ChunkStore::open(&path, 4).unwrap_err();
        assert!(matches!(err, FecError::StoreSize { .. }));
    }

    #[test]
    fn remove_unlinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = ChunkStore::create(&path, 2).unwrap();
        assert!(path.exists());
        store.remove();
        assert!(!path.exists());
    }

    #[test]
    fn move_transfers_mapping_and_rename_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let mut store = ChunkStore::create(&path, 2).unwrap();
        store.insert(&filled_chunk(5), 3, 1);

        // Plain move: the mapping and descriptor travel with the value.
        let moved = store;
        assert_eq!(moved.chunk_id(1), 3);

        let mut renamed = moved;
        let new_path = dir.path().join("b");
        renamed.rename(&new_path).unwrap();
        assert!(!path.exists());
        assert!(new_path.exists());
        assert_eq!(renamed.chunk(1)[0], 5);
        renamed.remove();
        assert!(!new_path.exists());
    }
}
