//! Loss-tolerant chunk reassembly.
//!
//! A decoder is constructed with the expected object length; the coding
//! mode follows from it. Chunks arrive in any order, duplicates are
//! idempotent, and decodability is mode-specific: one chunk for
//! repetition, exactly `N` distinct chunks for the MDS code, and `N` plus
//! a small probabilistic overhead for the fountain code.
//!
//! In mmap-backed mode the received chunks live in a [`ChunkStore`] file
//! named after the object, so a process that dies mid-object resumes from
//! disk on the next start. A fountain decoder spills the first `N` chunks
//! to the store, attempts a decode from disk when the `N`-th arrives, and
//! keeps the codec hot for any further chunks the attempt still needs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use raptorq::{Decoder as FountainDecoder, EncodingPacket, PayloadId};
use reed_solomon_erasure::galois_8::Field;
use reed_solomon_erasure::ReedSolomon;

use crate::chunk::{
    chunk_count_for_len, transmission_info, Chunk, CodingMode, CHUNK_SIZE, MAX_OBJECT_SIZE,
    MDS_MAX_CHUNKS,
};
use crate::error::{FecError, FecResult};
use crate::pool::{ArenaGuard, CodecPool};
use crate::store::ChunkStore;
use crate::tracker::ChunkIdTracker;

/// Where a decoder keeps the chunks it has not yet consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    InMemory,
    MmapBacked,
}

/// Decoder lifecycle. Transitions happen only through
/// [`FecDecoder::provide`] and [`FecDecoder::take_decoded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Empty,
    Collecting,
    Decodable,
    Consumed,
    Failed,
}

/// Successful outcomes of [`FecDecoder::provide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provided {
    /// The chunk advanced decoder state.
    Accepted,
    /// A chunk with this id was already ingested (or the object is already
    /// decodable); nothing changed.
    Duplicate,
}

enum Backing {
    Memory { chunks: Vec<Chunk>, ids: Vec<u32> },
    Mmap { store: Option<ChunkStore>, keep: bool },
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

fn unique_token() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    )
}

/// Reassembles one object from coded chunks.
pub struct FecDecoder {
    object_len: usize,
    chunk_count: usize,
    mode: CodingMode,
    state: DecodeState,
    chunks_recvd: usize,
    tracker: ChunkIdTracker,
    backing: Backing,
    pool: Option<Arc<CodecPool>>,
    fountain: Option<FountainDecoder>,
    /// Staging arena held while a fountain decode from disk is mid-flight.
    arena: Option<ArenaGuard>,
    /// Reconstructed data chunks for the MDS code, `N · CHUNK_SIZE` bytes.
    mds_decoded: Option<Vec<u8>>,
    /// Fountain decode output, exactly `object_len` bytes.
    decoded: Option<Vec<u8>>,
    /// Repetition payload and `peek_chunk` staging.
    tmp_chunk: Box<Chunk>,
}

impl FecDecoder {
    /// Decoder keeping all state in memory.
    ///
    /// # Errors
    ///
    /// [`FecError::EmptyObject`] or [`FecError::ObjectTooLarge`].
    pub fn new_in_memory(object_len: usize) -> FecResult<Self> {
        let mut dec = Self::base(object_len)?;
        dec.backing = Backing::Memory {
            chunks: Vec::new(),
            ids: Vec::new(),
        };
        if dec.mode == CodingMode::Fountain {
            dec.fountain = Some(FountainDecoder::new(transmission_info(object_len)));
        }
        Ok(dec)
    }

    /// Decoder spilling received chunks to a chunk file under `dir`.
    ///
    /// The file is `<object_id>_<object_len>` when an id is given, or a
    /// process-local token otherwise. If the file already exists with
    /// content, its occupied slots are replayed so the decoder resumes
    /// where a previous process stopped. With `keep_file` set the file
    /// survives this decoder's drop (recovery tests and controlled
    /// handover); otherwise drop removes it.
    ///
    /// # Errors
    ///
    /// Length validation, store creation, or replay of a corrupt file.
    pub fn new_mmap(
        dir: &Path,
        object_id: Option<&str>,
        object_len: usize,
        keep_file: bool,
        pool: &Arc<CodecPool>,
    ) -> FecResult<Self> {
        let mut dec = Self::base(object_len)?;
        if dec.chunk_count < 2 {
            // Single-chunk objects never touch disk.
            dec.backing = Backing::Mmap {
                store: None,
                keep: keep_file,
            };
            return Ok(dec);
        }
        let name = match object_id {
            Some(id) => format!("{id}_{object_len}"),
            None => unique_token(),
        };
        let store = ChunkStore::create(&dir.join(name), dec.chunk_count)?;
        let recover = store.is_recoverable();
        dec.backing = Backing::Mmap {
            store: Some(store),
            keep: keep_file,
        };
        if dec.mode == CodingMode::Fountain {
            dec.pool = Some(Arc::clone(pool));
        }
        if recover {
            dec.replay_store()?;
        }
        Ok(dec)
    }

    fn base(object_len: usize) -> FecResult<Self> {
        if object_len == 0 {
            return Err(FecError::EmptyObject);
        }
        if object_len > MAX_OBJECT_SIZE {
            return Err(FecError::ObjectTooLarge {
                len: object_len,
                max: MAX_OBJECT_SIZE,
            });
        }
        let chunk_count = chunk_count_for_len(object_len);
        Ok(Self {
            object_len,
            chunk_count,
            mode: CodingMode::for_chunk_count(chunk_count),
            state: DecodeState::Empty,
            chunks_recvd: 0,
            tracker: ChunkIdTracker::new(chunk_count),
            backing: Backing::Memory {
                chunks: Vec::new(),
                ids: Vec::new(),
            },
            pool: None,
            fountain: None,
            arena: None,
            mds_decoded: None,
            decoded: None,
            tmp_chunk: Box::new([0u8; CHUNK_SIZE]),
        })
    }

    #[must_use]
    pub fn object_len(&self) -> usize {
        self.object_len
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    #[must_use]
    pub fn mode(&self) -> CodingMode {
        self.mode
    }

    #[must_use]
    pub fn state(&self) -> DecodeState {
        self.state
    }

    #[must_use]
    pub fn chunks_received(&self) -> usize {
        self.chunks_recvd
    }

    #[must_use]
    pub fn memory_mode(&self) -> MemoryMode {
        match self.backing {
            Backing::Memory { .. } => MemoryMode::InMemory,
            Backing::Mmap { .. } => MemoryMode::MmapBacked,
        }
    }

    /// Path of the backing chunk file, when one exists.
    #[must_use]
    pub fn file_name(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Mmap { store: Some(s), .. } => Some(s.path()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == DecodeState::Decodable
    }

    /// Whether a chunk with `chunk_id` is already accounted for.
    #[must_use]
    pub fn has_chunk(&self, chunk_id: u32) -> bool {
        if chunk_id > self.mode.max_chunk_id() {
            return false;
        }
        matches!(self.state, DecodeState::Decodable | DecodeState::Consumed)
            || self.tracker.check(chunk_id)
    }

    /// Ingest one coded chunk.
    ///
    /// # Errors
    ///
    /// [`FecError::InvalidChunkId`] for an id outside the mode's space,
    /// [`FecError::Failed`] once the decoder is terminally failed, and
    /// [`FecError::DecodeFailed`]/[`FecError::Io`] when the codec or store
    /// gives up (which moves the decoder to [`DecodeState::Failed`]).
    pub fn provide(&mut self, chunk: &Chunk, chunk_id: u32) -> FecResult<Provided> {
        self.ingest(chunk, chunk_id, false)
    }

    fn ingest(&mut self, chunk: &Chunk, chunk_id: u32, from_store: bool) -> FecResult<Provided> {
        match self.state {
            DecodeState::Failed => return Err(FecError::Failed),
            DecodeState::Decodable | DecodeState::Consumed => return Ok(Provided::Duplicate),
            DecodeState::Empty | DecodeState::Collecting => {}
        }
        let max = self.mode.max_chunk_id();
        if chunk_id > max {
            return Err(FecError::InvalidChunkId { id: chunk_id, max });
        }
        // The fountain codec misbehaves on a repeated id, so duplicates are
        // rejected before the codec ever sees them.
        if self.tracker.check_and_mark(chunk_id) {
            return Ok(Provided::Duplicate);
        }
        self.state = DecodeState::Collecting;

        let res = match self.mode {
            CodingMode::Repetition => {
                self.tmp_chunk.copy_from_slice(chunk);
                self.chunks_recvd += 1;
                self.state = DecodeState::Decodable;
                Ok(())
            }
            CodingMode::Mds => self.ingest_mds(chunk, chunk_id, from_store),
            CodingMode::Fountain => self.ingest_fountain(chunk, chunk_id, from_store),
        };
        match res {
            Ok(()) => Ok(Provided::Accepted),
            Err(err) => {
                self.state = DecodeState::Failed;
                Err(err)
            }
        }
    }

    fn ingest_mds(&mut self, chunk: &Chunk, chunk_id: u32, from_store: bool) -> FecResult<()> {
        let slot = self.chunks_recvd;
        match &mut self.backing {
            Backing::Memory { chunks, ids } => {
                chunks.push(*chunk);
                ids.push(chunk_id);
            }
            Backing::Mmap { store, .. } => {
                let store = store.as_mut().expect("mds decoder owns a store");
                if !from_store && slot < self.chunk_count {
                    store.insert(chunk, chunk_id, slot);
                }
            }
        }
        self.chunks_recvd += 1;
        // MDS: any N distinct chunks are guaranteed sufficient.
        if self.chunks_recvd == self.chunk_count {
            self.state = DecodeState::Decodable;
        }
        Ok(())
    }

    fn ingest_fountain(&mut self, chunk: &Chunk, chunk_id: u32, from_store: bool) -> FecResult<()> {
        let mmap_backed = matches!(self.backing, Backing::Mmap { .. });
        if !mmap_backed || self.chunks_recvd >= self.chunk_count {
            // In-memory decoders feed the codec directly; so does an
            // mmap decoder once its disk attempt ran and needed more.
            self.feed_codec(chunk, chunk_id)?;
            self.chunks_recvd += 1;
            return Ok(());
        }
        if !from_store {
            let slot = self.chunks_recvd;
            if let Backing::Mmap { store: Some(s), .. } = &mut self.backing {
                s.insert(chunk, chunk_id, slot);
            }
        }
        self.chunks_recvd += 1;
        if self.chunks_recvd == self.chunk_count {
            self.attempt_disk_decode()?;
        }
        Ok(())
    }

    fn feed_codec(&mut self, chunk: &Chunk, chunk_id: u32) -> FecResult<()> {
        let codec = self
            .fountain
            .as_mut()
            .expect("fountain codec initialised before feeding");
        let packet = EncodingPacket::new(PayloadId::new(0, chunk_id), chunk.to_vec());
        if let Some(data) = codec.decode(packet) {
            self.decoded = Some(data);
            self.state = DecodeState::Decodable;
            // The staging arena is only needed while the decode is open.
            self.arena = None;
        }
        Ok(())
    }

    /// The `N`-th distinct chunk just landed on disk: pull everything back
    /// and try to decode. The codec stays live if it needs more.
    fn attempt_disk_decode(&mut self) -> FecResult<()> {
        let pool = self
            .pool
            .as_ref()
            .expect("mmap fountain decoder holds a pool")
            .clone();
        let n = self.chunk_count;
        let mut arena = pool.take();
        let mut codec = FountainDecoder::new(transmission_info(self.object_len));
        let mut decoded = None;
        {
            let store = match &self.backing {
                Backing::Mmap { store: Some(s), .. } => s,
                _ => unreachable!("disk decode requires an mmap store"),
            };
            // One sequential pass over the mapping, then codec work off the
            // heap copy.
            let staged = arena.bytes_mut(n * CHUNK_SIZE);
            for slot in 0..n {
                staged[slot * CHUNK_SIZE..(slot + 1) * CHUNK_SIZE]
                    .copy_from_slice(store.chunk(slot));
            }
            for slot in 0..n {
                let id = store.chunk_id(slot);
                let data = staged[slot * CHUNK_SIZE..(slot + 1) * CHUNK_SIZE].to_vec();
                if let Some(out) = codec.decode(EncodingPacket::new(PayloadId::new(0, id), data)) {
                    decoded = Some(out);
                    break;
                }
            }
        }
        self.fountain = Some(codec);
        if let Some(out) = decoded {
            self.decoded = Some(out);
            self.state = DecodeState::Decodable;
        } else {
            self.arena = Some(arena);
        }
        Ok(())
    }

    /// The reconstructed object, truncated to the expected length.
    /// Consumes decodability.
    ///
    /// # Errors
    ///
    /// [`FecError::NotDecodable`] unless [`FecDecoder::is_ready`];
    /// [`FecError::DecodeFailed`] if the MDS reconstruct pass fails.
    pub fn take_decoded(&mut self) -> FecResult<Vec<u8>> {
        if self.state != DecodeState::Decodable {
            return Err(FecError::NotDecodable);
        }
        let out = match self.mode {
            CodingMode::Repetition => self.tmp_chunk[..self.object_len].to_vec(),
            CodingMode::Mds => {
                self.ensure_mds_decoded()?;
                let data = self.mds_decoded.as_ref().expect("mds pass just ran");
                data[..self.object_len].to_vec()
            }
            CodingMode::Fountain => {
                let mut data = self.decoded.take().ok_or(FecError::NotDecodable)?;
                data.truncate(self.object_len);
                data
            }
        };
        self.state = DecodeState::Consumed;
        Ok(out)
    }

    /// Materialise the `index`-th original chunk without emitting the whole
    /// object. Requires [`FecDecoder::is_ready`].
    ///
    /// # Errors
    ///
    /// [`FecError::NotDecodable`], [`FecError::OutOfRange`], or a failed
    /// MDS reconstruct pass.
    pub fn peek_chunk(&mut self, index: u32) -> FecResult<&Chunk> {
        if self.state != DecodeState::Decodable {
            return Err(FecError::NotDecodable);
        }
        let idx = index as usize;
        if idx >= self.chunk_count {
            return Err(FecError::OutOfRange {
                index: idx,
                capacity: self.chunk_count,
            });
        }
        match self.mode {
            CodingMode::Repetition => Ok(&self.tmp_chunk),
            CodingMode::Mds => {
                self.ensure_mds_decoded()?;
                let data = self.mds_decoded.as_ref().expect("mds pass just ran");
                let slice = &data[idx * CHUNK_SIZE..(idx + 1) * CHUNK_SIZE];
                Ok(slice.try_into().expect("slice is CHUNK_SIZE bytes"))
            }
            CodingMode::Fountain => {
                let Self {
                    decoded, tmp_chunk, ..
                } = self;
                let data = decoded.as_ref().ok_or(FecError::NotDecodable)?;
                let start = idx * CHUNK_SIZE;
                let end = (start + CHUNK_SIZE).min(data.len());
                tmp_chunk[..end - start].copy_from_slice(&data[start..end]);
                tmp_chunk[end - start..].fill(0);
                Ok(tmp_chunk)
            }
        }
    }

    /// One-shot MDS reconstruct pass, cached for subsequent peeks. Chunks
    /// are placed by their id (data ids below `N`, parity ids above) and
    /// the missing data shards recovered in place.
    fn ensure_mds_decoded(&mut self) -> FecResult<()> {
        if self.mds_decoded.is_some() {
            return Ok(());
        }
        let n = self.chunk_count;
        let parity_n = MDS_MAX_CHUNKS - n;
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; n + parity_n];
        match &self.backing {
            Backing::Memory { chunks, ids } => {
                for (chunk, id) in chunks.iter().zip(ids.iter()) {
                    shards[*id as usize] = Some(chunk.to_vec());
                }
            }
            Backing::Mmap { store: Some(s), .. } => {
                for slot in 0..n {
                    shards[s.chunk_id(slot) as usize] = Some(s.chunk(slot).to_vec());
                }
            }
            Backing::Mmap { store: None, .. } => unreachable!("mds decoder owns a store"),
        }
        if parity_n > 0 {
            let rs: ReedSolomon<Field> = ReedSolomon::new(n, parity_n)
                .map_err(|e| self.fail(FecError::Codec(e.to_string())))?;
            rs.reconstruct_data(&mut shards).map_err(|_| {
                self.fail(FecError::DecodeFailed {
                    len: self.object_len,
                })
            })?;
        }
        let mut out = Vec::with_capacity(n * CHUNK_SIZE);
        for shard in shards.iter().take(n) {
            let shard = shard.as_ref().ok_or(FecError::DecodeFailed {
                len: self.object_len,
            })?;
            out.extend_from_slice(shard);
        }
        self.mds_decoded = Some(out);
        Ok(())
    }

    fn fail(&mut self, err: FecError) -> FecError {
        self.state = DecodeState::Failed;
        err
    }

    /// Move-assignment with the chunk-file handover rule: this decoder's
    /// own store is destroyed first; then, if this decoder previously
    /// owned a chunk file, `from`'s file is renamed over that path,
    /// otherwise `from`'s path is inherited as-is.
    ///
    /// # Errors
    ///
    /// Filesystem failure during the rename.
    pub fn assign(&mut self, mut from: FecDecoder) -> FecResult<()> {
        let my_old_path: Option<PathBuf> = match &mut self.backing {
            Backing::Mmap { store, .. } => store.take().map(|s| {
                let path = s.path().to_path_buf();
                s.remove();
                path
            }),
            Backing::Memory { .. } => None,
        };
        if let (Some(old_path), Backing::Mmap { store: Some(s), .. }) =
            (&my_old_path, &mut from.backing)
        {
            if s.path() != old_path.as_path() {
                s.rename(old_path)?;
            }
        }
        *self = from;
        Ok(())
    }

    /// Re-ingest the occupied slot prefix of a recovered chunk file.
    /// Slots are filled in arrival order, so occupancy ends at the first
    /// all-zero slot.
    fn replay_store(&mut self) -> FecResult<()> {
        let n = self.chunk_count;
        for slot in 0..n {
            let (chunk, id) = match &self.backing {
                Backing::Mmap { store: Some(s), .. } => (*s.chunk(slot), s.chunk_id(slot)),
                _ => unreachable!("replay requires an mmap store"),
            };
            let occupied = id != 0 || chunk.iter().any(|b| *b != 0);
            if !occupied {
                break;
            }
            self.ingest(&chunk, id, true)?;
        }
        tracing::debug!(
            chunks = self.chunks_recvd,
            total = n,
            ready = self.is_ready(),
            "replayed chunk store"
        );
        Ok(())
    }
}

impl Drop for FecDecoder {
    fn drop(&mut self) {
        if let Backing::Mmap { store, keep } = &mut self.backing {
            if let Some(s) = store.take() {
                if !*keep {
                    s.remove();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetition_ready_after_one_chunk() {
        let mut dec = FecDecoder::new_in_memory(5).unwrap();
        assert_eq!(dec.state(), DecodeState::Empty);
        let mut chunk = [0u8; CHUNK_SIZE];
        chunk[..5].copy_from_slice(b"hello");
        assert_eq!(dec.provide(&chunk, 0).unwrap(), Provided::Accepted);
        assert!(dec.is_ready());
        assert_eq!(dec.take_decoded().unwrap(), b"hello");
        assert_eq!(dec.state(), DecodeState::Consumed);
    }

    #[test]
    fn duplicate_is_idempotent() {
        let mut dec = FecDecoder::new_in_memory(3 * CHUNK_SIZE).unwrap();
        let chunk = [7u8; CHUNK_SIZE];
        assert_eq!(dec.provide(&chunk, 0).unwrap(), Provided::Accepted);
        assert_eq!(dec.provide(&chunk, 0).unwrap(), Provided::Duplicate);
        assert_eq!(dec.chunks_received(), 1);
        assert_eq!(dec.state(), DecodeState::Collecting);
    }

    #[test]
    fn invalid_id_never_advances_state() {
        let mut dec = FecDecoder::new_in_memory(2 * CHUNK_SIZE).unwrap();
        let chunk = [1u8; CHUNK_SIZE];
        assert!(matches!(
            dec.provide(&chunk, 256),
            Err(FecError::InvalidChunkId { id: 256, max: 255 })
        ));
        assert_eq!(dec.chunks_received(), 0);
        assert!(!dec.is_ready());

        let big = (MDS_MAX_CHUNKS + 1) * CHUNK_SIZE;
        let mut dec = FecDecoder::new_in_memory(big).unwrap();
        assert!(matches!(
            dec.provide(&chunk, 1 << 24),
            Err(FecError::InvalidChunkId { .. })
        ));
        assert!(!dec.is_ready());
    }

    #[test]
    fn take_decoded_requires_ready() {
        let mut dec = FecDecoder::new_in_memory(2 * CHUNK_SIZE).unwrap();
        assert!(matches!(dec.take_decoded(), Err(FecError::NotDecodable)));
    }

    #[test]
    fn oversized_object_is_rejected() {
        assert!(matches!(
            FecDecoder::new_in_memory(MAX_OBJECT_SIZE + 1),
            Err(FecError::ObjectTooLarge { .. })
        ));
    }
}
