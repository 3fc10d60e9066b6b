//! Coded-chunk production.
//!
//! The encoder borrows the source object and owns a fixed array of output
//! chunk slots. `build(index, overwrite)` populates one slot; `prefill`
//! populates them all. Two usage patterns hide behind that single entry
//! point: a small object wants a fixed deterministic set of parity chunks
//! (rebuilding a slot yields the same bytes), while a large object wants an
//! unbounded stream of fresh chunks (rebuilding a slot draws a new id with
//! overwhelming probability).

use rand::Rng;
use raptorq::Encoder as FountainEncoder;
use reed_solomon_erasure::galois_8::Field;
use reed_solomon_erasure::ReedSolomon;

use crate::chunk::{
    chunk_count_for_len, transmission_info, Chunk, CodingMode, CHUNK_ID_SPACE, CHUNK_SIZE,
    MAX_OBJECT_SIZE, MDS_MAX_CHUNKS,
};
use crate::error::{FecError, FecResult};

/// Expands one borrowed source object into coded chunks.
pub struct FecEncoder<'a> {
    data: &'a [u8],
    chunk_count: usize,
    mode: CodingMode,
    chunks: Box<[Chunk]>,
    ids: Box<[u32]>,
    built: Box<[bool]>,
    /// Random starting offset into the MDS parity-id space, fixed on first
    /// build so rebuilds stay deterministic.
    mds_start: Option<u32>,
    /// Full parity set for the MDS code, computed lazily once.
    mds_parity: Option<Vec<Vec<u8>>>,
    fountain: Option<FountainEncoder>,
}

impl<'a> FecEncoder<'a> {
    /// Encoder over `data` with `slot_count` output slots.
    ///
    /// # Errors
    ///
    /// [`FecError::EmptyObject`], [`FecError::ObjectTooLarge`], or
    /// [`FecError::NoChunkSlots`].
    pub fn new(data: &'a [u8], slot_count: usize) -> FecResult<Self> {
        if data.is_empty() {
            return Err(FecError::EmptyObject);
        }
        if data.len() > MAX_OBJECT_SIZE {
            return Err(FecError::ObjectTooLarge {
                len: data.len(),
                max: MAX_OBJECT_SIZE,
            });
        }
        if slot_count == 0 {
            return Err(FecError::NoChunkSlots);
        }
        let chunk_count = chunk_count_for_len(data.len());
        Ok(Self {
            data,
            chunk_count,
            mode: CodingMode::for_chunk_count(chunk_count),
            chunks: vec![[0u8; CHUNK_SIZE]; slot_count].into_boxed_slice(),
            ids: vec![0u32; slot_count].into_boxed_slice(),
            built: vec![false; slot_count].into_boxed_slice(),
            mds_start: None,
            mds_parity: None,
            fountain: None,
        })
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
    pub fn slot_count(&self) -> usize {
        self.chunks.len()
    }

    /// The built chunk and its id at `index`, if `build` has run there.
    #[must_use]
    pub fn chunk(&self, index: usize) -> Option<(&Chunk, u32)> {
        if *self.built.get(index)? {
            Some((&self.chunks[index], self.ids[index]))
        } else {
            None
        }
    }

    /// Populate slot `index`.
    ///
    /// With `overwrite` unset, a slot that was already built is left
    /// untouched and the call succeeds. With `overwrite` set, an MDS slot
    /// is rebuilt deterministically and a fountain slot gets a fresh
    /// random id.
    ///
    /// # Errors
    ///
    /// [`FecError::OutOfRange`] for a bad index, [`FecError::Codec`] if the
    /// underlying code rejects the operation.
    pub fn build(&mut self, index: usize, overwrite: bool) -> FecResult<()> {
        if index >= self.chunks.len() {
            return Err(FecError::OutOfRange {
                index,
                capacity: self.chunks.len(),
            });
        }
        if !overwrite && self.built[index] {
            return Ok(());
        }

        match self.mode {
            CodingMode::Repetition => {
                let chunk = &mut self.chunks[index];
                chunk[..self.data.len()].copy_from_slice(self.data);
                chunk[self.data.len()..].fill(0);
                self.ids[index] = index as u32;
            }
            CodingMode::Mds => self.build_mds(index, overwrite)?,
            CodingMode::Fountain => self.build_fountain(index)?,
        }
        self.built[index] = true;
        Ok(())
    }

    /// Build every slot once.
    ///
    /// # Errors
    ///
    /// First failure from [`FecEncoder::build`].
    pub fn prefill(&mut self) -> FecResult<()> {
        for index in 0..self.chunks.len() {
            self.build(index, false)?;
        }
        Ok(())
    }

    fn build_mds(&mut self, index: usize, overwrite: bool) -> FecResult<()> {
        let n = self.chunk_count;
        let parity_n = MDS_MAX_CHUNKS - n;
        if parity_n == 0 {
            // Degenerate boundary: the id space is all data, so cycle the
            // source chunks themselves.
            let source_idx = index % n;
            self.copy_source_chunk(source_idx, index);
            self.ids[index] = source_idx as u32;
            return Ok(());
        }

        let start = *self
            .mds_start
            .get_or_insert_with(|| rand::thread_rng().gen_range(0..256));
        let fec_id = (start + index as u32) % parity_n as u32;
        let chunk_id = n as u32 + fec_id;
        if overwrite && self.built[index] && self.ids[index] == chunk_id {
            // Rebuilding the same slot is a no-op by construction.
            return Ok(());
        }

        if self.mds_parity.is_none() {
            self.mds_parity = Some(self.compute_mds_parity(parity_n)?);
        }
        let parity = self.mds_parity.as_ref().expect("parity just computed");
        self.chunks[index].copy_from_slice(&parity[fec_id as usize]);
        self.ids[index] = chunk_id;
        Ok(())
    }

    fn compute_mds_parity(&self, parity_n: usize) -> FecResult<Vec<Vec<u8>>> {
        let n = self.chunk_count;
        let rs: ReedSolomon<Field> =
            ReedSolomon::new(n, parity_n).map_err(|e| FecError::Codec(e.to_string()))?;
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(n + parity_n);
        for i in 0..n {
            let start = i * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(self.data.len());
            let mut shard = self.data[start..end].to_vec();
            shard.resize(CHUNK_SIZE, 0);
            shards.push(shard);
        }
        shards.resize(n + parity_n, vec![0u8; CHUNK_SIZE]);
        rs.encode(&mut shards)
            .map_err(|e| FecError::Codec(e.to_string()))?;
        shards.drain(..n);
        Ok(shards)
    }

    fn build_fountain(&mut self, index: usize) -> FecResult<()> {
        let n = self.chunk_count as u32;
        if self.fountain.is_none() {
            self.fountain = Some(FountainEncoder::new(
                self.data,
                transmission_info(self.data.len()),
            ));
        }
        let encoder = self.fountain.as_ref().expect("fountain just created");
        let repair_id = rand::thread_rng().gen_range(0..CHUNK_ID_SPACE - n);
        let packets = encoder.get_block_encoders()[0].repair_packets(repair_id, 1);
        let packet = packets
            .into_iter()
            .next()
            .ok_or_else(|| FecError::Codec("fountain produced no repair packet".into()))?;
        let chunk_id = packet.payload_id().encoding_symbol_id();
        let data = packet.data();
        let chunk = &mut self.chunks[index];
        let take = data.len().min(CHUNK_SIZE);
        chunk[..take].copy_from_slice(&data[..take]);
        chunk[take..].fill(0);
        self.ids[index] = chunk_id;
        Ok(())
    }

    fn copy_source_chunk(&mut self, source_idx: usize, slot: usize) {
        let start = source_idx * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(self.data.len());
        let chunk = &mut self.chunks[slot];
        chunk[..end - start].copy_from_slice(&self.data[start..end]);
        chunk[end - start..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_data(len: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn invalid_slot_index_is_rejected() {
        let data = random_data(5 * CHUNK_SIZE);
        let mut enc = FecEncoder::new(&data, 8).unwrap();
        assert!(enc.build(7, false).is_ok());
        assert!(matches!(
            enc.build(8, false),
            Err(FecError::OutOfRange { index: 8, .. })
        ));
    }

    #[test]
    fn empty_object_is_rejected() {
        assert!(matches!(FecEncoder::new(&[], 1), Err(FecError::EmptyObject)));
    }

    #[test]
    fn repetition_chunks_are_padded_copies() {
        let data = random_data(10);
        let mut enc = FecEncoder::new(&data, 3).unwrap();
        enc.prefill().unwrap();
        for index in 0..3 {
            let (chunk, id) = enc.chunk(index).unwrap();
            assert_eq!(id, index as u32);
            assert_eq!(&chunk[..10], &data[..]);
            assert!(chunk[10..].iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn mds_rebuild_is_deterministic() {
        let data = random_data(4 * CHUNK_SIZE);
        let mut enc = FecEncoder::new(&data, 4).unwrap();
        enc.build(0, false).unwrap();
        let (chunk, id) = enc.chunk(0).unwrap();
        let (ref_chunk, ref_id) = (*chunk, id);

        enc.build(0, false).unwrap();
        let (chunk, id) = enc.chunk(0).unwrap();
        assert_eq!((*chunk, id), (ref_chunk, ref_id));

        enc.build(0, true).unwrap();
        let (chunk, id) = enc.chunk(0).unwrap();
        assert_eq!((*chunk, id), (ref_chunk, ref_id));
    }

    #[test]
    fn mds_ids_sit_past_the_data_ids() {
        let n = 4;
        let data = random_data(n * CHUNK_SIZE);
        let mut enc = FecEncoder::new(&data, 6).unwrap();
        enc.prefill().unwrap();
        for index in 0..6 {
            let (_, id) = enc.chunk(index).unwrap();
            assert!(id >= n as u32 && id < 256, "id {id} outside parity space");
        }
    }

    #[test]
    fn fountain_rebuild_draws_a_fresh_id() {
        let n = MDS_MAX_CHUNKS + 1;
        let data = random_data(n * CHUNK_SIZE);
        let mut enc = FecEncoder::new(&data, 1).unwrap();
        enc.build(0, false).unwrap();
        let (chunk, id) = enc.chunk(0).unwrap();
        let (ref_chunk, ref_id) = (*chunk, id);
        assert!(id >= n as u32);

        enc.build(0, true).unwrap();
        let (chunk, id) = enc.chunk(0).unwrap();
        // Collision odds are ~2^-24; a repeat would indicate the slot was
        // not actually rebuilt.
        assert_ne!(id, ref_id);
        assert_ne!(*chunk, ref_chunk);
    }

    #[test]
    fn prefill_builds_every_slot() {
        let data = random_data(2 * CHUNK_SIZE);
        let mut enc = FecEncoder::new(&data, 5).unwrap();
        enc.prefill().unwrap();
        assert!((0..5).all(|i| enc.chunk(i).is_some()));
    }
}
