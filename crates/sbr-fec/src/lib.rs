//! Forward-error-correction pipeline for the block relay.
//!
//! An object (a serialized block header, block body, or transaction) is
//! expanded into fixed-size coded chunks on the sender and reassembled from
//! any sufficiently large subset of those chunks on the receiver. The coding
//! scheme is chosen purely by the object's chunk count, so both sides agree
//! on it without signalling:
//!
//! - one chunk: repetition — every coded chunk is the zero-padded original;
//! - up to 256 chunks: a maximum-distance-separable erasure code — any `N`
//!   distinct chunks reconstruct the object exactly;
//! - above 256 chunks: a rateless fountain code — an effectively unbounded
//!   stream of chunk ids, decodable from slightly more than `N` chunks.
//!
//! Receiver-side decode state can be memory-backed or spilled to a
//! memory-mapped chunk file so that a restarted process resumes in-flight
//! objects from disk.

mod chunk;
mod decoder;
mod encoder;
mod error;
mod pool;
mod store;
mod tracker;

pub use chunk::{
    chunk_count_for_len, transmission_info, Chunk, CodingMode, CHUNK_ID_BYTES, CHUNK_ID_SPACE,
    CHUNK_SIZE, MAX_CHUNK_COUNT, MAX_OBJECT_SIZE, MDS_MAX_CHUNKS,
};
pub use decoder::{DecodeState, FecDecoder, MemoryMode, Provided};
pub use encoder::FecEncoder;
pub use error::{FecError, FecResult};
pub use pool::{ArenaGuard, CodecPool};
pub use store::ChunkStore;
pub use tracker::ChunkIdTracker;
