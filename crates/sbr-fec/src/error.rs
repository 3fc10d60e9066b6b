//! Error types for the FEC pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by encoders, decoders, and the chunk store.
#[derive(Debug, Error)]
pub enum FecError {
    #[error("chunk slot {index} out of range (capacity {capacity})")]
    OutOfRange { index: usize, capacity: usize },

    #[error("chunk id {id} exceeds the mode's id space (max {max})")]
    InvalidChunkId { id: u32, max: u32 },

    #[error("object of {len} bytes exceeds the {max}-byte limit")]
    ObjectTooLarge { len: usize, max: usize },

    #[error("object is empty")]
    EmptyObject,

    #[error("encoder was given no output chunk slots")]
    NoChunkSlots,

    #[error("decoder is not in a decodable state")]
    NotDecodable,

    #[error("decoder failed to reconstruct object of {len} bytes")]
    DecodeFailed { len: usize },

    #[error("decoder is in a terminal failed state")]
    Failed,

    #[error("erasure codec error: {0}")]
    Codec(String),

    #[error("chunk store i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk store {path} has size {actual}, expected {expected}")]
    StoreSize {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },
}

pub type FecResult<T> = Result<T, FecError>;
