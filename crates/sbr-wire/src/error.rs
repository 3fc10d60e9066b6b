//! Wire-level error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram of {len} bytes is below the minimum frame")]
    TooShort { len: usize },

    #[error("datagram of {len} bytes exceeds the maximum frame")]
    TooLong { len: usize },

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("message type {ty:#04x} with invalid body length {len}")]
    BadLength { ty: u8, len: usize },

    #[error("authentication tag mismatch")]
    Auth,
}

pub type WireResult<T> = Result<T, WireError>;
