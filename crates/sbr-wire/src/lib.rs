//! Wire format for the relay's UDP datagrams.
//!
//! One datagram carries exactly one framed message:
//!
//! ```text
//! ┌────────────────┬──────────┬──────────────────────────────┐
//! │ 16-byte tag    │ type (1) │ per-type body                │
//! └────────────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! The tag is a truncated keyed MAC over everything past itself, keyed by
//! the 64-bit per-connection magic replicated to 32 bytes. After the tag
//! is computed the body is XOR-scrambled in 8-byte groups with the two tag
//! halves, alternating; receivers reverse the scramble, then verify.
//! Packets failing verification are silently dropped by callers.
//!
//! Block and transaction content bodies carry a 15-byte little-endian
//! header (`hash_prefix` u64, `obj_length` u32, `chunk_id` 24-bit) plus one
//! coded chunk.

#![forbid(unsafe_code)]

mod auth;
mod error;
mod message;

pub use auth::{key_from_magic, open, seal, AUTH_TAG_SIZE};
pub use error::{WireError, WireResult};
pub use message::{
    BlockTxPayload, MsgType, WireMessage, BLOCK_TX_HEADER_SIZE, MAX_MESSAGE_SIZE, MIN_PACKET_SIZE,
    MSG_TYPE_MASK, PACKET_SIZE,
};
