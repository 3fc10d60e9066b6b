//! Message types and frame construction/parsing.

use sbr_fec::{Chunk, CHUNK_SIZE};

use crate::auth::AUTH_TAG_SIZE;
use crate::error::{WireError, WireResult};

/// Low bits of the type byte select the message kind; high bits are
/// reserved for per-kind flags.
pub const MSG_TYPE_MASK: u8 = 0x3f;

/// Block/tx content body header: `hash_prefix` (8) + `obj_length` (4) +
/// `chunk_id` (3), all little-endian.
pub const BLOCK_TX_HEADER_SIZE: usize = 15;

/// Largest message past the type byte: content header plus one chunk.
pub const MAX_MESSAGE_SIZE: usize = BLOCK_TX_HEADER_SIZE + CHUNK_SIZE;

/// Largest datagram on the wire.
pub const PACKET_SIZE: usize = AUTH_TAG_SIZE + 1 + MAX_MESSAGE_SIZE;

/// Smallest parseable datagram: tag plus type byte.
pub const MIN_PACKET_SIZE: usize = AUTH_TAG_SIZE + 1;

/// Message kinds the receiver accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Syn = 0,
    Keepalive = 1,
    Disconnect = 2,
    BlockHeader = 3,
    BlockContents = 4,
    Ping = 5,
    Pong = 6,
    TxContents = 7,
}

impl MsgType {
    /// Decode a type byte, masking off flag bits.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & MSG_TYPE_MASK {
            0 => Some(Self::Syn),
            1 => Some(Self::Keepalive),
            2 => Some(Self::Disconnect),
            3 => Some(Self::BlockHeader),
            4 => Some(Self::BlockContents),
            5 => Some(Self::Ping),
            6 => Some(Self::Pong),
            7 => Some(Self::TxContents),
            _ => None,
        }
    }

    /// Block or transaction content — the only kinds a multicast source
    /// may send.
    #[must_use]
    pub fn is_content(self) -> bool {
        matches!(self, Self::BlockHeader | Self::BlockContents | Self::TxContents)
    }

    /// Expected body length past the type byte, if fixed.
    #[must_use]
    pub fn body_len(self) -> Option<usize> {
        match self {
            Self::Keepalive | Self::Disconnect => Some(0),
            Self::Syn | Self::Ping | Self::Pong => Some(8),
            Self::BlockHeader | Self::BlockContents | Self::TxContents => Some(MAX_MESSAGE_SIZE),
        }
    }
}

/// One outgoing frame, laid out exactly as transmitted. The tag region is
/// zero until [`crate::seal`] runs; a zero tag marks "not yet sealed" so
/// the send path can seal lazily per destination magic.
#[derive(Debug, Clone)]
pub struct WireMessage {
    bytes: Vec<u8>,
}

impl WireMessage {
    /// A bodyless message (KEEPALIVE, DISCONNECT).
    #[must_use]
    pub fn new(ty: MsgType) -> Self {
        let mut bytes = vec![0u8; MIN_PACKET_SIZE];
        bytes[AUTH_TAG_SIZE] = ty as u8;
        Self { bytes }
    }

    /// A message with an 8-byte little-endian body (SYN, PING, PONG).
    #[must_use]
    pub fn with_u64(ty: MsgType, value: u64) -> Self {
        let mut bytes = vec![0u8; MIN_PACKET_SIZE + 8];
        bytes[AUTH_TAG_SIZE] = ty as u8;
        bytes[MIN_PACKET_SIZE..].copy_from_slice(&value.to_le_bytes());
        Self { bytes }
    }

    /// A content message carrying one coded chunk.
    #[must_use]
    pub fn content(ty: MsgType, payload: &BlockTxPayload) -> Self {
        debug_assert!(ty.is_content());
        let mut bytes = vec![0u8; PACKET_SIZE];
        bytes[AUTH_TAG_SIZE] = ty as u8;
        payload.encode_into(&mut bytes[MIN_PACKET_SIZE..]);
        Self { bytes }
    }

    /// Parse the kind from the (already opened) frame.
    #[must_use]
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_byte(self.bytes[AUTH_TAG_SIZE])
    }

    /// Body past the type byte.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.bytes[MIN_PACKET_SIZE..]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether [`crate::seal`] has already run (nonzero tag).
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.bytes[..AUTH_TAG_SIZE].iter().any(|b| *b != 0)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Decoded body of a BLOCK_HEADER / BLOCK_CONTENTS / TX_CONTENTS message.
#[derive(Debug, Clone)]
pub struct BlockTxPayload {
    /// Low 64 bits of the object's content hash.
    pub hash_prefix: u64,
    /// Total object length in bytes.
    pub obj_length: u32,
    /// 24-bit coded chunk id.
    pub chunk_id: u32,
    pub chunk: Chunk,
}

impl BlockTxPayload {
    fn encode_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), MAX_MESSAGE_SIZE);
        debug_assert!(self.chunk_id < 1 << 24);
        out[0..8].copy_from_slice(&self.hash_prefix.to_le_bytes());
        out[8..12].copy_from_slice(&self.obj_length.to_le_bytes());
        out[12..15].copy_from_slice(&self.chunk_id.to_le_bytes()[..3]);
        out[15..].copy_from_slice(&self.chunk);
    }

    /// Decode from a message body.
    ///
    /// # Errors
    ///
    /// [`WireError::BadLength`] when the body is not header + one chunk.
    pub fn decode(ty: MsgType, body: &[u8]) -> WireResult<Self> {
        if body.len() != MAX_MESSAGE_SIZE {
            return Err(WireError::BadLength {
                ty: ty as u8,
                len: body.len(),
            });
        }
        let hash_prefix = u64::from_le_bytes(body[0..8].try_into().expect("8 bytes"));
        let obj_length = u32::from_le_bytes(body[8..12].try_into().expect("4 bytes"));
        let mut id = [0u8; 4];
        id[..3].copy_from_slice(&body[12..15]);
        let chunk_id = u32::from_le_bytes(id);
        let chunk: Chunk = body[15..].try_into().expect("CHUNK_SIZE bytes");
        Ok(Self {
            hash_prefix,
            obj_length,
            chunk_id,
            chunk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{open, seal};

    #[test]
    fn sizes_line_up() {
        assert_eq!(MAX_MESSAGE_SIZE, 1167);
        assert_eq!(PACKET_SIZE, 1184);
        assert_eq!(MIN_PACKET_SIZE, 17);
    }

    #[test]
    fn type_byte_masks_flags() {
        assert_eq!(MsgType::from_byte(4), Some(MsgType::BlockContents));
        assert_eq!(MsgType::from_byte(4 | 0x40), Some(MsgType::BlockContents));
        assert_eq!(MsgType::from_byte(0x3f), None);
    }

    #[test]
    fn content_payload_roundtrip() {
        let payload = BlockTxPayload {
            hash_prefix: 0x1122_3344_5566_7788,
            obj_length: 2_000_000,
            chunk_id: 0x00ab_cdef,
            chunk: [0x5a; CHUNK_SIZE],
        };
        let msg = WireMessage::content(MsgType::BlockContents, &payload);
        assert_eq!(msg.len(), PACKET_SIZE);
        assert!(!msg.is_sealed());

        let back = BlockTxPayload::decode(MsgType::BlockContents, msg.body()).unwrap();
        assert_eq!(back.hash_prefix, payload.hash_prefix);
        assert_eq!(back.obj_length, payload.obj_length);
        assert_eq!(back.chunk_id, payload.chunk_id);
        assert_eq!(back.chunk, payload.chunk);
    }

    #[test]
    fn payload_header_is_little_endian() {
        let payload = BlockTxPayload {
            hash_prefix: 1,
            obj_length: 2,
            chunk_id: 3,
            chunk: [0; CHUNK_SIZE],
        };
        let msg = WireMessage::content(MsgType::BlockHeader, &payload);
        let body = msg.body();
        assert_eq!(&body[0..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&body[8..12], &[2, 0, 0, 0]);
        assert_eq!(&body[12..15], &[3, 0, 0]);
    }

    #[test]
    fn short_content_body_is_rejected() {
        let err = BlockTxPayload::decode(MsgType::TxContents, &[0u8; 20]).unwrap_err();
        assert!(matches!(err, WireError::BadLength { len: 20, .. }));
    }

    #[test]
    fn sealed_frame_roundtrips_through_open() {
        let payload = BlockTxPayload {
            hash_prefix: 42,
            obj_length: 9999,
            chunk_id: 7,
            chunk: [0xc3; CHUNK_SIZE],
        };
        let mut msg = WireMessage::content(MsgType::TxContents, &payload);
        seal(0x6d75_6c74_6963, msg.as_bytes_mut());
        assert!(msg.is_sealed());

        open(0x6d75_6c74_6963, msg.as_bytes_mut()).unwrap();
        assert_eq!(msg.msg_type(), Some(MsgType::TxContents));
        let back = BlockTxPayload::decode(MsgType::TxContents, msg.body()).unwrap();
        assert_eq!(back.chunk, payload.chunk);
    }

    #[test]
    fn fixed_body_lengths() {
        assert_eq!(MsgType::Keepalive.body_len(), Some(0));
        assert_eq!(MsgType::Syn.body_len(), Some(8));
        assert_eq!(MsgType::BlockContents.body_len(), Some(MAX_MESSAGE_SIZE));
        assert_eq!(WireMessage::with_u64(MsgType::Ping, 5).len(), 25);
        assert_eq!(WireMessage::new(MsgType::Disconnect).len(), 17);
    }
}
