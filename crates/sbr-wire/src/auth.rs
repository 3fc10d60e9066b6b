//! Datagram authentication: keyed tag plus body scramble.

use subtle::ConstantTimeEq;

use crate::error::{WireError, WireResult};

/// Authenticator size at the front of every datagram.
pub const AUTH_TAG_SIZE: usize = 16;

/// Expand the 64-bit connection magic into the 32-byte MAC key by
/// replicating it four times, little-endian.
#[must_use]
pub fn key_from_magic(magic: u64) -> [u8; 32] {
    let le = magic.to_le_bytes();
    let mut key = [0u8; 32];
    for part in key.chunks_exact_mut(8) {
        part.copy_from_slice(&le);
    }
    key
}

fn tag_over(key: &[u8; 32], body: &[u8]) -> [u8; AUTH_TAG_SIZE] {
    let hash = blake3::keyed_hash(key, body);
    let mut tag = [0u8; AUTH_TAG_SIZE];
    tag.copy_from_slice(&hash.as_bytes()[..AUTH_TAG_SIZE]);
    tag
}

/// XOR the body in 8-byte groups with the two tag halves, alternating.
/// Self-inverse.
fn scramble(body: &mut [u8], tag: &[u8; AUTH_TAG_SIZE]) {
    for (k, group) in body.chunks_mut(8).enumerate() {
        let half = &tag[(k % 2) * 8..(k % 2) * 8 + 8];
        for (b, t) in group.iter_mut().zip(half) {
            *b ^= t;
        }
    }
}

/// Tag and scramble an outgoing datagram in place. `bytes` is the full
/// frame: 16 tag bytes (overwritten) followed by the body.
///
/// # Panics
///
/// Panics if `bytes` is shorter than the tag; frames are built by
/// [`crate::WireMessage`], which always reserves it.
pub fn seal(magic: u64, bytes: &mut [u8]) {
    assert!(bytes.len() >= AUTH_TAG_SIZE);
    let key = key_from_magic(magic);
    let (tag_bytes, body) = bytes.split_at_mut(AUTH_TAG_SIZE);
    let tag = tag_over(&key, body);
    scramble(body, &tag);
    tag_bytes.copy_from_slice(&tag);
}

/// Unscramble and verify an incoming datagram in place. On success the
/// body bytes are plaintext; on failure the frame contents are
/// unspecified and the caller drops the packet.
///
/// # Errors
///
/// [`WireError::TooShort`] or [`WireError::Auth`].
pub fn open(magic: u64, bytes: &mut [u8]) -> WireResult<()> {
    if bytes.len() < AUTH_TAG_SIZE {
        return Err(WireError::TooShort { len: bytes.len() });
    }
    let key = key_from_magic(magic);
    let (tag_bytes, body) = bytes.split_at_mut(AUTH_TAG_SIZE);
    let mut tag = [0u8; AUTH_TAG_SIZE];
    tag.copy_from_slice(tag_bytes);
    scramble(body, &tag);
    let expect = tag_over(&key, body);
    if expect.ct_eq(&tag).into() {
        Ok(())
    } else {
        Err(WireError::Auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let mut frame = vec![0u8; AUTH_TAG_SIZE];
        frame.extend_from_slice(b"\x04some message body bytes");
        let plain = frame.clone();

        seal(0xdead_beef_cafe_f00d, &mut frame);
        assert_ne!(frame[AUTH_TAG_SIZE..], plain[AUTH_TAG_SIZE..], "scrambled");

        open(0xdead_beef_cafe_f00d, &mut frame).unwrap();
        assert_eq!(frame[AUTH_TAG_SIZE..], plain[AUTH_TAG_SIZE..]);
    }

    #[test]
    fn wrong_magic_fails() {
        let mut frame = vec![0u8; AUTH_TAG_SIZE + 20];
        frame[AUTH_TAG_SIZE] = 3;
        seal(1, &mut frame);
        assert_eq!(open(2, &mut frame), Err(WireError::Auth));
    }

    #[test]
    fn tampered_body_fails() {
        let mut frame = vec![0u8; AUTH_TAG_SIZE + 33];
        seal(77, &mut frame);
        *frame.last_mut().unwrap() ^= 1;
        assert_eq!(open(77, &mut frame), Err(WireError::Auth));
    }

    #[test]
    fn tampered_tag_fails() {
        let mut frame = vec![0u8; AUTH_TAG_SIZE + 33];
        seal(77, &mut frame);
        frame[0] ^= 0x80;
        assert_eq!(open(77, &mut frame), Err(WireError::Auth));
    }

    #[test]
    fn scramble_is_self_inverse_on_odd_tail() {
        // Body length not a multiple of 8 exercises the ragged last group.
        let tag = [0xa5u8; AUTH_TAG_SIZE];
        let mut body = (0u8..21).collect::<Vec<_>>();
        let orig = body.clone();
        scramble(&mut body, &tag);
        scramble(&mut body, &tag);
        assert_eq!(body, orig);
    }

    #[test]
    fn key_replicates_magic() {
        let key = key_from_magic(0x0102_0304_0506_0708);
        assert_eq!(&key[..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&key[..8], &key[8..16]);
        assert_eq!(&key[..8], &key[24..32]);
    }
}
