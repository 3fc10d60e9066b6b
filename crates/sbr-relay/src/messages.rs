//! Expanding objects into wire messages.
//!
//! A block becomes its header's packet sequence followed by its body's:
//! the data chunks themselves (ids `0..N`) and then freshly built parity
//! chunks. The body carries a fixed base of extra coded chunks plus a
//! proportional share, so receivers survive loss without a return path.

use sbr_fec::{chunk_count_for_len, FecEncoder, CHUNK_SIZE};
use sbr_wire::{BlockTxPayload, MsgType, WireMessage};

use crate::chain::{MempoolTx, RelayBlock};
use crate::error::RelayResult;

/// Extra coded chunks added to every block body.
pub const BLOCK_BASE_OVERHEAD: usize = 60;

/// Proportional overhead added on top of the base.
pub const BLOCK_OVERHEAD_RATIO: f64 = 0.05;

/// Extra coded chunks for a block header.
pub const HEADER_OVERHEAD_CHUNKS: usize = 3;

/// Extra coded chunks for a transaction.
pub const TX_OVERHEAD_CHUNKS: usize = 2;

/// Parity chunk count for a body of `chunk_count` chunks.
#[must_use]
pub fn body_overhead(chunk_count: usize) -> usize {
    BLOCK_BASE_OVERHEAD + (chunk_count as f64 * BLOCK_OVERHEAD_RATIO).ceil() as usize
}

/// All packets announcing one block: header sequence, then body sequence.
///
/// # Errors
///
/// Propagates encoder construction/build failures (empty or oversized
/// components).
pub fn block_packets(block: &RelayBlock) -> RelayResult<Vec<WireMessage>> {
    let prefix = block.hash_prefix();
    let mut out = Vec::new();
    fill_object(
        &mut out,
        MsgType::BlockHeader,
        prefix,
        &block.header,
        HEADER_OVERHEAD_CHUNKS,
    )?;
    let body_extra = body_overhead(chunk_count_for_len(block.body.len()));
    fill_object(
        &mut out,
        MsgType::BlockContents,
        prefix,
        &block.body,
        body_extra,
    )?;
    Ok(out)
}

/// Packets carrying one mempool transaction.
///
/// # Errors
///
/// Propagates encoder failures.
pub fn tx_packets(tx: &MempoolTx) -> RelayResult<Vec<WireMessage>> {
    let mut out = Vec::new();
    fill_object(
        &mut out,
        MsgType::TxContents,
        tx.hash_prefix(),
        &tx.raw,
        TX_OVERHEAD_CHUNKS,
    )?;
    Ok(out)
}

fn fill_object(
    out: &mut Vec<WireMessage>,
    ty: MsgType,
    hash_prefix: u64,
    data: &[u8],
    extra: usize,
) -> RelayResult<()> {
    let n = chunk_count_for_len(data.len());
    let obj_length = data.len() as u32;

    if n <= 1 {
        // Single-chunk objects are simply repeated.
        let mut enc = FecEncoder::new(data, 1 + extra)?;
        enc.prefill()?;
        for i in 0..enc.slot_count() {
            let (chunk, chunk_id) = enc.chunk(i).expect("prefilled");
            out.push(WireMessage::content(
                ty,
                &BlockTxPayload {
                    hash_prefix,
                    obj_length,
                    chunk_id,
                    chunk: *chunk,
                },
            ));
        }
        return Ok(());
    }

    for i in 0..n {
        let mut chunk = [0u8; CHUNK_SIZE];
        let start = i * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(data.len());
        chunk[..end - start].copy_from_slice(&data[start..end]);
        out.push(WireMessage::content(
            ty,
            &BlockTxPayload {
                hash_prefix,
                obj_length,
                chunk_id: i as u32,
                chunk,
            },
        ));
    }
    if extra > 0 {
        let mut enc = FecEncoder::new(data, extra)?;
        enc.prefill()?;
        for i in 0..extra {
            let (chunk, chunk_id) = enc.chunk(i).expect("prefilled");
            out.push(WireMessage::content(
                ty,
                &BlockTxPayload {
                    hash_prefix,
                    obj_length,
                    chunk_id,
                    chunk: *chunk,
                },
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn block(header_len: usize, body_len: usize) -> RelayBlock {
        RelayBlock {
            height: 7,
            hash: [0x42; 32],
            header: vec![1; header_len],
            body: vec![2; body_len],
        }
    }

    #[test]
    fn block_packets_cover_header_then_body() {
        let b = block(80, 3 * CHUNK_SIZE);
        let msgs = block_packets(&b).unwrap();
        // 1 + HEADER_OVERHEAD_CHUNKS header packets, then body packets.
        let headers = msgs
            .iter()
            .take_while(|m| m.msg_type() == Some(MsgType::BlockHeader))
            .count();
        assert_eq!(headers, 1 + HEADER_OVERHEAD_CHUNKS);
        let bodies = msgs.len() - headers;
        assert_eq!(bodies, 3 + body_overhead(3));
        assert!(msgs[headers..]
            .iter()
            .all(|m| m.msg_type() == Some(MsgType::BlockContents)));
    }

    #[test]
    fn body_data_chunks_carry_source_bytes() {
        let b = block(80, 2 * CHUNK_SIZE);
        let msgs = block_packets(&b).unwrap();
        let first_body = msgs
            .iter()
            .find(|m| m.msg_type() == Some(MsgType::BlockContents))
            .unwrap();
        let payload = BlockTxPayload::decode(MsgType::BlockContents, first_body.body()).unwrap();
        assert_eq!(payload.chunk_id, 0);
        assert_eq!(payload.obj_length as usize, 2 * CHUNK_SIZE);
        assert_eq!(payload.hash_prefix, b.hash_prefix());
        assert!(payload.chunk.iter().all(|v| *v == 2));
    }

    #[test]
    fn tx_packets_expand_small_transactions() {
        let tx = MempoolTx {
            txid: [9; 32],
            raw: Arc::new(vec![3; 250]),
            depends: vec![],
        };
        let msgs = tx_packets(&tx).unwrap();
        assert_eq!(msgs.len(), 1 + TX_OVERHEAD_CHUNKS);
        for m in &msgs {
            assert_eq!(m.msg_type(), Some(MsgType::TxContents));
        }
    }
}
