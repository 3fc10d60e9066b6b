//! Seams to the host application.
//!
//! The relay never interprets block or transaction bytes; it reads blocks
//! and mempool entries through these traits and hands reassembled objects
//! back through the sinks. Serialization, chain state, and compact-block
//! reconstruction all live on the host side.

use std::net::SocketAddr;
use std::sync::Arc;

/// A block as the relay sees it: opaque header and body bytes.
#[derive(Debug, Clone)]
pub struct RelayBlock {
    pub height: u64,
    /// Content hash of the block.
    pub hash: [u8; 32],
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl RelayBlock {
    /// Wire identifier: low 64 bits of the hash, little-endian.
    #[must_use]
    pub fn hash_prefix(&self) -> u64 {
        u64::from_le_bytes(self.hash[..8].try_into().expect("8 bytes"))
    }
}

/// One mempool transaction with its in-mempool dependencies.
#[derive(Debug, Clone)]
pub struct MempoolTx {
    pub txid: [u8; 32],
    pub raw: Arc<Vec<u8>>,
    /// Txids of in-mempool parents.
    pub depends: Vec<[u8; 32]>,
}

impl MempoolTx {
    #[must_use]
    pub fn hash_prefix(&self) -> u64 {
        u64::from_le_bytes(self.txid[..8].try_into().expect("8 bytes"))
    }
}

/// Chain state queries the backfill thread needs.
pub trait ChainView: Send + Sync {
    /// Whether the node is still syncing; backfill waits this out.
    fn is_initial_block_download(&self) -> bool;

    /// Current tip height, `None` before any block.
    fn height(&self) -> Option<u64>;

    /// Read the block at `height` from disk.
    fn block_at(&self, height: u64) -> Option<RelayBlock>;
}

/// Mempool access for the transaction dribbler.
pub trait MempoolView: Send + Sync {
    /// Entries in ancestor-score order (best first).
    fn ancestor_score_order(&self) -> Vec<MempoolTx>;

    /// Look up an entry by txid.
    fn get(&self, txid: &[u8; 32]) -> Option<MempoolTx>;
}

/// Receives fully reassembled blocks.
pub trait BlockSink: Send + Sync {
    fn block_completed(
        &self,
        peer: SocketAddr,
        hash_prefix: u64,
        header: Vec<u8>,
        body: Vec<u8>,
    );
}

/// Receives fully reassembled transactions.
pub trait TxSink: Send + Sync {
    fn tx_completed(&self, peer: SocketAddr, tx: Vec<u8>);
}
