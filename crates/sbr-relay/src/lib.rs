//! The relay node.
//!
//! Wires the FEC pipeline, wire framing, and send scheduler into a running
//! process: socket setup for unicast groups and multicast streams, the
//! single reader thread dispatching datagrams to per-peer partial-block
//! decoders, the backfill thread interleaving coded chunks from a window
//! of historical blocks, and the transaction dribbler feeding the mempool
//! out over multicast at a configured rate.
//!
//! Chain access, mempool iteration, and what happens to a completed block
//! live behind the traits in [`chain`]; the host application provides
//! them.

#![forbid(unsafe_code)]

pub mod backfill;
pub mod chain;
pub mod config;
pub mod dribble;
pub mod messages;
pub mod node;
pub mod partial;
pub mod peers;
pub mod stats;

mod error;

pub use chain::{BlockSink, ChainView, MempoolTx, MempoolView, RelayBlock, TxSink};
pub use config::{
    magic_from_passphrase, multicast_magic, MulticastRxConfig, MulticastTxConfig, RelayConfig,
    UdpPortConfig, UnicastPeerConfig,
};
pub use error::{RelayError, RelayResult};
pub use node::RelayNode;
pub use partial::{parse_chunk_filename, ChunkFileNameParts, PartialBlockRegistry};
