//! Partial objects in flight and their crash recovery.
//!
//! Each `(hash_prefix, peer)` pair owns a [`PartialBlock`]: a header
//! decoder and a body decoder, created lazily as chunks for either
//! component arrive. Block decoders spill to chunk files named
//! `<ip>_<port>_<hash_prefix>_<body|header>_<len>` under the
//! `partial_blocks` directory; on startup the directory is scanned, files
//! with parseable names are reattached, everything else is deleted.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use sbr_fec::{chunk_count_for_len, CodecPool, FecDecoder, MAX_CHUNK_COUNT, MAX_OBJECT_SIZE};
use sbr_wire::{BlockTxPayload, MsgType};

use crate::chain::{BlockSink, TxSink};
use crate::error::{RelayError, RelayResult};

/// In-flight partial blocks kept per process before eviction starts.
const MAX_IN_FLIGHT_BLOCKS: usize = 512;

/// In-flight partial transactions per process.
const MAX_IN_FLIGHT_TXS: usize = 64;

/// Parsed form of a persisted chunk filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFileNameParts {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub hash_prefix: u64,
    pub is_header: bool,
    pub length: u64,
}

impl ChunkFileNameParts {
    /// The peer this file belonged to.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Object id without the trailing length (the decoder appends it).
    #[must_use]
    pub fn object_id(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.ip,
            self.port,
            self.hash_prefix,
            if self.is_header { "header" } else { "body" }
        )
    }
}

impl fmt::Display for ChunkFileNameParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.object_id(), self.length)
    }
}

/// Strict parse of `<ip>_<port>_<hash_prefix>_<body|header>_<len>`.
/// Anything else is unrecoverable and gets deleted by the startup scan.
#[must_use]
pub fn parse_chunk_filename(name: &str) -> Option<ChunkFileNameParts> {
    let fields: Vec<&str> = name.split('_').collect();
    if fields.len() != 5 {
        return None;
    }
    let ip: Ipv4Addr = fields[0].parse().ok()?;
    // Dotted quad only; the parser above also accepts nothing else.
    if fields[0].split('.').count() != 4 {
        return None;
    }
    let port: u16 = fields[1].parse().ok()?;
    let hash_prefix: u64 = fields[2].parse().ok()?;
    let is_header = match fields[3] {
        "header" => true,
        "body" => false,
        _ => return None,
    };
    let length: u64 = fields[4].parse().ok()?;
    if length == 0 {
        return None;
    }
    Some(ChunkFileNameParts {
        ip,
        port,
        hash_prefix,
        is_header,
        length,
    })
}

/// Header and body decoders for one `(hash_prefix, peer)` key.
///
/// After both components are consumed the entry lingers, decoders freed,
/// as a marker absorbing late chunks of the already-delivered block until
/// inactivity eviction clears it.
pub struct PartialBlock {
    pub hash_prefix: u64,
    pub peer: SocketAddr,
    pub header_initialized: bool,
    pub body_initialized: bool,
    pub header_len: usize,
    pub body_len: usize,
    header_decoder: Option<FecDecoder>,
    body_decoder: Option<FecDecoder>,
    completed: bool,
    last_activity: Instant,
}

impl PartialBlock {
    fn new(hash_prefix: u64, peer: SocketAddr) -> Self {
        Self {
            hash_prefix,
            peer,
            header_initialized: false,
            body_initialized: false,
            header_len: 0,
            body_len: 0,
            header_decoder: None,
            body_decoder: None,
            completed: false,
            last_activity: Instant::now(),
        }
    }

    /// Whether the block was already reassembled and delivered.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn header_decoder(&self) -> Option<&FecDecoder> {
        self.header_decoder.as_ref()
    }

    #[must_use]
    pub fn body_decoder(&self) -> Option<&FecDecoder> {
        self.body_decoder.as_ref()
    }

    /// Whether the header component is decodable (or was already).
    #[must_use]
    pub fn header_ready(&self) -> bool {
        self.header_decoder.as_ref().is_some_and(FecDecoder::is_ready)
    }

    #[must_use]
    pub fn body_ready(&self) -> bool {
        self.body_decoder.as_ref().is_some_and(FecDecoder::is_ready)
    }
}

type BlockKey = (u64, SocketAddr);

/// Owns every in-flight partial object, the chunk-file directory, and the
/// completion sinks.
pub struct PartialBlockRegistry {
    dir: PathBuf,
    pool: Arc<CodecPool>,
    blocks: Mutex<HashMap<BlockKey, Arc<Mutex<PartialBlock>>>>,
    /// Transaction decoders; `None` marks an already-delivered
    /// transaction still absorbing late chunks.
    txs: Mutex<HashMap<BlockKey, (Option<FecDecoder>, Instant)>>,
    block_sink: Arc<dyn BlockSink>,
    tx_sink: Arc<dyn TxSink>,
}

impl PartialBlockRegistry {
    /// Create the registry and its on-disk directory.
    ///
    /// # Errors
    ///
    /// Directory creation failure.
    pub fn new(
        dir: PathBuf,
        pool: Arc<CodecPool>,
        block_sink: Arc<dyn BlockSink>,
        tx_sink: Arc<dyn TxSink>,
    ) -> RelayResult<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            pool,
            blocks: Mutex::new(HashMap::new()),
            txs: Mutex::new(HashMap::new()),
            block_sink,
            tx_sink,
        })
    }

    /// Blocks still being collected (delivered markers excluded).
    #[must_use]
    pub fn in_flight_blocks(&self) -> usize {
        self.blocks
            .lock()
            .values()
            .filter(|b| !b.lock().completed)
            .count()
    }

    /// Peek at one partial block.
    #[must_use]
    pub fn get(&self, hash_prefix: u64, peer: SocketAddr) -> Option<Arc<Mutex<PartialBlock>>> {
        self.blocks.lock().get(&(hash_prefix, peer)).cloned()
    }

    /// Dispatch one authenticated content message.
    ///
    /// # Errors
    ///
    /// [`RelayError::ProtocolViolation`] for malformed object parameters —
    /// the caller applies the unicast/multicast disconnect policy.
    pub fn handle_content(
        &self,
        peer: SocketAddr,
        ty: MsgType,
        payload: &BlockTxPayload,
    ) -> RelayResult<()> {
        let obj_length = payload.obj_length as usize;
        if obj_length == 0 || obj_length > MAX_OBJECT_SIZE {
            return Err(RelayError::ProtocolViolation(format!(
                "object length {obj_length} out of range"
            )));
        }
        if chunk_count_for_len(obj_length) > MAX_CHUNK_COUNT {
            return Err(RelayError::ProtocolViolation(
                "object chunk count exceeds the block limit".into(),
            ));
        }
        match ty {
            MsgType::BlockHeader | MsgType::BlockContents => {
                self.handle_block_chunk(peer, ty == MsgType::BlockHeader, payload)
            }
            MsgType::TxContents => self.handle_tx_chunk(peer, payload),
            _ => Err(RelayError::ProtocolViolation(format!(
                "non-content message {ty:?} routed to the registry"
            ))),
        }
    }

    fn handle_block_chunk(
        &self,
        peer: SocketAddr,
        is_header: bool,
        payload: &BlockTxPayload,
    ) -> RelayResult<()> {
        let key = (payload.hash_prefix, peer);
        let entry = {
            let mut blocks = self.blocks.lock();
            if blocks.len() >= MAX_IN_FLIGHT_BLOCKS && !blocks.contains_key(&key) {
                Self::evict_oldest(&mut blocks);
            }
            Arc::clone(blocks.entry(key).or_insert_with(|| {
                Arc::new(Mutex::new(PartialBlock::new(payload.hash_prefix, peer)))
            }))
        };

        let mut block = entry.lock();
        if block.completed {
            // A late chunk of a block already delivered upstream.
            return Ok(());
        }
        block.last_activity = Instant::now();
        let obj_length = payload.obj_length as usize;

        let (initialized, expected_len) = if is_header {
            (block.header_initialized, block.header_len)
        } else {
            (block.body_initialized, block.body_len)
        };
        if initialized && expected_len != obj_length {
            return Err(RelayError::ProtocolViolation(format!(
                "object length changed mid-flight ({expected_len} then {obj_length})"
            )));
        }
        if !initialized {
            let parts = ChunkFileNameParts {
                ip: match peer.ip() {
                    std::net::IpAddr::V4(ip) => ip,
                    std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                },
                port: peer.port(),
                hash_prefix: payload.hash_prefix,
                is_header,
                length: obj_length as u64,
            };
            let decoder = FecDecoder::new_mmap(
                &self.dir,
                Some(&parts.object_id()),
                obj_length,
                false,
                &self.pool,
            )?;
            if is_header {
                block.header_decoder = Some(decoder);
                block.header_initialized = true;
                block.header_len = obj_length;
            } else {
                block.body_decoder = Some(decoder);
                block.body_initialized = true;
                block.body_len = obj_length;
            }
        }

        let decoder = if is_header {
            block.header_decoder.as_mut()
        } else {
            block.body_decoder.as_mut()
        }
        .expect("decoder initialised above");

        match decoder.provide(&payload.chunk, payload.chunk_id) {
            Ok(_) => {}
            Err(sbr_fec::FecError::InvalidChunkId { id, max }) => {
                return Err(RelayError::ProtocolViolation(format!(
                    "chunk id {id} exceeds {max}"
                )));
            }
            Err(sbr_fec::FecError::Failed) => {
                // Terminal decoder: drop the whole partial block.
                drop(block);
                self.blocks.lock().remove(&key);
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(%err, prefix = payload.hash_prefix, "chunk rejected");
                drop(block);
                self.blocks.lock().remove(&key);
                return Ok(());
            }
        }

        if block.header_ready() && block.body_ready() {
            let header = block
                .header_decoder
                .as_mut()
                .expect("header decoder present")
                .take_decoded()?;
            let body = block
                .body_decoder
                .as_mut()
                .expect("body decoder present")
                .take_decoded()?;
            // Free the decoders (and their chunk files); the entry stays
            // behind to absorb late chunks.
            block.header_decoder = None;
            block.body_decoder = None;
            block.completed = true;
            block.last_activity = Instant::now();
            let prefix = block.hash_prefix;
            drop(block);
            tracing::debug!(prefix, peer = %peer, "block reassembled");
            self.block_sink.block_completed(peer, prefix, header, body);
        }
        Ok(())
    }

    fn handle_tx_chunk(&self, peer: SocketAddr, payload: &BlockTxPayload) -> RelayResult<()> {
        let key = (payload.hash_prefix, peer);
        let mut txs = self.txs.lock();
        if !txs.contains_key(&key) && txs.len() >= MAX_IN_FLIGHT_TXS {
            if let Some(oldest) = txs
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| *k)
            {
                txs.remove(&oldest);
            }
        }
        let slot = match txs.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let decoder = FecDecoder::new_in_memory(payload.obj_length as usize)?;
                v.insert((Some(decoder), Instant::now()))
            }
        };
        slot.1 = Instant::now();
        let Some(decoder) = slot.0.as_mut() else {
            // Late chunk of a transaction already delivered.
            return Ok(());
        };
        if decoder.object_len() != payload.obj_length as usize {
            return Err(RelayError::ProtocolViolation(
                "transaction length changed mid-flight".into(),
            ));
        }
        match decoder.provide(&payload.chunk, payload.chunk_id) {
            Ok(_) => {}
            Err(sbr_fec::FecError::InvalidChunkId { id, max }) => {
                return Err(RelayError::ProtocolViolation(format!(
                    "chunk id {id} exceeds {max}"
                )));
            }
            Err(err) => {
                tracing::debug!(%err, "transaction chunk rejected");
                txs.remove(&key);
                return Ok(());
            }
        }
        if decoder.is_ready() {
            let tx = decoder.take_decoded()?;
            slot.0 = None;
            drop(txs);
            self.tx_sink.tx_completed(peer, tx);
        }
        Ok(())
    }

    fn evict_oldest(blocks: &mut HashMap<BlockKey, Arc<Mutex<PartialBlock>>>) {
        if let Some(key) = blocks
            .iter()
            .min_by_key(|(_, b)| b.lock().last_activity)
            .map(|(k, _)| *k)
        {
            blocks.remove(&key);
            tracing::debug!(prefix = key.0, "evicted stalest partial block");
        }
    }

    /// Drop partial objects idle longer than `max_age`.
    pub fn evict_stale(&self, max_age: Duration) {
        let cutoff = Instant::now() - max_age;
        self.blocks
            .lock()
            .retain(|_, b| b.lock().last_activity >= cutoff);
        self.txs.lock().retain(|_, (_, at)| *at >= cutoff);
    }

    /// Scan the chunk-file directory: reattach every recoverable file to a
    /// fresh [`PartialBlock`], delete everything else. Returns how many
    /// files were reattached.
    pub fn load_partial_blocks(&self) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), %err, "cannot scan partial blocks");
                return 0;
            }
        };
        let mut recovered = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                let _ = std::fs::remove_file(&path);
                continue;
            };
            let Some(parts) = parse_chunk_filename(name) else {
                tracing::debug!(file = name, "removing unrecognised chunk file");
                let _ = std::fs::remove_file(&path);
                continue;
            };
            match self.reattach(&parts) {
                Ok(()) => recovered += 1,
                Err(err) => {
                    tracing::warn!(file = name, %err, "chunk file unrecoverable, removing");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        tracing::info!(recovered, "partial block scan complete");
        recovered
    }

    fn reattach(&self, parts: &ChunkFileNameParts) -> RelayResult<()> {
        let peer = parts.peer();
        let key = (parts.hash_prefix, peer);
        let decoder = FecDecoder::new_mmap(
            &self.dir,
            Some(&parts.object_id()),
            parts.length as usize,
            false,
            &self.pool,
        )?;
        let entry = {
            let mut blocks = self.blocks.lock();
            Arc::clone(blocks.entry(key).or_insert_with(|| {
                Arc::new(Mutex::new(PartialBlock::new(parts.hash_prefix, peer)))
            }))
        };
        let mut block = entry.lock();
        if parts.is_header {
            block.header_decoder = Some(decoder);
            block.header_initialized = true;
            block.header_len = parts.length as usize;
        } else {
            block.body_decoder = Some(decoder);
            block.body_initialized = true;
            block.body_len = parts.length as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_parse_rejects_every_malformation() {
        for bad in [
            "_8080_1234_body_2000",               // missing ip
            "256.16.235.1_8080_1234_body_2000",   // octet out of range
            "172.16.235.1_1234_body_2000",        // missing port
            "172.16.235.1_8080_body_2000",        // missing hash prefix
            "172.16.235.1_8080_1234_2000",        // missing component tag
            "172.16.235.1_8080_1234_body_",       // missing length
            "172.16.235.1_8080-1234_body_2000",   // wrong delimiter
            "172.16.235.1_8080_abc_body_2000",    // non-decimal hash prefix
            "172.16.235.1_8080_1234_test_2000",   // unknown component tag
            "172.16.235.1_8080_1234_body_g2000",  // non-decimal length
            "172.16.235:1_8080_1234_body_2000",   // legacy ip:port form
            "172.16.235.1_99999_1234_body_2000",  // port out of range
        ] {
            assert!(parse_chunk_filename(bad).is_none(), "{bad}");
        }
    }

    #[test]
    fn filename_parse_accepts_valid_forms() {
        let parts = parse_chunk_filename("172.16.235.1_8080_1234_body_2000").unwrap();
        assert_eq!(parts.ip, Ipv4Addr::new(172, 16, 235, 1));
        assert_eq!(parts.port, 8080);
        assert_eq!(parts.hash_prefix, 1234);
        assert!(!parts.is_header);
        assert_eq!(parts.length, 2000);

        let parts = parse_chunk_filename("172.16.235.1_9560_12345678_header_2097152").unwrap();
        assert_eq!(parts.port, 9560);
        assert_eq!(parts.hash_prefix, 12345678);
        assert!(parts.is_header);
        assert_eq!(parts.length, 2097152);

        // Trusted-peer wildcard form.
        assert!(parse_chunk_filename("0.0.0.0_0_12345678_header_10000").is_some());
    }

    #[test]
    fn filename_roundtrips_through_display() {
        for name in [
            "172.16.235.1_8080_1234_body_2000",
            "172.16.235.1_9560_12345678_header_2097152",
            "0.0.0.0_0_1_body_1",
        ] {
            let parts = parse_chunk_filename(name).unwrap();
            assert_eq!(parts.to_string(), name);
        }
    }
}
