//! Sender-to-receiver pipeline without sockets: expand objects to
//! packets, lose and reorder some, feed the registry, compare bytes.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use sbr_fec::{CodecPool, CHUNK_SIZE};
use sbr_relay::chain::{MempoolTx, RelayBlock};
use sbr_relay::messages::{block_packets, tx_packets};
use sbr_relay::{BlockSink, PartialBlockRegistry, TxSink};
use sbr_wire::{BlockTxPayload, MsgType, WireMessage};

#[derive(Default)]
struct CaptureBlocks(Mutex<Vec<(u64, Vec<u8>, Vec<u8>)>>);

impl BlockSink for CaptureBlocks {
    fn block_completed(&self, _peer: SocketAddr, prefix: u64, header: Vec<u8>, body: Vec<u8>) {
        self.0.lock().push((prefix, header, body));
    }
}

#[derive(Default)]
struct CaptureTxs(Mutex<Vec<Vec<u8>>>);

impl TxSink for CaptureTxs {
    fn tx_completed(&self, _peer: SocketAddr, tx: Vec<u8>) {
        self.0.lock().push(tx);
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

fn feed(
    registry: &PartialBlockRegistry,
    peer: SocketAddr,
    msgs: &[WireMessage],
) -> Result<(), sbr_relay::RelayError> {
    for msg in msgs {
        let ty = msg.msg_type().unwrap();
        let payload = BlockTxPayload::decode(ty, msg.body()).unwrap();
        registry.handle_content(peer, ty, &payload)?;
    }
    Ok(())
}

#[test]
fn block_survives_loss_and_reorder() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = Arc::new(CaptureBlocks::default());
    let txs = Arc::new(CaptureTxs::default());
    let registry = PartialBlockRegistry::new(
        dir.path().to_path_buf(),
        CodecPool::new(),
        Arc::clone(&blocks) as Arc<dyn BlockSink>,
        Arc::clone(&txs) as Arc<dyn TxSink>,
    )
    .unwrap();

    let block = RelayBlock {
        height: 812_345,
        hash: {
            let mut h = [0u8; 32];
            rand::thread_rng().fill(&mut h[..]);
            h
        },
        header: random_bytes(80),
        body: random_bytes(5 * CHUNK_SIZE + 123),
    };
    let mut msgs = block_packets(&block).unwrap();

    // A lossy, reordering network: shuffle everything and lose a handful.
    let mut rng = rand::thread_rng();
    msgs.shuffle(&mut rng);
    for _ in 0..5 {
        msgs.remove(rng.gen_range(0..msgs.len()));
    }

    let peer: SocketAddr = "198.51.100.7:8123".parse().unwrap();
    feed(&registry, peer, &msgs).unwrap();

    let captured = blocks.0.lock();
    assert_eq!(captured.len(), 1);
    let (prefix, header, body) = &captured[0];
    assert_eq!(*prefix, block.hash_prefix());
    assert_eq!(header, &block.header);
    assert_eq!(body, &block.body);

    // The consumed partial block is gone, chunk files included.
    assert_eq!(registry.in_flight_blocks(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = Arc::new(CaptureBlocks::default());
    let registry = PartialBlockRegistry::new(
        dir.path().to_path_buf(),
        CodecPool::new(),
        Arc::clone(&blocks) as Arc<dyn BlockSink>,
        Arc::new(CaptureTxs::default()) as Arc<dyn TxSink>,
    )
    .unwrap();

    let block = RelayBlock {
        height: 1,
        hash: [7; 32],
        header: random_bytes(80),
        body: random_bytes(2 * CHUNK_SIZE),
    };
    let msgs = block_packets(&block).unwrap();
    let peer: SocketAddr = "198.51.100.7:8123".parse().unwrap();
    feed(&registry, peer, &msgs).unwrap();
    feed(&registry, peer, &msgs).unwrap();

    assert_eq!(blocks.0.lock().len(), 1);
}

#[test]
fn transaction_pipeline_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let txs = Arc::new(CaptureTxs::default());
    let registry = PartialBlockRegistry::new(
        dir.path().to_path_buf(),
        CodecPool::new(),
        Arc::new(CaptureBlocks::default()) as Arc<dyn BlockSink>,
        Arc::clone(&txs) as Arc<dyn TxSink>,
    )
    .unwrap();

    let tx = MempoolTx {
        txid: [3; 32],
        raw: Arc::new(random_bytes(2 * CHUNK_SIZE + 77)),
        depends: vec![],
    };
    let mut msgs = tx_packets(&tx).unwrap();
    // Drop one coded chunk; the overhead covers it.
    msgs.remove(1);

    let peer: SocketAddr = "198.51.100.7:8123".parse().unwrap();
    feed(&registry, peer, &msgs).unwrap();

    let captured = txs.0.lock();
    assert_eq!(captured.len(), 1);
    assert_eq!(&captured[0], tx.raw.as_ref());
}

#[test]
fn oversized_object_is_a_protocol_violation() {
    let dir = tempfile::tempdir().unwrap();
    let registry = PartialBlockRegistry::new(
        dir.path().to_path_buf(),
        CodecPool::new(),
        Arc::new(CaptureBlocks::default()) as Arc<dyn BlockSink>,
        Arc::new(CaptureTxs::default()) as Arc<dyn TxSink>,
    )
    .unwrap();

    let payload = BlockTxPayload {
        hash_prefix: 9,
        obj_length: u32::MAX,
        chunk_id: 0,
        chunk: [0; CHUNK_SIZE],
    };
    let peer: SocketAddr = "198.51.100.7:8123".parse().unwrap();
    let err = registry
        .handle_content(peer, MsgType::BlockContents, &payload)
        .unwrap_err();
    assert!(matches!(err, sbr_relay::RelayError::ProtocolViolation(_)));
}
