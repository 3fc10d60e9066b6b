//! Mempool transaction dribble.
//!
//! A multicast transmit stream with `txn_per_sec > 0` trickles mempool
//! transactions into the group's transaction buffer in ancestor-score
//! order. A rolling approximate set of recently sent txids suppresses
//! retransmission; a transaction whose in-mempool ancestors have not been
//! dribbled yet pulls those ancestors along, parents first.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::*;

use sbr_queue::{BufferId, OutboundPacket, QueueSignal, Throttle, TxQueueGroup};

use crate::chain::{ChainView, MempoolTx, MempoolView};
use crate::config::{multicast_magic, MulticastTxConfig};
use crate::messages;

/// Entries the rolling filter holds before cycling a generation
/// (roughly a day of busy mempool turnover).
pub const SENT_TXN_CAPACITY: usize = 500_000;

/// Target false-positive rate of the rolling filter.
pub const SENT_TXN_FPR: f64 = 0.001;

/// Transactions dribbled so far on one stream.
#[derive(Debug, Default)]
pub struct TxnDribbleStats {
    pub tx_count: AtomicU64,
}

struct BloomGeneration {
    bits: BitVec<u64, Lsb0>,
    entries: usize,
}

impl BloomGeneration {
    fn new(m_bits: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; m_bits],
            entries: 0,
        }
    }

    fn indices(m_bits: usize, k: usize, item: &[u8]) -> impl Iterator<Item = usize> {
        let mut h1 = std::collections::hash_map::DefaultHasher::new();
        0x6272_6c6fu64.hash(&mut h1);
        item.hash(&mut h1);
        let h1 = h1.finish();
        let mut h2 = std::collections::hash_map::DefaultHasher::new();
        0x736e_6f77u64.hash(&mut h2);
        item.hash(&mut h2);
        let h2 = h2.finish() | 1;
        (0..k as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m_bits as u64) as usize)
    }

    fn insert(&mut self, m_bits: usize, k: usize, item: &[u8]) {
        for idx in Self::indices(m_bits, k, item) {
            self.bits.set(idx, true);
        }
        self.entries += 1;
    }

    fn contains(&self, m_bits: usize, k: usize, item: &[u8]) -> bool {
        Self::indices(m_bits, k, item).all(|idx| self.bits[idx])
    }
}

/// Two-generation Bloom filter: always remembers at least the last
/// `capacity` inserts, forgets in generation-sized steps.
pub struct RollingTxFilter {
    generations: [BloomGeneration; 2],
    current: usize,
    per_generation: usize,
    m_bits: usize,
    k: usize,
}

impl RollingTxFilter {
    #[must_use]
    pub fn new(capacity: usize, fpr: f64) -> Self {
        let n = capacity.max(1);
        // Standard sizing: m = -n·ln(p)/ln(2)², k = (m/n)·ln(2).
        let m_bits = (-(n as f64) * fpr.ln() / std::f64::consts::LN_2.powi(2)).ceil() as usize;
        let m_bits = m_bits.max(64);
        let k = ((m_bits as f64 / n as f64) * std::f64::consts::LN_2).ceil() as usize;
        let k = k.clamp(1, 30);
        Self {
            generations: [BloomGeneration::new(m_bits), BloomGeneration::new(m_bits)],
            current: 0,
            per_generation: n,
            m_bits,
            k,
        }
    }

    pub fn insert(&mut self, item: &[u8]) {
        if self.generations[self.current].entries >= self.per_generation {
            let old = 1 - self.current;
            self.generations[old] = BloomGeneration::new(self.m_bits);
            self.current = old;
        }
        let (m, k) = (self.m_bits, self.k);
        self.generations[self.current].insert(m, k, item);
    }

    #[must_use]
    pub fn contains(&self, item: &[u8]) -> bool {
        self.generations
            .iter()
            .any(|g| g.contains(self.m_bits, self.k, item))
    }
}

/// Pull up to `quota` transactions in ancestor-score order, expanding each
/// with its not-yet-sent in-mempool ancestors, parents first.
pub fn select_batch(
    mempool: &dyn MempoolView,
    quota: usize,
    filter: &mut RollingTxFilter,
) -> Vec<MempoolTx> {
    let mut out: Vec<MempoolTx> = Vec::new();
    let mut selected: HashSet<[u8; 32]> = HashSet::new();
    for entry in mempool.ancestor_score_order() {
        if out.len() >= quota {
            break;
        }
        if selected.contains(&entry.txid) || filter.contains(&entry.txid) {
            continue;
        }
        let mut to_add = vec![entry];
        while let Some(top) = to_add.last() {
            let deps = top.depends.clone();
            let mut has_dep = false;
            for parent in deps {
                if !selected.contains(&parent) && !filter.contains(&parent) {
                    if let Some(p) = mempool.get(&parent) {
                        to_add.push(p);
                        has_dep = true;
                    }
                }
            }
            if !has_dep {
                let tx = to_add.pop().expect("stack non-empty");
                if selected.insert(tx.txid) {
                    filter.insert(&tx.txid);
                    out.push(tx);
                }
            }
        }
    }
    out
}

/// Run one stream's transaction dribble until shutdown.
pub fn run_dribbler(
    chain: Arc<dyn ChainView>,
    mempool: Arc<dyn MempoolView>,
    group: Arc<TxQueueGroup>,
    signal: Arc<QueueSignal>,
    cfg: MulticastTxConfig,
    dest: SocketAddr,
    stats: Arc<TxnDribbleStats>,
) {
    assert!(cfg.txn_per_sec > 0);
    while chain.is_initial_block_download() && !signal.is_stopped() {
        std::thread::sleep(Duration::from_millis(50));
    }

    let mut throttle = Throttle::new(cfg.txn_per_sec as f64);
    throttle.set_max_quota(2.0 * cfg.txn_per_sec as f64);
    let mut filter = RollingTxFilter::new(SENT_TXN_CAPACITY, SENT_TXN_FPR);

    while !signal.is_stopped() {
        let quota = throttle.quota();
        // Accumulate at least one second's worth before each pass.
        if quota < cfg.txn_per_sec {
            let wait = throttle
                .estimate_wait(cfg.txn_per_sec as usize)
                .min(Duration::from_millis(250));
            std::thread::sleep(wait.max(Duration::from_millis(10)));
            continue;
        }
        // Consume the full quota even if the mempool has less to offer, so
        // idle periods do not bank unbounded bursts.
        throttle.use_quota(quota as usize);

        for tx in select_batch(mempool.as_ref(), quota as usize, &mut filter) {
            if signal.is_stopped() {
                return;
            }
            let msgs = match messages::tx_packets(&tx) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(%err, "failed to encode transaction");
                    continue;
                }
            };
            for msg in msgs {
                let packet = OutboundPacket {
                    dest,
                    magic: multicast_magic(),
                    msg,
                };
                if group
                    .enqueue_blocking(packet, BufferId::BackgroundTxn, &signal)
                    .is_err()
                {
                    return;
                }
            }
            stats.tx_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn rolling_filter_remembers_and_eventually_forgets() {
        let mut f = RollingTxFilter::new(4, 0.01);
        f.insert(b"a");
        assert!(f.contains(b"a"));
        assert!(!f.contains(b"b"));
        // Push two full generations past "a".
        for i in 0u32..12 {
            f.insert(&i.to_le_bytes());
        }
        assert!(!f.contains(b"a"));
    }

    struct FakeMempool {
        order: Vec<MempoolTx>,
        calls: Mutex<u32>,
    }

    impl MempoolView for FakeMempool {
        fn ancestor_score_order(&self) -> Vec<MempoolTx> {
            *self.calls.lock() += 1;
            self.order.clone()
        }

        fn get(&self, txid: &[u8; 32]) -> Option<MempoolTx> {
            self.order.iter().find(|t| &t.txid == txid).cloned()
        }
    }

    fn tx(id: u8, depends: &[u8]) -> MempoolTx {
        MempoolTx {
            txid: [id; 32],
            raw: Arc::new(vec![id; 100]),
            depends: depends.iter().map(|d| [*d; 32]).collect(),
        }
    }

    #[test]
    fn parents_are_pulled_before_children() {
        // Child 3 scores best but depends on 1, which depends on 2.
        let mempool = FakeMempool {
            order: vec![tx(3, &[1]), tx(1, &[2]), tx(2, &[])],
            calls: Mutex::new(0),
        };
        let mut filter = RollingTxFilter::new(1000, 0.001);
        let batch = select_batch(&mempool, 10, &mut filter);
        let ids: Vec<u8> = batch.iter().map(|t| t.txid[0]).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn sent_transactions_are_suppressed() {
        let mempool = FakeMempool {
            order: vec![tx(1, &[]), tx(2, &[])],
            calls: Mutex::new(0),
        };
        let mut filter = RollingTxFilter::new(1000, 0.001);
        let first = select_batch(&mempool, 10, &mut filter);
        assert_eq!(first.len(), 2);
        let second = select_batch(&mempool, 10, &mut filter);
        assert!(second.is_empty());
    }

    #[test]
    fn quota_bounds_the_batch() {
        let mempool = FakeMempool {
            order: (1..=5).map(|i| tx(i, &[])).collect(),
            calls: Mutex::new(0),
        };
        let mut filter = RollingTxFilter::new(1000, 0.001);
        let batch = select_batch(&mempool, 2, &mut filter);
        assert_eq!(batch.len(), 2);
    }
}
