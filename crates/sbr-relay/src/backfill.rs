//! Continuous block backfill over a multicast stream.
//!
//! The backfill thread keeps up to `interleave` blocks "in flight": each
//! is expanded to its full coded-chunk packet sequence, and one packet per
//! block is emitted per pass, round-robin, into the group's backfill
//! buffer. Losing any single packet therefore costs every block a little
//! instead of one block a lot. The cursor walks a window of the most
//! recent `depth` blocks (or the whole chain when `depth` is zero),
//! wrapping at the edges.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use sbr_fec::CHUNK_SIZE;
use sbr_queue::{BufferId, OutboundPacket, QueueSignal, TxQueueGroup};
use sbr_wire::WireMessage;

use crate::chain::ChainView;
use crate::config::{multicast_magic, MulticastTxConfig};
use crate::messages;

/// First height transmitted: with `depth = 0` the offset wraps the whole
/// chain; otherwise it lands inside the rolling window of the most recent
/// `depth` blocks.
#[must_use]
pub fn start_height(tip: u64, depth: u64, offset: u64) -> u64 {
    if depth == 0 {
        offset % (tip + 1)
    } else {
        let bottom = (tip + 1).saturating_sub(depth);
        (bottom + offset % depth).min(tip)
    }
}

/// Next height after `height`, staying inside the window for the current
/// `tip`.
#[must_use]
pub fn advance_height(height: u64, tip: u64, depth: u64) -> u64 {
    let bottom = if depth == 0 {
        0
    } else {
        (tip + 1).saturating_sub(depth)
    };
    let next = height + 1;
    if depth > 0 && next < bottom {
        // The window moved past us while we were transmitting.
        bottom
    } else if next > tip {
        bottom
    } else {
        next
    }
}

struct BackfillBlock {
    msgs: Vec<WireMessage>,
    next_idx: usize,
}

/// One stream's in-flight window, shared with the stats snapshotters.
pub struct BackfillWindow {
    map: Mutex<BTreeMap<u64, BackfillBlock>>,
    bytes_in_window: AtomicU64,
}

impl Default for BackfillWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl BackfillWindow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
            bytes_in_window: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes_in_window.load(Ordering::Relaxed)
    }

    /// `(height, next_idx, total)` per in-flight block.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(u64, usize, usize)> {
        self.map
            .lock()
            .iter()
            .map(|(h, b)| (*h, b.next_idx, b.msgs.len()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Insert `height` if absent; returns whether it was inserted.
    fn try_insert(&self, height: u64, msgs: Vec<WireMessage>) -> bool {
        let mut map = self.map.lock();
        if map.contains_key(&height) {
            return false;
        }
        self.bytes_in_window
            .fetch_add((msgs.len() * CHUNK_SIZE) as u64, Ordering::Relaxed);
        map.insert(height, BackfillBlock { msgs, next_idx: 0 });
        true
    }

    fn contains(&self, height: u64) -> bool {
        self.map.lock().contains_key(&height)
    }

    /// Take the next packet of each block, advancing its cursor.
    fn next_round(&self) -> Vec<WireMessage> {
        let mut map = self.map.lock();
        let mut out = Vec::with_capacity(map.len());
        for block in map.values_mut() {
            if block.next_idx < block.msgs.len() {
                out.push(block.msgs[block.next_idx].clone());
                block.next_idx += 1;
            }
        }
        out
    }

    /// Drop fully transmitted blocks.
    fn sweep_complete(&self) {
        let mut map = self.map.lock();
        let bytes = &self.bytes_in_window;
        map.retain(|_, block| {
            if block.next_idx >= block.msgs.len() {
                bytes.fetch_sub((block.msgs.len() * CHUNK_SIZE) as u64, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
    }
}

/// Run one stream's backfill until shutdown. `dest` is the multicast
/// destination address; packets land in the group's backfill buffer.
pub fn run_backfill(
    chain: Arc<dyn ChainView>,
    group: Arc<TxQueueGroup>,
    signal: Arc<QueueSignal>,
    window: Arc<BackfillWindow>,
    cfg: MulticastTxConfig,
    dest: SocketAddr,
) {
    // Hold off until the initial sync is done.
    while chain.is_initial_block_download() && !signal.is_stopped() {
        std::thread::sleep(Duration::from_millis(50));
    }
    if signal.is_stopped() {
        return;
    }
    let Some(tip) = chain.height() else {
        tracing::warn!("no chain tip, backfill not starting");
        return;
    };
    let target_window = cfg.interleave.max(1);
    let mut height = start_height(tip, cfg.depth, cfg.offset);
    tracing::info!(height, tip, depth = cfg.depth, "backfill starting");

    while !signal.is_stopped() {
        // Fill the interleave window.
        while window.len() < target_window && !signal.is_stopped() {
            if !window.contains(height) {
                match chain.block_at(height) {
                    Some(block) => match messages::block_packets(&block) {
                        Ok(msgs) => {
                            tracing::debug!(
                                height,
                                chunks = msgs.len(),
                                "backfill block entered window"
                            );
                            window.try_insert(height, msgs);
                        }
                        Err(err) => {
                            tracing::warn!(height, %err, "failed to encode block, skipping");
                            std::thread::sleep(Duration::from_millis(50));
                        }
                    },
                    None => {
                        tracing::warn!(height, "block unavailable, skipping");
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            let tip = chain.height().unwrap_or(tip);
            height = advance_height(height, tip, cfg.depth);
        }

        // One chunk from every in-flight block.
        for msg in window.next_round() {
            let packet = OutboundPacket {
                dest,
                magic: multicast_magic(),
                msg,
            };
            if group
                .enqueue_blocking(packet, BufferId::BackgroundBlock, &signal)
                .is_err()
            {
                return;
            }
        }
        window.sweep_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_height_wraps_whole_chain_at_depth_zero() {
        assert_eq!(start_height(100, 0, 0), 0);
        assert_eq!(start_height(100, 0, 42), 42);
        assert_eq!(start_height(100, 0, 101), 0);
        assert_eq!(start_height(100, 0, 150), 49);
    }

    #[test]
    fn start_height_lands_in_rolling_window() {
        // Window of the most recent 10 blocks of a 100-tip chain: 91..=100.
        assert_eq!(start_height(100, 10, 0), 91);
        assert_eq!(start_height(100, 10, 9), 100);
        assert_eq!(start_height(100, 10, 10), 91);
        // Depth taller than the chain clamps to genesis.
        assert_eq!(start_height(5, 100, 0), 0);
    }

    #[test]
    fn advance_wraps_to_window_bottom() {
        // depth 0: past the tip goes back to genesis.
        assert_eq!(advance_height(99, 100, 0), 100);
        assert_eq!(advance_height(100, 100, 0), 0);
        // depth 10 on tip 100: past the tip goes to 91.
        assert_eq!(advance_height(100, 100, 10), 91);
        assert_eq!(advance_height(95, 100, 10), 96);
        // Cursor fell behind a moving window: snaps to the new bottom.
        assert_eq!(advance_height(80, 100, 10), 91);
    }

    #[test]
    fn window_round_robin_interleaves_blocks() {
        let window = BackfillWindow::new();
        let m = |tag: u64| {
            vec![
                WireMessage::with_u64(sbr_wire::MsgType::Ping, tag),
                WireMessage::with_u64(sbr_wire::MsgType::Ping, tag + 100),
            ]
        };
        assert!(window.try_insert(5, m(5)));
        assert!(window.try_insert(6, m(6)));
        assert!(!window.try_insert(5, m(5)));

        let round = window.next_round();
        assert_eq!(round.len(), 2);
        window.sweep_complete();
        assert_eq!(window.len(), 2);

        let round = window.next_round();
        assert_eq!(round.len(), 2);
        window.sweep_complete();
        assert!(window.is_empty());
        assert_eq!(window.bytes(), 0);
    }
}
