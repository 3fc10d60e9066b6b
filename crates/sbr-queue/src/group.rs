//! Per-group prioritized queues and the shared non-empty signal.

use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::ring::{OutboundPacket, PacketRing, RingStats, RING_CAPACITY};
use crate::throttle::Throttle;

/// Buffers per group, in strict priority order.
pub const BUFFER_COUNT: usize = 4;

/// Queue selector within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum BufferId {
    /// Latency-critical traffic (new block announcements, control).
    High = 0,
    /// Best-effort unicast traffic.
    BestEffort = 1,
    /// Background mempool transaction dribble.
    BackgroundTxn = 2,
    /// Background block backfill.
    BackgroundBlock = 3,
}

impl BufferId {
    pub const ALL: [Self; BUFFER_COUNT] = [
        Self::High,
        Self::BestEffort,
        Self::BackgroundTxn,
        Self::BackgroundBlock,
    ];
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue buffer is full")]
    Busy,

    #[error("queues are shutting down")]
    Stopped,
}

/// Wakeup channel between producers and the scheduler, plus the global
/// stop flag everyone observes.
#[derive(Default)]
pub struct QueueSignal {
    lock: Mutex<()>,
    cv: Condvar,
    stop: AtomicBool,
}

impl QueueSignal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify_all(&self) {
        self.cv.notify_all();
    }

    /// Block until notified or `timeout` elapses. Returns immediately once
    /// stopped.
    pub fn wait(&self, timeout: Duration) {
        if self.is_stopped() {
            return;
        }
        let mut guard = self.lock.lock();
        self.cv.wait_for(&mut guard, timeout);
    }

    /// Run `ready` under the signal lock; wait only if it reports false.
    pub fn wait_unless<F: Fn() -> bool>(&self, ready: F) {
        let mut guard = self.lock.lock();
        if !ready() && !self.is_stopped() {
            self.cv.wait(&mut guard);
        }
    }

    /// Flip the stop flag and wake everyone. Taking the lock before the
    /// notify closes the race against a waiter that has checked the flag
    /// but not yet parked.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn locked<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock.lock();
        f()
    }
}

/// One output group: a socket, four priority rings, and a byte-rate
/// bucket (or the `unlimited` flag for groups throttled by a blocking
/// socket downstream).
pub struct TxQueueGroup {
    bufs: [PacketRing; BUFFER_COUNT],
    socket: Arc<UdpSocket>,
    multicast: bool,
    unlimited: bool,
    bw_bytes_per_sec: u64,
    throttle: Mutex<Throttle>,
}

impl TxQueueGroup {
    /// A group over `socket` limited to `bytes_per_sec` (0 means
    /// unlimited — paced by socket backpressure instead).
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>, bytes_per_sec: u64, multicast: bool) -> Self {
        let mut throttle = Throttle::new(bytes_per_sec as f64);
        throttle.set_max_quota(2.0 * bytes_per_sec as f64);
        Self {
            bufs: std::array::from_fn(|_| PacketRing::new(RING_CAPACITY)),
            socket,
            multicast,
            unlimited: bytes_per_sec == 0,
            bw_bytes_per_sec: bytes_per_sec,
            throttle: Mutex::new(throttle),
        }
    }

    #[must_use]
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.multicast
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.unlimited
    }

    #[must_use]
    pub fn rate_bytes_per_sec(&self) -> u64 {
        self.bw_bytes_per_sec
    }

    pub(crate) fn throttle(&self) -> &Mutex<Throttle> {
        &self.throttle
    }

    #[must_use]
    pub fn buffer(&self, id: BufferId) -> &PacketRing {
        &self.bufs[id as usize]
    }

    /// Highest-priority non-empty buffer, if any.
    #[must_use]
    pub fn next_buffer(&self) -> Option<BufferId> {
        BufferId::ALL.into_iter().find(|b| !self.buffer(*b).is_empty())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bufs.iter().all(PacketRing::is_empty)
    }

    /// Non-blocking enqueue. Wakes the scheduler when the group leaves the
    /// all-empty state. A full buffer hands the packet back.
    ///
    /// # Errors
    ///
    /// [`QueueError::Busy`] with the packet returned via `Err` payload is
    /// modelled by the `Result<(), OutboundPacket>`: callers drop it or
    /// push back later.
    pub fn enqueue(
        &self,
        packet: OutboundPacket,
        buffer: BufferId,
        signal: &QueueSignal,
    ) -> Result<(), OutboundPacket> {
        signal.locked(|| {
            let was_empty = self.is_empty();
            self.buffer(buffer).push(packet)?;
            if was_empty {
                signal.notify_all();
            }
            Ok(())
        })
    }

    /// Enqueue with bounded retries, for the backfill producers that must
    /// not drop chunks. Observes the stop flag between attempts.
    ///
    /// # Errors
    ///
    /// [`QueueError::Stopped`] when shutdown arrives first.
    pub fn enqueue_blocking(
        &self,
        mut packet: OutboundPacket,
        buffer: BufferId,
        signal: &QueueSignal,
    ) -> Result<(), QueueError> {
        loop {
            if signal.is_stopped() {
                return Err(QueueError::Stopped);
            }
            match self.enqueue(packet, buffer, signal) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    packet = back;
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    #[must_use]
    pub fn buffer_stats(&self, id: BufferId) -> RingStats {
        self.buffer(id).stats()
    }
}

/// All output groups of the process, keyed by group number, plus the
/// signal they share.
pub struct GroupSet {
    groups: BTreeMap<usize, Arc<TxQueueGroup>>,
    signal: Arc<QueueSignal>,
}

impl GroupSet {
    #[must_use]
    pub fn new(signal: Arc<QueueSignal>) -> Self {
        Self {
            groups: BTreeMap::new(),
            signal,
        }
    }

    pub fn insert(&mut self, group_id: usize, group: Arc<TxQueueGroup>) {
        self.groups.insert(group_id, group);
    }

    #[must_use]
    pub fn get(&self, group_id: usize) -> Option<&Arc<TxQueueGroup>> {
        self.groups.get(&group_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<TxQueueGroup>)> {
        self.groups.iter().map(|(id, g)| (*id, g))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[must_use]
    pub fn signal(&self) -> &Arc<QueueSignal> {
        &self.signal
    }

    /// Whether any group has queued packets.
    #[must_use]
    pub fn any_ready(&self) -> bool {
        self.groups.values().any(|g| !g.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbr_wire::{MsgType, WireMessage};

    fn group() -> (Arc<TxQueueGroup>, Arc<QueueSignal>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        (
            Arc::new(TxQueueGroup::new(socket, 0, false)),
            QueueSignal::new(),
        )
    }

    fn packet() -> OutboundPacket {
        OutboundPacket {
            dest: "127.0.0.1:9".parse().unwrap(),
            magic: 0,
            msg: WireMessage::new(MsgType::Keepalive),
        }
    }

    #[test]
    fn buffer_priority_selection() {
        let (g, s) = group();
        assert_eq!(g.next_buffer(), None);
        g.enqueue(packet(), BufferId::BackgroundBlock, &s).unwrap();
        assert_eq!(g.next_buffer(), Some(BufferId::BackgroundBlock));
        g.enqueue(packet(), BufferId::BestEffort, &s).unwrap();
        assert_eq!(g.next_buffer(), Some(BufferId::BestEffort));
        g.enqueue(packet(), BufferId::High, &s).unwrap();
        assert_eq!(g.next_buffer(), Some(BufferId::High));
    }

    #[test]
    fn enqueue_blocking_stops_on_shutdown() {
        let (g, s) = group();
        // Fill the high buffer.
        while g.enqueue(packet(), BufferId::High, &s).is_ok() {}
        s.shutdown();
        assert!(matches!(
            g.enqueue_blocking(packet(), BufferId::High, &s),
            Err(QueueError::Stopped)
        ));
    }

    #[test]
    fn unlimited_follows_rate_zero() {
        let (g, _) = group();
        assert!(g.is_unlimited());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let limited = TxQueueGroup::new(socket, 125_000, true);
        assert!(!limited.is_unlimited());
        assert!(limited.is_multicast());
    }
}
