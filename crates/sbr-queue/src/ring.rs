//! Bounded packet rings with drain statistics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use sbr_wire::WireMessage;

/// Per-buffer capacity. Four buffers of full-size frames per group keep
/// pending outbound data around 10 MiB.
pub const RING_CAPACITY: usize = 2048;

/// One frame queued for transmission: destination, the connection magic to
/// seal with, and the frame itself (sealed lazily on the send path).
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub dest: SocketAddr,
    pub magic: u64,
    pub msg: WireMessage,
}

/// Counters of what the scheduler actually put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// A bounded queue of [`OutboundPacket`]s. Producers push from their own
/// threads; the scheduler is the only consumer.
pub struct PacketRing {
    queue: ArrayQueue<OutboundPacket>,
    tx_bytes: AtomicU64,
    tx_packets: AtomicU64,
}

impl PacketRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            tx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
        }
    }

    /// Non-blocking push; hands the packet back when the ring is full.
    pub fn push(&self, packet: OutboundPacket) -> Result<(), OutboundPacket> {
        self.queue.push(packet)
    }

    #[must_use]
    pub fn pop(&self) -> Option<OutboundPacket> {
        self.queue.pop()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Record a successful transmission of `bytes`.
    pub fn record_drain(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> RingStats {
        RingStats {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbr_wire::MsgType;

    fn packet() -> OutboundPacket {
        OutboundPacket {
            dest: "127.0.0.1:9".parse().unwrap(),
            magic: 1,
            msg: WireMessage::new(MsgType::Keepalive),
        }
    }

    #[test]
    fn push_pop_fifo() {
        let ring = PacketRing::new(4);
        ring.push(packet()).unwrap();
        let mut p2 = packet();
        p2.magic = 2;
        ring.push(p2).unwrap();
        assert_eq!(ring.pop().unwrap().magic, 1);
        assert_eq!(ring.pop().unwrap().magic, 2);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn full_ring_returns_packet() {
        let ring = PacketRing::new(1);
        ring.push(packet()).unwrap();
        assert!(ring.push(packet()).is_err());
    }

    #[test]
    fn drain_stats_accumulate() {
        let ring = PacketRing::new(1);
        ring.record_drain(100);
        ring.record_drain(50);
        assert_eq!(
            ring.stats(),
            RingStats {
                tx_bytes: 150,
                tx_packets: 2
            }
        );
    }
}
