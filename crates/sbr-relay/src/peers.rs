//! Peer connection records.
//!
//! Unicast peers are keyed by their exact socket address. Multicast
//! sources transmit from ephemeral ports, so their records are keyed by
//! source IP with port zero and matched by IP alone. Misbehaving unicast
//! peers are removed with a DISCONNECT that is repeated at +1 s and +10 s
//! (the first copy may be lost on a lossy path); the reader's timer tick
//! drains the repeat schedule.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMode {
    Unicast,
    Multicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Bidirectional unicast peer.
    Normal,
    /// Multicast source we only receive from.
    InboundOnly,
    /// Multicast destination we only transmit to.
    OutboundOnly,
}

/// Static parameters of one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub local_magic: u64,
    pub remote_magic: u64,
    pub group: usize,
    pub trusted: bool,
    pub kind: ConnectionKind,
    pub mode: UdpMode,
}

/// Mutable per-peer state.
#[derive(Debug)]
pub struct PeerState {
    pub info: ConnectionInfo,
    pub last_recv: Instant,
    pub protocol_version: u64,
    /// Outstanding ping nonces and when they left.
    pub ping_times: HashMap<u64, Instant>,
}

impl PeerState {
    fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            last_recv: Instant::now(),
            protocol_version: 0,
            ping_times: HashMap::new(),
        }
    }
}

/// A DISCONNECT still owed to a removed peer.
#[derive(Debug, Clone, Copy)]
pub struct PendingDisconnect {
    pub due: Instant,
    pub addr: SocketAddr,
    pub remote_magic: u64,
    pub group: usize,
}

/// All known peers plus the repeat-disconnect schedule.
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<SocketAddr, PeerState>>,
    pending_disconnects: Mutex<Vec<PendingDisconnect>>,
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a peer record.
    pub fn open(&self, addr: SocketAddr, info: ConnectionInfo) {
        tracing::debug!(%addr, mode = ?info.mode, "peer registered");
        self.peers.lock().insert(addr, PeerState::new(info));
    }

    /// Look up the record an incoming datagram belongs to. Multicast
    /// sources are matched by IP with the port zeroed.
    #[must_use]
    pub fn match_incoming(&self, src: SocketAddr, from_multicast_socket: bool) -> Option<(SocketAddr, ConnectionInfo)> {
        let peers = self.peers.lock();
        if from_multicast_socket {
            let key = SocketAddr::new(src.ip(), 0);
            if let Some(state) = peers.get(&key) {
                return Some((key, state.info));
            }
        }
        peers.get(&src).map(|state| (src, state.info))
    }

    /// Update liveness bookkeeping.
    pub fn touch(&self, addr: SocketAddr) {
        if let Some(state) = self.peers.lock().get_mut(&addr) {
            state.last_recv = Instant::now();
        }
    }

    pub fn record_version(&self, addr: SocketAddr, version: u64) {
        if let Some(state) = self.peers.lock().get_mut(&addr) {
            state.protocol_version = version;
        }
    }

    /// Resolve a PONG nonce to its round-trip time.
    #[must_use]
    pub fn take_ping(&self, addr: SocketAddr, nonce: u64) -> Option<Duration> {
        self.peers
            .lock()
            .get_mut(&addr)?
            .ping_times
            .remove(&nonce)
            .map(|sent| sent.elapsed())
    }

    pub fn note_ping(&self, addr: SocketAddr, nonce: u64) {
        if let Some(state) = self.peers.lock().get_mut(&addr) {
            state.ping_times.insert(nonce, Instant::now());
        }
    }

    /// Remove without any farewell (their request, or our shutdown).
    pub fn silent_disconnect(&self, addr: SocketAddr) {
        self.peers.lock().remove(&addr);
    }

    /// Remove and schedule the repeat DISCONNECTs.
    pub fn send_and_disconnect(&self, addr: SocketAddr) -> Option<ConnectionInfo> {
        let state = self.peers.lock().remove(&addr)?;
        let info = state.info;
        let now = Instant::now();
        let mut pending = self.pending_disconnects.lock();
        for delay in [Duration::from_secs(1), Duration::from_secs(10)] {
            pending.push(PendingDisconnect {
                due: now + delay,
                addr,
                remote_magic: info.remote_magic,
                group: info.group,
            });
        }
        Some(info)
    }

    /// Drain repeat DISCONNECTs that have come due.
    #[must_use]
    pub fn due_disconnects(&self, now: Instant) -> Vec<PendingDisconnect> {
        let mut pending = self.pending_disconnects.lock();
        let (due, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.due <= now);
        *pending = rest;
        due
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(mode: UdpMode) -> ConnectionInfo {
        ConnectionInfo {
            local_magic: 1,
            remote_magic: 2,
            group: 0,
            trusted: false,
            kind: ConnectionKind::Normal,
            mode,
        }
    }

    #[test]
    fn multicast_sources_match_by_ip_only() {
        let table = PeerTable::new();
        let source_key: SocketAddr = "203.0.113.9:0".parse().unwrap();
        table.open(source_key, info(UdpMode::Multicast));

        let from_ephemeral: SocketAddr = "203.0.113.9:49152".parse().unwrap();
        let (key, _) = table.match_incoming(from_ephemeral, true).unwrap();
        assert_eq!(key, source_key);
        // The same datagram on a unicast socket does not match.
        assert!(table.match_incoming(from_ephemeral, false).is_none());
    }

    #[test]
    fn disconnect_schedules_two_repeats() {
        let table = PeerTable::new();
        let addr: SocketAddr = "10.0.0.1:8765".parse().unwrap();
        table.open(addr, info(UdpMode::Unicast));
        assert!(table.send_and_disconnect(addr).is_some());
        assert_eq!(table.len(), 0);

        assert!(table.due_disconnects(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(2);
        let due = table.due_disconnects(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].addr, addr);
        // The +10 s copy is still owed.
        let much_later = Instant::now() + Duration::from_secs(11);
        assert_eq!(table.due_disconnects(much_later).len(), 1);
    }

    #[test]
    fn ping_roundtrip_bookkeeping() {
        let table = PeerTable::new();
        let addr: SocketAddr = "10.0.0.1:8765".parse().unwrap();
        table.open(addr, info(UdpMode::Unicast));
        table.note_ping(addr, 77);
        assert!(table.take_ping(addr, 78).is_none());
        assert!(table.take_ping(addr, 77).is_some());
        assert!(table.take_ping(addr, 77).is_none());
    }
}
