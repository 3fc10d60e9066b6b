//! Node lifecycle: sockets, threads, and the receive path.
//!
//! One reader thread polls every receive socket and dispatches datagrams;
//! one sender thread drains the output groups; each multicast transmit
//! stream gets a block backfill thread and, when configured, a
//! transaction dribble thread. Shutdown flips the shared stop flag, wakes
//! the queue condvar, and joins everything.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};
use std::os::fd::AsFd;

use sbr_fec::CodecPool;
use sbr_queue::{
    BufferId, GroupSet, OutboundPacket, QueueSignal, SendScheduler, TxQueueGroup,
};
use sbr_wire::{
    open, BlockTxPayload, MsgType, WireMessage, AUTH_TAG_SIZE, MIN_PACKET_SIZE, PACKET_SIZE,
};

use crate::backfill::{self, BackfillWindow};
use crate::chain::{BlockSink, ChainView, MempoolView, TxSink};
use crate::config::{
    multicast_magic, ordered_port_groups, MulticastRxConfig, MulticastTxConfig, RelayConfig,
};
use crate::dribble::{self, TxnDribbleStats};
use crate::error::{RelayError, RelayResult};
use crate::partial::PartialBlockRegistry;
use crate::peers::{ConnectionInfo, ConnectionKind, PeerTable, UdpMode};

/// Multicast receive buffers hold this many max-size packets.
const RCVBUF_PACKETS: usize = 10_000;

/// Reader housekeeping cadence (repeat disconnects, stale partials).
const READER_TICK: Duration = Duration::from_millis(500);

/// Partial objects idle this long are dropped.
const PARTIAL_TIMEOUT: Duration = Duration::from_secs(600);

struct McastRx {
    tx_ip: Ipv4Addr,
    groupname: String,
    rcvd_bytes: u64,
    last_log: Instant,
}

struct RxSock {
    socket: Arc<UdpSocket>,
    mcast: Option<McastRx>,
}

struct SharedCtx {
    signal: Arc<QueueSignal>,
    peers: Arc<PeerTable>,
    registry: Arc<PartialBlockRegistry>,
    groups: Arc<GroupSet>,
    log_interval: Duration,
}

/// A running relay node; dropping it without [`RelayNode::stop`] detaches
/// the threads, so call `stop`.
pub struct RelayNode {
    signal: Arc<QueueSignal>,
    groups: Arc<GroupSet>,
    peers: Arc<PeerTable>,
    registry: Arc<PartialBlockRegistry>,
    windows: Vec<(String, Arc<BackfillWindow>)>,
    txn_stats: Vec<(String, Arc<TxnDribbleStats>)>,
    threads: Vec<JoinHandle<()>>,
}

impl RelayNode {
    /// Bind every configured socket, reload surviving partial blocks, and
    /// start the worker threads.
    ///
    /// # Errors
    ///
    /// Configuration or socket failures; nothing is left running on error.
    pub fn start(
        cfg: RelayConfig,
        chain: Arc<dyn ChainView>,
        mempool: Option<Arc<dyn MempoolView>>,
        block_sink: Arc<dyn BlockSink>,
        tx_sink: Arc<dyn TxSink>,
    ) -> RelayResult<Self> {
        let ports = ordered_port_groups(&cfg.ports)?;
        let signal = QueueSignal::new();
        let peers = Arc::new(PeerTable::new());
        let mut group_set = GroupSet::new(Arc::clone(&signal));
        let mut rx_socks: Vec<RxSock> = Vec::new();

        for (group_id, port) in ports.iter().enumerate() {
            let socket = bind_socket(port.port)?;
            tracing::info!(
                port = port.port,
                group = group_id,
                mbps = port.mbps,
                "bound unicast group"
            );
            group_set.insert(
                group_id,
                Arc::new(TxQueueGroup::new(
                    Arc::clone(&socket),
                    port.bytes_per_sec(),
                    false,
                )),
            );
            rx_socks.push(RxSock {
                socket,
                mcast: None,
            });
        }

        for peer in &cfg.unicast_peers {
            let addr = resolve_v4(&peer.addr)?;
            if peer.group >= ports.len() {
                return Err(RelayError::Config(format!(
                    "peer {} references unknown group {}",
                    peer.addr, peer.group
                )));
            }
            peers.open(
                addr,
                ConnectionInfo {
                    local_magic: peer.local_magic,
                    remote_magic: peer.remote_magic,
                    group: peer.group,
                    trusted: peer.trusted,
                    kind: ConnectionKind::Normal,
                    mode: UdpMode::Unicast,
                },
            );
        }

        let mut next_group = ports.len();
        for m in &cfg.multicast_rx {
            let socket = bind_multicast_rx(m)?;
            tracing::info!(
                iface = %m.ifname,
                mcast = %m.mcast_ip,
                port = m.port,
                source = %m.tx_ip,
                trusted = m.trusted,
                group = next_group,
                name = %m.groupname,
                "joined multicast stream"
            );
            peers.open(
                SocketAddr::V4(SocketAddrV4::new(m.tx_ip, 0)),
                ConnectionInfo {
                    local_magic: multicast_magic(),
                    remote_magic: multicast_magic(),
                    group: next_group,
                    trusted: m.trusted,
                    kind: ConnectionKind::InboundOnly,
                    mode: UdpMode::Multicast,
                },
            );
            rx_socks.push(RxSock {
                socket,
                mcast: Some(McastRx {
                    tx_ip: m.tx_ip,
                    groupname: m.groupname.clone(),
                    rcvd_bytes: 0,
                    last_log: Instant::now(),
                }),
            });
            next_group += 1;
        }

        let mut tx_streams = Vec::new();
        for (stream_idx, m) in cfg.multicast_tx.iter().enumerate() {
            let socket = bind_multicast_tx(m)?;
            let dest = SocketAddr::V4(SocketAddrV4::new(m.mcast_ip, m.port));
            tracing::info!(
                iface = %m.ifname,
                dest = %dest,
                bw_bps = m.bw_bps,
                txn_per_sec = m.txn_per_sec,
                ttl = m.ttl,
                depth = m.depth,
                offset = m.offset,
                interleave = m.interleave,
                group = next_group,
                "multicast transmit stream"
            );
            group_set.insert(
                next_group,
                Arc::new(TxQueueGroup::new(socket, m.bw_bps / 8, true)),
            );
            peers.open(
                dest,
                ConnectionInfo {
                    local_magic: multicast_magic(),
                    remote_magic: multicast_magic(),
                    group: next_group,
                    trusted: false,
                    kind: ConnectionKind::OutboundOnly,
                    mode: UdpMode::Multicast,
                },
            );
            tx_streams.push((stream_idx, next_group, m.clone(), dest));
            next_group += 1;
        }

        let groups = Arc::new(group_set);
        let registry = Arc::new(PartialBlockRegistry::new(
            cfg.partial_blocks_dir(),
            CodecPool::new(),
            block_sink,
            tx_sink,
        )?);
        registry.load_partial_blocks();

        let mut threads = Vec::new();
        threads.push(SendScheduler::new(Arc::clone(&groups)).spawn());

        let shared = SharedCtx {
            signal: Arc::clone(&signal),
            peers: Arc::clone(&peers),
            registry: Arc::clone(&registry),
            groups: Arc::clone(&groups),
            log_interval: cfg.stats_log_interval,
        };
        threads.push(
            std::thread::Builder::new()
                .name("relay-read".into())
                .spawn(move || reader_loop(shared, rx_socks))
                .expect("spawn reader thread"),
        );

        let mut windows = Vec::new();
        let mut txn_stats = Vec::new();
        for (stream_idx, group_id, mcfg, dest) in tx_streams {
            let group = Arc::clone(groups.get(group_id).expect("stream group registered"));
            let stream_name = format!("{stream_idx}-{group_id}");

            let window = Arc::new(BackfillWindow::new());
            windows.push((stream_name.clone(), Arc::clone(&window)));
            let b_chain = Arc::clone(&chain);
            let b_group = Arc::clone(&group);
            let b_signal = Arc::clone(&signal);
            let b_cfg = mcfg.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("blkbackfill-{stream_name}"))
                    .spawn(move || {
                        backfill::run_backfill(b_chain, b_group, b_signal, window, b_cfg, dest);
                    })
                    .expect("spawn backfill thread"),
            );

            if mcfg.txn_per_sec > 0 {
                if let Some(mempool) = mempool.clone() {
                    let stats = Arc::new(TxnDribbleStats::default());
                    txn_stats.push((stream_name.clone(), Arc::clone(&stats)));
                    let d_chain = Arc::clone(&chain);
                    let d_signal = Arc::clone(&signal);
                    threads.push(
                        std::thread::Builder::new()
                            .name(format!("txnbackfill-{stream_name}"))
                            .spawn(move || {
                                dribble::run_dribbler(
                                    d_chain, mempool, group, d_signal, mcfg, dest, stats,
                                );
                            })
                            .expect("spawn dribble thread"),
                    );
                } else {
                    tracing::warn!(
                        stream = %stream_name,
                        "txn rate configured but no mempool source; dribble disabled"
                    );
                }
            }
        }

        Ok(Self {
            signal,
            groups,
            peers,
            registry,
            windows,
            txn_stats,
            threads,
        })
    }

    /// Flip the stop flag and join every worker thread.
    pub fn stop(mut self) {
        self.signal.shutdown();
        for t in self.threads.drain(..) {
            if let Err(err) = t.join() {
                tracing::warn!(?err, "worker thread panicked");
            }
        }
    }

    #[must_use]
    pub fn signal(&self) -> &Arc<QueueSignal> {
        &self.signal
    }

    #[must_use]
    pub fn groups(&self) -> &Arc<GroupSet> {
        &self.groups
    }

    #[must_use]
    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PartialBlockRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn backfill_windows(&self) -> &[(String, Arc<BackfillWindow>)] {
        &self.windows
    }

    #[must_use]
    pub fn txn_stats(&self) -> &[(String, Arc<TxnDribbleStats>)] {
        &self.txn_stats
    }
}

fn resolve_v4(addr: &str) -> RelayResult<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| RelayError::Config(format!("cannot resolve {addr}: {e}")))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| RelayError::Config(format!("{addr} has no IPv4 address")))
}

fn new_udp_socket() -> RelayResult<Socket> {
    let s = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    s.set_reuse_address(true)?;
    s.set_nonblocking(true)?;
    Ok(s)
}

fn bind_socket(port: u16) -> RelayResult<Arc<UdpSocket>> {
    let s = new_udp_socket()?;
    s.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    Ok(Arc::new(s.into()))
}

fn bind_multicast_rx(m: &MulticastRxConfig) -> RelayResult<Arc<UdpSocket>> {
    let s = new_udp_socket()?;
    let wanted = RCVBUF_PACKETS * PACKET_SIZE;
    s.set_recv_buffer_size(wanted)?;
    let actual = s.recv_buffer_size()?;
    if actual < wanted {
        tracing::error!(
            requested = wanted,
            actual,
            "multicast receive buffer too small; raise it with \
             `sysctl -w net.core.rmem_max={}`",
            2 * wanted + 8
        );
        return Err(RelayError::Socket(
            "multicast receive buffer below the configured minimum".into(),
        ));
    }
    s.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, m.port)).into())?;
    let iface_ip = interface_ipv4(&m.ifname)?;
    s.join_ssm_v4(&m.tx_ip, &m.mcast_ip, &iface_ip)?;
    Ok(Arc::new(s.into()))
}

fn bind_multicast_tx(m: &MulticastTxConfig) -> RelayResult<Arc<UdpSocket>> {
    let s = new_udp_socket()?;
    // Do not loop our own transmissions back.
    s.set_multicast_loop_v4(false)?;
    s.set_multicast_ttl_v4(m.ttl)?;
    let iface_ip = interface_ipv4(&m.ifname)?;
    s.set_multicast_if_v4(&iface_ip)?;
    s.set_tos(m.dscp)?;
    s.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
    Ok(Arc::new(s.into()))
}

fn interface_ipv4(name: &str) -> RelayResult<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| RelayError::Socket(format!("getifaddrs failed: {e}")))?;
    for ifa in addrs {
        if ifa.interface_name != name {
            continue;
        }
        if let Some(addr) = ifa.address {
            if let Some(sin) = addr.as_sockaddr_in() {
                return Ok(sin.ip());
            }
        }
    }
    Err(RelayError::Interface(name.to_string()))
}

fn reader_loop(shared: SharedCtx, mut socks: Vec<RxSock>) {
    let mut buf = [0u8; 2048];
    let mut last_tick = Instant::now();
    while !shared.signal.is_stopped() {
        let ready: Vec<usize> = {
            let mut fds: Vec<PollFd> = socks
                .iter()
                .map(|s| PollFd::new(s.socket.as_fd(), PollFlags::POLLIN))
                .collect();
            match poll(&mut fds, PollTimeout::from(500u16)) {
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    tracing::warn!(%err, "poll on receive sockets failed");
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                Ok(0) => Vec::new(),
                Ok(_) => fds
                    .iter()
                    .enumerate()
                    .filter(|(_, fd)| {
                        fd.revents()
                            .is_some_and(|r| r.intersects(PollFlags::POLLIN))
                    })
                    .map(|(i, _)| i)
                    .collect(),
            }
        };

        for idx in ready {
            let rx = &mut socks[idx];
            loop {
                match rx.socket.recv_from(&mut buf) {
                    Ok((n, src)) => handle_datagram(&shared, rx, &mut buf[..n], src),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        tracing::warn!(%err, "error reading from socket");
                        break;
                    }
                }
            }
        }

        if last_tick.elapsed() >= READER_TICK {
            last_tick = Instant::now();
            reader_tick(&shared);
        }
    }
}

/// Periodic housekeeping on the reader thread: owed DISCONNECT repeats and
/// stale partial objects.
fn reader_tick(shared: &SharedCtx) {
    for pending in shared.peers.due_disconnects(Instant::now()) {
        enqueue_control(
            shared,
            pending.group,
            pending.addr,
            pending.remote_magic,
            WireMessage::new(MsgType::Disconnect),
        );
    }
    shared.registry.evict_stale(PARTIAL_TIMEOUT);
}

fn enqueue_control(
    shared: &SharedCtx,
    group: usize,
    dest: SocketAddr,
    magic: u64,
    msg: WireMessage,
) {
    if let Some(g) = shared.groups.get(group) {
        let packet = OutboundPacket { dest, magic, msg };
        if g.enqueue(packet, BufferId::BestEffort, shared.groups.signal())
            .is_err()
        {
            tracing::debug!(group, "control message dropped, buffer full");
        }
    }
}

/// Full violation policy for unicast peers: DISCONNECT now, repeats
/// scheduled, record removed.
fn send_and_disconnect(shared: &SharedCtx, peer: SocketAddr, reason: &str) {
    tracing::warn!(%peer, reason, "disconnecting misbehaving peer");
    if let Some(info) = shared.peers.send_and_disconnect(peer) {
        enqueue_control(
            shared,
            info.group,
            peer,
            info.remote_magic,
            WireMessage::new(MsgType::Disconnect),
        );
    }
}

fn handle_datagram(shared: &SharedCtx, rx: &mut RxSock, frame: &mut [u8], src: SocketAddr) {
    let n = frame.len();
    if n < MIN_PACKET_SIZE || n > PACKET_SIZE {
        return;
    }
    let from_mcast_sock = rx
        .mcast
        .as_ref()
        .is_some_and(|m| IpAddr::V4(m.tx_ip) == src.ip());
    let Some((peer_key, info)) = shared.peers.match_incoming(src, from_mcast_sock) else {
        return;
    };
    // Authentication failures are dropped without a trace.
    if open(info.local_magic, frame).is_err() {
        return;
    }
    let type_byte = frame[AUTH_TAG_SIZE];
    let body_len = n - MIN_PACKET_SIZE;

    if info.mode == UdpMode::Multicast {
        let Some(ty) = MsgType::from_byte(type_byte) else {
            tracing::debug!(%src, type_byte, "unknown message kind on multicast stream");
            return;
        };
        if !ty.is_content() {
            tracing::debug!(%src, ?ty, "unexpected message kind on multicast stream");
            return;
        }
        match BlockTxPayload::decode(ty, &frame[MIN_PACKET_SIZE..]) {
            Ok(payload) => {
                if let Err(err) = shared.registry.handle_content(peer_key, ty, &payload) {
                    // Multicast sources are never disconnected over bad
                    // objects; just drop.
                    tracing::debug!(%src, %err, "dropped multicast content");
                }
            }
            Err(err) => tracing::debug!(%src, %err, "malformed multicast content"),
        }
        if let Some(m) = rx.mcast.as_mut() {
            m.rcvd_bytes += n as u64;
            let elapsed = m.last_log.elapsed();
            if elapsed >= shared.log_interval {
                tracing::info!(
                    stream = %m.groupname,
                    mbit_per_sec =
                        (m.rcvd_bytes as f64 * 8.0) / (elapsed.as_secs_f64() * 1_000_000.0),
                    "multicast receive rate"
                );
                m.rcvd_bytes = 0;
                m.last_log = Instant::now();
            }
        }
        return;
    }

    shared.peers.touch(peer_key);
    let Some(ty) = MsgType::from_byte(type_byte) else {
        send_and_disconnect(shared, peer_key, "unknown message kind");
        return;
    };
    if let Some(expected) = ty.body_len() {
        if body_len != expected {
            send_and_disconnect(shared, peer_key, "invalid message size");
            return;
        }
    }
    let body = &frame[MIN_PACKET_SIZE..];
    match ty {
        MsgType::Syn => {
            let version = u64::from_le_bytes(body[..8].try_into().expect("8 bytes"));
            shared.peers.record_version(peer_key, version);
        }
        MsgType::Keepalive => {}
        MsgType::Disconnect => {
            tracing::info!(peer = %peer_key, "peer disconnected");
            shared.peers.silent_disconnect(peer_key);
        }
        MsgType::Ping => {
            let nonce = u64::from_le_bytes(body[..8].try_into().expect("8 bytes"));
            enqueue_control(
                shared,
                info.group,
                peer_key,
                info.remote_magic,
                WireMessage::with_u64(MsgType::Pong, nonce),
            );
        }
        MsgType::Pong => {
            let nonce = u64::from_le_bytes(body[..8].try_into().expect("8 bytes"));
            if let Some(rtt) = shared.peers.take_ping(peer_key, nonce) {
                tracing::debug!(peer = %peer_key, rtt_ms = rtt.as_secs_f64() * 1000.0, "pong");
            }
        }
        MsgType::BlockHeader | MsgType::BlockContents => {
            match BlockTxPayload::decode(ty, body) {
                Ok(payload) => {
                    if let Err(err) = shared.registry.handle_content(peer_key, ty, &payload) {
                        send_and_disconnect(shared, peer_key, &err.to_string());
                    }
                }
                Err(err) => send_and_disconnect(shared, peer_key, &err.to_string()),
            }
        }
        MsgType::TxContents => {
            // Only multicast streams carry loose transactions.
            send_and_disconnect(shared, peer_key, "transaction content over unicast");
        }
    }
}
