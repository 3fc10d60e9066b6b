//! Option-payload parsing.
//!
//! Each recognised option carries a comma-separated payload; any deviation
//! is a hard error and the process refuses to start. Connection magics are
//! the low 64 bits of the double-SHA256 of a passphrase; multicast streams
//! all share the magic of the fixed `"multicast"` passphrase.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{RelayError, RelayResult};

/// Passphrase shared by every multicast stream.
pub const MULTICAST_PASSPHRASE: &str = "multicast";

/// Derive a connection magic from a passphrase: low 64 bits (little
/// endian) of its double-SHA256.
#[must_use]
pub fn magic_from_passphrase(pass: &str) -> u64 {
    let first = Sha256::digest(pass.as_bytes());
    let second = Sha256::digest(first);
    u64::from_le_bytes(second[..8].try_into().expect("8 bytes"))
}

/// Magic used by all multicast streams.
#[must_use]
pub fn multicast_magic() -> u64 {
    static MAGIC: OnceLock<u64> = OnceLock::new();
    *MAGIC.get_or_init(|| magic_from_passphrase(MULTICAST_PASSPHRASE))
}

fn cfg_err(opt: &str, msg: &str) -> RelayError {
    RelayError::Config(format!("{opt}: {msg}"))
}

fn split_ip_port(s: &str, opt: &str) -> RelayResult<(Ipv4Addr, u16)> {
    let (ip, port) = s
        .rsplit_once(':')
        .ok_or_else(|| cfg_err(opt, "expected ip:port"))?;
    let ip = ip
        .parse::<Ipv4Addr>()
        .map_err(|_| cfg_err(opt, "invalid IPv4 address"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| cfg_err(opt, "invalid port"))?;
    if port == 0 {
        return Err(cfg_err(opt, "port must be nonzero"));
    }
    Ok((ip, port))
}

/// `udpport` payload: `port,group[,Mbps]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPortConfig {
    pub port: u16,
    pub group: usize,
    /// Megabits per second; 1024 unless given.
    pub mbps: u64,
}

impl UdpPortConfig {
    /// Rate in bytes per second.
    #[must_use]
    pub fn bytes_per_sec(&self) -> u64 {
        self.mbps * 1_000_000 / 8
    }
}

impl FromStr for UdpPortConfig {
    type Err = RelayError;

    fn from_str(s: &str) -> RelayResult<Self> {
        let opt = "udpport";
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() < 2 || fields.len() > 3 {
            return Err(cfg_err(opt, "expected port,group[,Mbps]"));
        }
        let port = fields[0]
            .parse::<u16>()
            .map_err(|_| cfg_err(opt, "invalid port"))?;
        if port == 0 {
            return Err(cfg_err(opt, "port must be nonzero"));
        }
        let group = fields[1]
            .parse::<usize>()
            .map_err(|_| cfg_err(opt, "invalid group"))?;
        let mbps = match fields.get(2) {
            Some(f) => f.parse::<u64>().map_err(|_| cfg_err(opt, "invalid rate"))?,
            None => 1024,
        };
        Ok(Self { port, group, mbps })
    }
}

/// Order `udpport` entries by group number, requiring groups `0..n`
/// without gaps or duplicates.
///
/// # Errors
///
/// [`RelayError::Config`] on duplicate or non-contiguous group numbers.
pub fn ordered_port_groups(ports: &[UdpPortConfig]) -> RelayResult<Vec<UdpPortConfig>> {
    let mut out: Vec<Option<UdpPortConfig>> = vec![None; ports.len()];
    for p in ports {
        let slot = out
            .get_mut(p.group)
            .ok_or_else(|| cfg_err("udpport", "group numbers must be contiguous from 0"))?;
        if slot.is_some() {
            return Err(cfg_err("udpport", "duplicate group number"));
        }
        *slot = Some(p.clone());
    }
    Ok(out.into_iter().flatten().collect())
}

/// `addudpnode` / `addtrustedudpnode` payload:
/// `host:port,local_pass,remote_pass[,group]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastPeerConfig {
    /// Resolvable `host:port`.
    pub addr: String,
    pub local_magic: u64,
    pub remote_magic: u64,
    pub trusted: bool,
    pub group: usize,
}

impl FromStr for UnicastPeerConfig {
    type Err = RelayError;

    fn from_str(s: &str) -> RelayResult<Self> {
        let opt = "addudpnode";
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() < 3 || fields.len() > 4 {
            return Err(cfg_err(opt, "expected host:port,local_pass,remote_pass[,group]"));
        }
        if !fields[0].contains(':') {
            return Err(cfg_err(opt, "expected host:port"));
        }
        let group = match fields.get(3) {
            Some(f) => f
                .parse::<usize>()
                .map_err(|_| cfg_err(opt, "invalid group"))?,
            None => 0,
        };
        Ok(Self {
            addr: fields[0].to_string(),
            local_magic: magic_from_passphrase(fields[1]),
            remote_magic: magic_from_passphrase(fields[2]),
            trusted: false,
            group,
        })
    }
}

/// `udpmulticast` payload: `iface,mcast_ip:port,tx_ip[,trusted[,groupname]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastRxConfig {
    pub ifname: String,
    pub mcast_ip: Ipv4Addr,
    pub port: u16,
    /// Source address the stream is filtered on.
    pub tx_ip: Ipv4Addr,
    pub trusted: bool,
    pub groupname: String,
}

impl FromStr for MulticastRxConfig {
    type Err = RelayError;

    fn from_str(s: &str) -> RelayResult<Self> {
        let opt = "udpmulticast";
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() < 3 || fields.len() > 5 {
            return Err(cfg_err(opt, "expected iface,ip:port,tx_ip[,trusted[,groupname]]"));
        }
        if fields[0].is_empty() {
            return Err(cfg_err(opt, "network interface not set"));
        }
        let (mcast_ip, port) = split_ip_port(fields[1], opt)?;
        if fields[2].is_empty() {
            return Err(cfg_err(opt, "source (tx) IP empty"));
        }
        let tx_ip = fields[2]
            .parse::<Ipv4Addr>()
            .map_err(|_| cfg_err(opt, "invalid source IP"))?;
        let trusted = match fields.get(3) {
            Some(f) => f.parse::<u8>().map_err(|_| cfg_err(opt, "invalid trusted flag"))? != 0,
            None => false,
        };
        let groupname = fields.get(4).unwrap_or(&"").to_string();
        Ok(Self {
            ifname: fields[0].to_string(),
            mcast_ip,
            port,
            tx_ip,
            trusted,
            groupname,
        })
    }
}

/// `udpmulticasttx` payload:
/// `iface,ip:port,bw_bps,txn_per_sec[,ttl[,depth[,offset[,dscp[,interleave]]]]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastTxConfig {
    pub ifname: String,
    pub mcast_ip: Ipv4Addr,
    pub port: u16,
    /// Bits per second; 0 means unlimited (socket-throttled).
    pub bw_bps: u64,
    pub txn_per_sec: u64,
    pub ttl: u32,
    /// Backfill window depth in blocks; 0 wraps the whole chain.
    pub depth: u64,
    /// Start offset into the backfill window.
    pub offset: u64,
    pub dscp: u32,
    /// Blocks kept in flight by the chunk interleaver.
    pub interleave: usize,
}

impl FromStr for MulticastTxConfig {
    type Err = RelayError;

    fn from_str(s: &str) -> RelayResult<Self> {
        let opt = "udpmulticasttx";
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() < 4 || fields.len() > 9 {
            return Err(cfg_err(
                opt,
                "expected iface,ip:port,bw_bps,txn_per_sec[,ttl[,depth[,offset[,dscp[,interleave]]]]]",
            ));
        }
        if fields[0].is_empty() {
            return Err(cfg_err(opt, "network interface not set"));
        }
        let (mcast_ip, port) = split_ip_port(fields[1], opt)?;
        let bw_bps = fields[2]
            .parse::<u64>()
            .map_err(|_| cfg_err(opt, "invalid bandwidth"))?;
        let txn_per_sec = fields[3]
            .parse::<u64>()
            .map_err(|_| cfg_err(opt, "invalid txn rate"))?;
        let parse_at = |idx: usize, what: &str, default: u64| -> RelayResult<u64> {
            match fields.get(idx) {
                Some(f) => f
                    .parse::<u64>()
                    .map_err(|_| cfg_err(opt, &format!("invalid {what}"))),
                None => Ok(default),
            }
        };
        let ttl = parse_at(4, "ttl", 3)?;
        let depth = parse_at(5, "depth", 144)?;
        let offset = parse_at(6, "offset", 0)?;
        let dscp = parse_at(7, "dscp", 0)?;
        let interleave = parse_at(8, "interleave", 1)? as usize;
        if depth > 0 && offset > depth {
            return Err(cfg_err(opt, "offset must not exceed depth"));
        }
        Ok(Self {
            ifname: fields[0].to_string(),
            mcast_ip,
            port,
            bw_bps,
            txn_per_sec,
            ttl: ttl as u32,
            depth,
            offset,
            dscp: dscp as u32,
            interleave: interleave.max(1),
        })
    }
}

/// Everything a [`crate::RelayNode`] needs to start.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Directory holding `partial_blocks/` between restarts.
    pub data_dir: PathBuf,
    pub ports: Vec<UdpPortConfig>,
    pub unicast_peers: Vec<UnicastPeerConfig>,
    pub multicast_rx: Vec<MulticastRxConfig>,
    pub multicast_tx: Vec<MulticastTxConfig>,
    /// Interval between multicast receive-rate log lines.
    pub stats_log_interval: Duration,
}

impl RelayConfig {
    #[must_use]
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ports: Vec::new(),
            unicast_peers: Vec::new(),
            multicast_rx: Vec::new(),
            multicast_tx: Vec::new(),
            stats_log_interval: Duration::from_secs(10),
        }
    }

    /// Directory for persisted partial-block chunk files.
    #[must_use]
    pub fn partial_blocks_dir(&self) -> PathBuf {
        self.data_dir.join("partial_blocks")
    }
}
