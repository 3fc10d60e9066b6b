//! Standalone receive node.
//!
//! Binds the configured unicast groups and multicast streams and logs
//! every block and transaction it reassembles. Transmit streams need an
//! embedded block source and are therefore refused here; hosts that relay
//! blocks outward integrate the library and hand it a chain view.
//!
//! The process runs until terminated. Partial blocks survive an abrupt
//! kill through their on-disk chunk files and are resumed on the next
//! start.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;

use sbr_relay::{
    BlockSink, ChainView, MulticastRxConfig, MulticastTxConfig, RelayBlock, RelayConfig,
    RelayNode, TxSink, UdpPortConfig, UnicastPeerConfig,
};
use sbr_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "sbr", version, about = "One-way satellite block relay (receive node)")]
struct Cli {
    /// Bind a unicast group: `port,group[,Mbps]` (rate defaults to 1024).
    #[arg(long = "udpport", value_name = "PORT,GROUP[,MBPS]")]
    udpport: Vec<UdpPortConfig>,

    /// Persistent unicast peer: `host:port,local_pass,remote_pass[,group]`.
    #[arg(long = "add-udp-node", value_name = "SPEC")]
    add_udp_node: Vec<UnicastPeerConfig>,

    /// Same, marked trusted.
    #[arg(long = "add-trusted-udp-node", value_name = "SPEC")]
    add_trusted_udp_node: Vec<UnicastPeerConfig>,

    /// Receive a multicast stream:
    /// `iface,mcast_ip:port,tx_ip[,trusted[,groupname]]`.
    #[arg(long = "udp-multicast", value_name = "SPEC")]
    udp_multicast: Vec<MulticastRxConfig>,

    /// Transmit a multicast stream (library-only; refused here).
    #[arg(long = "udp-multicast-tx", value_name = "SPEC")]
    udp_multicast_tx: Vec<MulticastTxConfig>,

    /// Seconds between multicast receive-rate log lines.
    #[arg(long = "udp-multicast-log-interval", value_name = "SECS", default_value_t = 10)]
    log_interval: u64,

    /// Data directory (partial blocks persist under it).
    #[arg(long, value_name = "DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

/// A receive-only node has no chain behind it.
struct NoChain;

impl ChainView for NoChain {
    fn is_initial_block_download(&self) -> bool {
        false
    }

    fn height(&self) -> Option<u64> {
        None
    }

    fn block_at(&self, _height: u64) -> Option<RelayBlock> {
        None
    }
}

struct LogBlocks;

impl BlockSink for LogBlocks {
    fn block_completed(&self, peer: SocketAddr, hash_prefix: u64, header: Vec<u8>, body: Vec<u8>) {
        tracing::info!(
            %peer,
            hash_prefix,
            header_len = header.len(),
            body_len = body.len(),
            "block reassembled"
        );
    }
}

struct LogTxs;

impl TxSink for LogTxs {
    fn tx_completed(&self, peer: SocketAddr, tx: Vec<u8>) {
        tracing::info!(%peer, tx_len = tx.len(), "transaction reassembled");
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    sbr_telemetry::init(&TelemetryConfig {
        log_level: "info".into(),
        json_logs: cli.json_logs,
    })?;

    if !cli.udp_multicast_tx.is_empty() {
        bail!(
            "--udp-multicast-tx requires an embedded block source; \
             integrate the sbr-relay library and provide a ChainView"
        );
    }
    if cli.udpport.is_empty() && cli.udp_multicast.is_empty() {
        bail!("nothing to do: configure --udpport and/or --udp-multicast");
    }
    if cli.log_interval == 0 {
        bail!("--udp-multicast-log-interval must be positive");
    }

    let mut cfg = RelayConfig::new(cli.data_dir);
    cfg.ports = cli.udpport;
    cfg.unicast_peers = cli.add_udp_node;
    for mut peer in cli.add_trusted_udp_node {
        peer.trusted = true;
        cfg.unicast_peers.push(peer);
    }
    cfg.multicast_rx = cli.udp_multicast;
    cfg.stats_log_interval = Duration::from_secs(cli.log_interval);

    let _node = RelayNode::start(
        cfg,
        Arc::new(NoChain),
        None,
        Arc::new(LogBlocks),
        Arc::new(LogTxs),
    )?;
    tracing::info!("relay node running");

    // Runs until the process is terminated; chunk files make an abrupt
    // kill recoverable.
    loop {
        std::thread::park();
    }
}
