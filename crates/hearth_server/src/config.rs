//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use hearth_net::{NetConfig, StatsMode, TransportKind};
use serde::Deserialize;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Quic,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsChoice {
    Noop,
    Atomic,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: Transport,
    pub address: SocketAddr,
    /// I/O worker threads; 0 means CPU parallelism.
    pub workers: usize,
    /// Uniform compression threshold applied to compressible packets.
    pub compression_threshold: u32,
    pub stats: StatsChoice,
    /// Simulation ticks per second.
    pub tick_rate: u32,
    pub asset_root: PathBuf,
    /// Watch `asset_root` for hot reload.
    pub watch_assets: bool,
    pub max_connections: usize,
    pub incoming_byte_limit: usize,
    pub outgoing_byte_limit: usize,
    pub handshake_timeout_ms: u64,
    pub worlds: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            address: SocketAddr::from(([0, 0, 0, 0], 25600)),
            workers: 0,
            compression_threshold: 256,
            stats: StatsChoice::Atomic,
            tick_rate: 20,
            asset_root: PathBuf::from("assets"),
            watch_assets: false,
            max_connections: 1024,
            incoming_byte_limit: 2 << 20,
            outgoing_byte_limit: 8 << 20,
            handshake_timeout_ms: 10_000,
            worlds: vec!["hearth:overworld".into()],
        }
    }
}

impl ServerConfig {
    pub(crate) fn net_config(&self) -> NetConfig {
        NetConfig {
            kind: match self.transport {
                Transport::Tcp => TransportKind::Tcp,
                Transport::Quic => TransportKind::Quic,
            },
            address: self.address,
            max_connections: self.max_connections,
            incoming_byte_limit: self.incoming_byte_limit,
            outgoing_byte_limit: self.outgoing_byte_limit,
            handshake_timeout: std::time::Duration::from_millis(self.handshake_timeout_ms),
            stats: match self.stats {
                StatsChoice::Noop => StatsMode::Noop,
                StatsChoice::Atomic => StatsMode::Atomic,
            },
        }
    }

    pub(crate) fn worker_threads(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(4, usize::from)
    }
}
