#![doc = include_str!("../README.md")]

pub mod auth;
pub mod byte_channel;
pub mod connection;
mod quic;
mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hearth_protocol::PacketRegistry;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub use crate::auth::{AllowAllAuth, AuthManager, CertVerdict};
pub use crate::connection::{Connection, ConnectionSeed, ReceivedFrame, StatsMode};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("tls setup failed")]
    Tls(#[from] rustls::Error),

    #[error("server certificate generation failed")]
    CertGen(#[from] rcgen::Error),

    #[error("quic setup failed")]
    Quic(#[source] anyhow::Error),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransportKind {
    Tcp,
    Quic,
}

/// Listener configuration; one `Listener` is bound per transport.
#[derive(Clone, Debug)]
pub struct NetConfig {
    pub kind: TransportKind,
    pub address: SocketAddr,
    pub max_connections: usize,
    pub incoming_byte_limit: usize,
    pub outgoing_byte_limit: usize,
    pub handshake_timeout: Duration,
    pub stats: StatsMode,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            address: SocketAddr::from(([0, 0, 0, 0], 25600)),
            max_connections: 1024,
            incoming_byte_limit: 2 << 20,
            outgoing_byte_limit: 8 << 20,
            handshake_timeout: Duration::from_secs(10),
            stats: StatsMode::Atomic,
        }
    }
}

/// A bound transport. New connections arrive on
/// [`incoming`](Self::incoming); the embedding server owns the pull
/// side.
pub struct Listener {
    kind: TransportKind,
    local_addr: SocketAddr,
    incoming: flume::Receiver<Connection>,
    accept_task: JoinHandle<()>,
    endpoint: Option<quinn::Endpoint>,
}

impl Listener {
    /// Binds the configured transport. Binding a second listener to the
    /// same address fails here with [`NetError::Bind`].
    pub async fn bind(
        config: NetConfig,
        registry: Arc<PacketRegistry>,
        auth: Arc<dyn AuthManager>,
    ) -> Result<Self, NetError> {
        let seed = ConnectionSeed {
            registry,
            stats: config.stats,
            incoming_byte_limit: config.incoming_byte_limit,
            outgoing_byte_limit: config.outgoing_byte_limit,
        };

        let (new_connections, incoming) = flume::bounded(64);
        let connection_sema = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));

        match config.kind {
            TransportKind::Tcp => {
                let bound = tcp::bind(config.address).await?;
                let accept_task = tokio::spawn(tcp::accept_loop(
                    bound.listener,
                    seed,
                    connection_sema,
                    new_connections,
                ));

                Ok(Self {
                    kind: TransportKind::Tcp,
                    local_addr: bound.local_addr,
                    incoming,
                    accept_task,
                    endpoint: None,
                })
            }
            TransportKind::Quic => {
                let bound = quic::bind(config.address, &auth)?;
                let endpoint = bound.endpoint.clone();
                let accept_task = tokio::spawn(quic::accept_loop(
                    bound.endpoint,
                    seed,
                    config.handshake_timeout,
                    new_connections,
                ));

                Ok(Self {
                    kind: TransportKind::Quic,
                    local_addr: bound.local_addr,
                    incoming,
                    accept_task,
                    endpoint: Some(endpoint),
                })
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepted connections, ready for the dispatch loop.
    pub fn incoming(&self) -> &flume::Receiver<Connection> {
        &self.incoming
    }

    /// Stops accepting and releases the transport's I/O resources.
    /// Existing [`Connection`]s keep working until dropped.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        if let Some(endpoint) = self.endpoint {
            endpoint.close(0u32.into(), b"server shutting down");
            endpoint.wait_idle().await;
        }
    }
}
