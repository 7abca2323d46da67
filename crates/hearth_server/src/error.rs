use hearth_asset::AssetError;
use hearth_net::NetError;
use thiserror::Error;

/// Startup and lifecycle failures, mapped to the exit codes CLI
/// embedders report: 0 success, 1 bind failure, 2 asset load failure,
/// 3 transport handshake failure at startup.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind transport")]
    Bind(#[source] NetError),

    #[error("failed to load assets")]
    AssetLoad(#[from] AssetError),

    #[error("transport handshake setup failed")]
    Handshake(#[source] NetError),

    #[error("packet registry setup failed")]
    Registry(#[from] hearth_protocol::registry::RegistryError),

    #[error("asset watcher setup failed")]
    Watch(#[from] hearth_watch::WatchError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("runtime setup failed")]
    Runtime(#[source] std::io::Error),

    #[error("server is shutting down")]
    Shutdown,
}

impl ServerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Bind(_) => 1,
            Self::AssetLoad(_) => 2,
            Self::Handshake(_) => 3,
            Self::Registry(_) | Self::Watch(_) | Self::Config(_) | Self::Runtime(_) => 1,
            Self::Shutdown => 1,
        }
    }

    /// Splits a transport error into the bind/handshake exit classes.
    pub(crate) fn from_net(e: NetError) -> Self {
        match e {
            NetError::Bind { .. } => Self::Bind(e),
            NetError::Tls(_) | NetError::CertGen(_) | NetError::Quic(_) => Self::Handshake(e),
        }
    }
}
