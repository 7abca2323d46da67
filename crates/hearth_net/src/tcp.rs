//! The TCP listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionSeed};
use crate::NetError;

pub(crate) struct TcpBound {
    pub(crate) listener: TcpListener,
    pub(crate) local_addr: SocketAddr,
}

pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpBound, NetError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| NetError::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| NetError::Bind { addr, source })?;

    info!("tcp listener on {local_addr}");

    Ok(TcpBound {
        listener,
        local_addr,
    })
}

/// One acceptor task; established connections are handled by the shared
/// worker pool (the runtime), which is sized to CPU parallelism by the
/// embedding server.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    seed: ConnectionSeed,
    connection_sema: Arc<Semaphore>,
    new_connections: flume::Sender<Connection>,
) {
    loop {
        let Ok(permit) = Arc::clone(&connection_sema).acquire_owned().await else {
            return; // Semaphore closed on shutdown.
        };

        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("accept failed: {e}");
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY for {peer}: {e}");
        }

        // The permit rides inside the connection and frees its slot when
        // the connection drops.
        let conn = spawn_connection(stream, peer, seed.clone(), permit);

        if new_connections.send_async(conn).await.is_err() {
            debug!("listener dropped while accepting {peer}");
            return;
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    seed: ConnectionSeed,
    permit: tokio::sync::OwnedSemaphorePermit,
) -> Connection {
    let (reader, writer) = stream.into_split();
    Connection::spawn_with_permit(reader, writer, peer, seed, Some(permit))
}
