//! The per-connection pipeline shared by every transport.
//!
//! An accepted stream gets a reader task (bytes → frame decoder →
//! inbound queue) and a writer task (outbound byte channel → socket).
//! The [`Connection`] handle owns the queues, the frame encoder, and the
//! statistics recorder as plain fields; there is no attribute map.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use bytes::BytesMut;
use hearth_protocol::packets::DisconnectPacket;
use hearth_protocol::{
    Encode, FrameDecoder, FrameEncoder, Packet, PacketRegistry, PacketStats, ProtocolError,
    RawFrame, StatsEntry,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::byte_channel::{byte_channel, ByteSender, TrySendError};

const READ_BUF_SIZE: usize = 4096;

/// One frame received from a peer, stamped on arrival.
#[derive(Debug)]
pub struct ReceivedFrame {
    pub timestamp: Instant,
    pub frame: RawFrame,
}

/// Which statistics recorder each connection gets.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StatsMode {
    Noop,
    Atomic,
}

impl StatsMode {
    fn recorder(self, registry: &PacketRegistry) -> Arc<dyn PacketStats> {
        match self {
            Self::Noop => Arc::new(hearth_protocol::NoopStats),
            Self::Atomic => Arc::new(hearth_protocol::AtomicStats::new(registry.id_bound())),
        }
    }
}

/// Shared wiring every connection needs. Each connection spawns its own
/// statistics recorder from `stats`.
#[derive(Clone)]
pub struct ConnectionSeed {
    pub registry: Arc<PacketRegistry>,
    pub stats: StatsMode,
    pub incoming_byte_limit: usize,
    pub outgoing_byte_limit: usize,
}

/// Handle held by the server side of one peer connection.
pub struct Connection {
    id: Uuid,
    peer: SocketAddr,
    registry: Arc<PacketRegistry>,
    stats: Arc<dyn PacketStats>,
    enc: Mutex<FrameEncoder>,
    send: ByteSender,
    recv: flume::Receiver<ReceivedFrame>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    /// Released on drop, freeing a slot on the listener's connection
    /// semaphore.
    _permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    /// Wires the reader/writer task pair over an accepted stream.
    pub fn spawn<R, W>(reader: R, writer: W, peer: SocketAddr, seed: ConnectionSeed) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_with_permit(reader, writer, peer, seed, None)
    }

    pub fn spawn_with_permit<R, W>(
        reader: R,
        writer: W,
        peer: SocketAddr,
        seed: ConnectionSeed,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let stats = seed.stats.recorder(&seed.registry);
        let (incoming_tx, incoming_rx) = flume::bounded(seed.incoming_byte_limit / 64 + 1);
        let (outgoing_tx, outgoing_rx) = byte_channel(seed.outgoing_byte_limit);

        let reader_task = tokio::spawn(run_reader(
            reader,
            peer,
            Arc::clone(&seed.registry),
            Arc::clone(&stats),
            incoming_tx,
            outgoing_tx.clone(),
        ));

        let writer_task = tokio::spawn(run_writer(writer, outgoing_rx));

        Self {
            id,
            peer,
            registry: seed.registry,
            stats,
            enc: Mutex::new(FrameEncoder::new()),
            send: outgoing_tx,
            recv: incoming_rx,
            reader_task,
            writer_task,
            _permit: permit,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Encodes and queues one packet. Fails when the peer is gone or the
    /// outbound budget is exhausted; both mean the connection is done.
    pub fn send<P>(&self, pkt: &P) -> anyhow::Result<()>
    where
        P: Packet + Encode + 'static,
    {
        let bytes = {
            let mut enc = self.enc.lock();
            enc.append_packet(pkt, &self.registry, self.stats.as_ref())?;
            enc.take()
        };

        match self.send.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => bail!(
                "reached outgoing limit of {} bytes for {}",
                self.send.limit(),
                self.peer
            ),
            Err(TrySendError::Disconnected(_)) => bail!("peer {} disconnected", self.peer),
        }
    }

    /// Pulls the next decoded inbound frame, if one is queued.
    pub fn try_recv(&self) -> anyhow::Result<Option<ReceivedFrame>> {
        match self.recv.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => bail!("peer {} disconnected", self.peer),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.recv.is_disconnected()
    }

    /// Value-copy of one packet id's counters.
    pub fn stats_snapshot(&self, packet_id: u16) -> StatsEntry {
        self.stats.snapshot(packet_id)
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    /// Best-effort disconnect notice; the writer drains it before the
    /// tasks wind down.
    pub fn disconnect(&self, reason: &str) {
        let packet = DisconnectPacket {
            reason: reason.to_owned(),
        };
        if let Err(e) = self.send(&packet) {
            debug!("could not send disconnect to {}: {e}", self.peer);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

async fn run_reader<R>(
    mut reader: R,
    peer: SocketAddr,
    registry: Arc<PacketRegistry>,
    stats: Arc<dyn PacketStats>,
    incoming: flume::Sender<ReceivedFrame>,
    outgoing: ByteSender,
) where
    R: AsyncRead + Unpin,
{
    let mut dec = FrameDecoder::new();
    let mut buf = BytesMut::new();

    loop {
        match dec.try_next_frame(&registry, stats.as_ref()) {
            Ok(Some(frame)) => {
                let received = ReceivedFrame {
                    timestamp: Instant::now(),
                    frame,
                };
                if incoming.send_async(received).await.is_err() {
                    break; // Server side dropped the connection.
                }
            }
            Ok(None) => {
                // Partial frame; wait for more bytes.
                buf.reserve(READ_BUF_SIZE);
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break, // EOF
                    Ok(_) => {}
                    Err(e) => {
                        debug!("error reading from {peer}: {e}");
                        break;
                    }
                }
                dec.queue_bytes(buf.split());
            }
            Err(e) => {
                // Protocol errors are fatal to the connection: log with
                // the client address, tell the peer why, stop reading.
                warn!(client = %peer, "protocol error: {e}");
                send_disconnect(&registry, stats.as_ref(), &outgoing, &e);
                break;
            }
        }
    }
}

fn send_disconnect(
    registry: &PacketRegistry,
    stats: &dyn PacketStats,
    outgoing: &ByteSender,
    error: &ProtocolError,
) {
    let mut enc = FrameEncoder::new();
    let packet = DisconnectPacket {
        reason: error.disconnect_reason(),
    };
    if enc.append_packet(&packet, registry, stats).is_ok() {
        let _ = outgoing.try_send(enc.take());
    }
}

async fn run_writer<W>(mut writer: W, mut outgoing: crate::byte_channel::ByteReceiver)
where
    W: AsyncWrite + Unpin,
{
    while let Ok(bytes) = outgoing.recv_async().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("error writing to stream: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
