//! A byte-budgeted channel for outbound frame data.
//!
//! Senders are charged per byte, not per message, so one connection's
//! outbound queue is bounded in memory however the frames are sized.
//! The writer task drains it; a full channel is backpressure the caller
//! turns into a disconnect.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

pub fn byte_channel(limit: usize) -> (ByteSender, ByteReceiver) {
    let (tx, rx) = flume::unbounded();
    let used = Arc::new(AtomicUsize::new(0));

    (
        ByteSender {
            tx,
            used: Arc::clone(&used),
            limit,
        },
        ByteReceiver { rx, used },
    )
}

#[derive(Debug)]
pub enum TrySendError {
    /// The configured byte budget is exhausted.
    Full(BytesMut),
    Disconnected(BytesMut),
}

#[derive(Clone)]
pub struct ByteSender {
    tx: flume::Sender<BytesMut>,
    used: Arc<AtomicUsize>,
    limit: usize,
}

impl ByteSender {
    pub fn try_send(&self, bytes: BytesMut) -> Result<(), TrySendError> {
        let len = bytes.len();

        // Optimistic reserve; undone on failure. Overshoot between the
        // check and the add is bounded by one frame per sender.
        let used = self.used.fetch_add(len, Ordering::AcqRel);
        if used + len > self.limit {
            self.used.fetch_sub(len, Ordering::AcqRel);
            return Err(TrySendError::Full(bytes));
        }

        self.tx.send(bytes).map_err(|e| {
            self.used.fetch_sub(len, Ordering::AcqRel);
            TrySendError::Disconnected(e.into_inner())
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

pub struct ByteReceiver {
    rx: flume::Receiver<BytesMut>,
    used: Arc<AtomicUsize>,
}

impl ByteReceiver {
    pub async fn recv_async(&mut self) -> Result<BytesMut, flume::RecvError> {
        let bytes = self.rx.recv_async().await?;
        self.used.fetch_sub(bytes.len(), Ordering::AcqRel);
        Ok(bytes)
    }
}
