//! Per-connection packet counters.
//!
//! Two implementations sit behind [`PacketStats`]: a no-op used when the
//! operator disables statistics, and a lock-free atomic table. The record
//! paths are called from the codec hot loop and must never block,
//! allocate, or log.

use std::sync::atomic::{AtomicU64, Ordering};

/// A value-copy of one packet id's counters. Every field is monotonically
/// non-decreasing over a connection's lifetime.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct StatsEntry {
    pub sent_count: u64,
    pub received_count: u64,
    pub sent_uncompressed_bytes: u64,
    pub sent_compressed_bytes: u64,
    pub recv_uncompressed_bytes: u64,
    pub recv_compressed_bytes: u64,
}

/// Recording interface handed to the frame codec. `wire` is the full
/// on-the-wire frame size, length prefix included; `uncompressed` is the
/// payload size before compression.
pub trait PacketStats: Send + Sync {
    fn record_send(&self, id: u16, uncompressed: usize, wire: usize);
    fn record_recv(&self, id: u16, uncompressed: usize, wire: usize);
    fn snapshot(&self, id: u16) -> StatsEntry;
}

/// Statistics disabled: all methods compile to nothing.
#[derive(Copy, Clone, Default, Debug)]
pub struct NoopStats;

impl PacketStats for NoopStats {
    fn record_send(&self, _id: u16, _uncompressed: usize, _wire: usize) {}

    fn record_recv(&self, _id: u16, _uncompressed: usize, _wire: usize) {}

    fn snapshot(&self, _id: u16) -> StatsEntry {
        StatsEntry::default()
    }
}

#[derive(Default)]
struct AtomicEntry {
    sent_count: AtomicU64,
    received_count: AtomicU64,
    sent_uncompressed_bytes: AtomicU64,
    sent_compressed_bytes: AtomicU64,
    recv_uncompressed_bytes: AtomicU64,
    recv_compressed_bytes: AtomicU64,
}

/// Lock-free counters, one row per packet id in the sealed registry's id
/// space. Ids outside the table (never registered) are dropped silently;
/// the codec rejects such frames before recording anyway.
pub struct AtomicStats {
    table: Box<[AtomicEntry]>,
}

impl AtomicStats {
    /// `id_bound` comes from [`PacketRegistry::id_bound`].
    ///
    /// [`PacketRegistry::id_bound`]: crate::registry::PacketRegistry::id_bound
    pub fn new(id_bound: u16) -> Self {
        let mut table = Vec::with_capacity(usize::from(id_bound));
        table.resize_with(usize::from(id_bound), AtomicEntry::default);

        Self {
            table: table.into_boxed_slice(),
        }
    }
}

impl PacketStats for AtomicStats {
    fn record_send(&self, id: u16, uncompressed: usize, wire: usize) {
        if let Some(entry) = self.table.get(usize::from(id)) {
            entry.sent_count.fetch_add(1, Ordering::Relaxed);
            entry
                .sent_uncompressed_bytes
                .fetch_add(uncompressed as u64, Ordering::Relaxed);
            entry
                .sent_compressed_bytes
                .fetch_add(wire as u64, Ordering::Relaxed);
        }
    }

    fn record_recv(&self, id: u16, uncompressed: usize, wire: usize) {
        if let Some(entry) = self.table.get(usize::from(id)) {
            entry.received_count.fetch_add(1, Ordering::Relaxed);
            entry
                .recv_uncompressed_bytes
                .fetch_add(uncompressed as u64, Ordering::Relaxed);
            entry
                .recv_compressed_bytes
                .fetch_add(wire as u64, Ordering::Relaxed);
        }
    }

    fn snapshot(&self, id: u16) -> StatsEntry {
        let Some(entry) = self.table.get(usize::from(id)) else {
            return StatsEntry::default();
        };

        StatsEntry {
            sent_count: entry.sent_count.load(Ordering::Relaxed),
            received_count: entry.received_count.load(Ordering::Relaxed),
            sent_uncompressed_bytes: entry.sent_uncompressed_bytes.load(Ordering::Relaxed),
            sent_compressed_bytes: entry.sent_compressed_bytes.load(Ordering::Relaxed),
            recv_uncompressed_bytes: entry.recv_uncompressed_bytes.load(Ordering::Relaxed),
            recv_compressed_bytes: entry.recv_compressed_bytes.load(Ordering::Relaxed),
        }
    }
}
