//! Outbound frame assembly.
//!
//! Frame layout:
//!
//! ```text
//! VarUInt frame_len       bytes following this field
//! VarUInt packet_id
//! VarUInt data_len        only for packets registered compressible:
//!                         0 = payload is raw, else the uncompressed size
//! payload bytes           zstd-compressed iff data_len > 0
//! ```
//!
//! Whether the `data_len` field is present is a property of the packet's
//! registry descriptor, so both directions agree without a per-frame flag.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::registry::{CompressionPolicy, PacketRegistry};
use crate::stats::PacketStats;
use crate::var_uint::VarUInt;
use crate::{Encode, Packet};

/// Zstd level used for payloads whose policy triggers. The wire format
/// only fixes the codec, not the level.
const COMPRESSION_LEVEL: i32 = 3;

/// Encodes packets into length-prefixed frames.
///
/// Frames accumulate in an internal buffer until [`take`](Self::take) is
/// called, so several packets can be flushed to a socket in one write.
/// The payload scratch buffer is reused across calls.
#[derive(Default)]
pub struct FrameEncoder {
    buf: BytesMut,
    payload_scratch: Vec<u8>,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes `pkt`, applies the registered compression policy, and
    /// appends the resulting frame.
    ///
    /// On error nothing is appended; the connection should be torn down
    /// for [`PayloadTooLarge`](ProtocolError::PayloadTooLarge), which
    /// indicates a packet that can never be delivered.
    pub fn append_packet<P>(
        &mut self,
        pkt: &P,
        registry: &PacketRegistry,
        stats: &dyn PacketStats,
    ) -> Result<(), ProtocolError>
    where
        P: Packet + Encode + 'static,
    {
        let desc = registry
            .descriptor_for::<P>()
            .ok_or(ProtocolError::UnknownPacketId(P::ID))?;

        self.payload_scratch.clear();
        pkt.encode(&mut self.payload_scratch)
            .map_err(|source| ProtocolError::MalformedPayload {
                packet: P::NAME,
                source,
            })?;

        let uncompressed_len = self.payload_scratch.len();
        if uncompressed_len > desc.max_size as usize {
            return Err(ProtocolError::PayloadTooLarge {
                id: desc.id,
                len: uncompressed_len,
                max: desc.max_size,
            });
        }

        // The compressed form is used only when strictly smaller than the
        // original; otherwise the raw payload ships under data_len = 0.
        let (data_len, compressed) = match desc.compression {
            CompressionPolicy::Never => (None, None),
            CompressionPolicy::IfLargerThan(threshold) => {
                let z = if uncompressed_len > threshold as usize {
                    zstd::bulk::compress(&self.payload_scratch, COMPRESSION_LEVEL)
                        .ok()
                        .filter(|z| z.len() < uncompressed_len)
                } else {
                    None
                };

                match z {
                    Some(z) => (Some(VarUInt(uncompressed_len as u32)), Some(z)),
                    None => (Some(VarUInt(0)), None),
                }
            }
        };

        let body = compressed.as_deref().unwrap_or(&self.payload_scratch);
        let id = VarUInt::from(desc.id);

        let frame_len = id.written_size()
            + data_len.map_or(0, VarUInt::written_size)
            + body.len();

        let prefix = VarUInt(frame_len as u32);
        self.buf.reserve(prefix.written_size() + frame_len);

        put_var_uint(&mut self.buf, prefix);
        put_var_uint(&mut self.buf, id);
        if let Some(data_len) = data_len {
            put_var_uint(&mut self.buf, data_len);
        }
        self.buf.extend_from_slice(body);

        stats.record_send(desc.id, uncompressed_len, prefix.written_size() + frame_len);

        Ok(())
    }

    /// Takes all frames appended so far.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn put_var_uint(buf: &mut BytesMut, v: VarUInt) {
    let mut x = v.0;
    loop {
        let byte = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}
