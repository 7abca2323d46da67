//! Inbound frame disassembly.

use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::registry::{CompressionPolicy, DecodedPacket, PacketRegistry};
use crate::stats::PacketStats;
use crate::var_uint::VarUInt;
use crate::{Decode, Packet, MAX_FRAME_SIZE, MAX_PACKET_ID};

/// Decodes length-prefixed frames from a byte stream.
///
/// Bytes are queued as they arrive from the transport;
/// [`try_next_frame`](Self::try_next_frame) yields one frame at a time and
/// suspends with `Ok(None)`, leaving the buffer untouched, while only a
/// partial frame is available.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_next_frame(
        &mut self,
        registry: &PacketRegistry,
        stats: &dyn PacketStats,
    ) -> Result<Option<RawFrame>, ProtocolError> {
        let Some((frame_len, prefix_len)) = VarUInt::peek(&self.buf, 0)? else {
            return Ok(None);
        };

        if frame_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                id: peek_packet_id(&self.buf, prefix_len),
                len: frame_len as usize,
                max: MAX_FRAME_SIZE,
            });
        }

        if self.buf.len() - prefix_len < frame_len as usize {
            // Not enough data arrived yet.
            return Ok(None);
        }

        // The whole frame is buffered; from here on the frame is consumed
        // whether or not it decodes.
        self.buf.advance(prefix_len);
        let mut frame = self.buf.split_to(frame_len as usize);
        let wire_len = prefix_len + frame_len as usize;

        let mut r = &frame[..];
        let id = VarUInt::read(&mut r)?;
        if id > u32::from(MAX_PACKET_ID) {
            return Err(ProtocolError::UnknownPacketId(MAX_PACKET_ID));
        }
        let id = id as u16;

        let desc = registry
            .lookup(id)
            .ok_or(ProtocolError::UnknownPacketId(id))?;

        // Whether a data_len field is present is a property of the
        // descriptor, mirroring the encoder.
        let declared = match desc.compression {
            CompressionPolicy::Never => 0,
            CompressionPolicy::IfLargerThan(_) => VarUInt::read(&mut r)?,
        };

        let body = if declared > 0 {
            if declared > desc.max_size {
                // Checked before any buffer for the declared size exists.
                return Err(ProtocolError::DecompressionBomb {
                    id,
                    declared,
                    max: desc.max_size,
                });
            }

            let out = zstd::bulk::decompress(r, declared as usize).map_err(|e| {
                ProtocolError::MalformedPayload {
                    packet: desc.name,
                    source: e.into(),
                }
            })?;

            if out.len() != declared as usize {
                return Err(ProtocolError::MalformedPayload {
                    packet: desc.name,
                    source: anyhow::anyhow!(
                        "decompressed to {} bytes, expected {declared}",
                        out.len()
                    ),
                });
            }

            BytesMut::from(&out[..])
        } else {
            if r.len() > desc.max_size as usize {
                return Err(ProtocolError::PayloadTooLarge {
                    id,
                    len: r.len(),
                    max: desc.max_size,
                });
            }

            let envelope = frame.len() - r.len();
            frame.advance(envelope);
            frame
        };

        stats.record_recv(id, body.len(), wire_len);

        Ok(Some(RawFrame {
            id,
            name: desc.name,
            body,
        }))
    }

    /// Queues freshly received bytes.
    pub fn queue_bytes(&mut self, bytes: BytesMut) {
        self.buf.unsplit(bytes);
    }

    pub fn queue_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Splits off the unused tail for an O(1) re-queue after a socket
    /// read, pairing with [`queue_bytes`](Self::queue_bytes).
    pub fn take_capacity(&mut self) -> BytesMut {
        self.buf.split_off(self.buf.len())
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }
}

fn peek_packet_id(buf: &[u8], offset: usize) -> u16 {
    match VarUInt::peek(buf, offset) {
        Ok(Some((id, _))) => id.min(u32::from(MAX_PACKET_ID)) as u16,
        _ => 0,
    }
}

/// One decoded frame: the packet id and the (decompressed) payload bytes.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub id: u16,
    pub name: &'static str,
    pub body: BytesMut,
}

impl RawFrame {
    /// Decodes the body as the statically known packet type `P`.
    pub fn decode<'a, P>(&'a self) -> Result<P, ProtocolError>
    where
        P: Packet + Decode<'a>,
    {
        if P::ID != self.id {
            return Err(ProtocolError::MalformedPayload {
                packet: P::NAME,
                source: anyhow::anyhow!("frame carries packet id {}, expected {}", self.id, P::ID),
            });
        }

        let mut r = &self.body[..];
        let pkt = P::decode(&mut r).map_err(|source| ProtocolError::MalformedPayload {
            packet: P::NAME,
            source,
        })?;

        if !r.is_empty() {
            return Err(ProtocolError::TrailingBytes {
                packet: P::NAME,
                count: r.len(),
            });
        }

        Ok(pkt)
    }

    /// Dispatches to the decoder registered for this frame's id.
    pub fn decode_erased(&self, registry: &PacketRegistry) -> Result<DecodedPacket, ProtocolError> {
        let desc = registry
            .lookup(self.id)
            .ok_or(ProtocolError::UnknownPacketId(self.id))?;

        desc.decode_erased(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::FrameEncoder;
    use crate::packets::{self, CommandReplyPacket, DisconnectPacket, PingPacket};
    use crate::registry::{CompressionPolicy, PacketRegistryBuilder};
    use crate::stats::{AtomicStats, NoopStats, PacketStats};

    fn test_registry() -> PacketRegistry {
        packets::core_registry().expect("core packet set registers cleanly")
    }

    #[test]
    fn frame_round_trip() {
        let registry = test_registry();
        let stats = NoopStats;

        let mut enc = FrameEncoder::new();
        enc.append_packet(&PingPacket { nonce: 7 }, &registry, &stats)
            .unwrap();
        enc.append_packet(
            &DisconnectPacket {
                reason: "bye".into(),
            },
            &registry,
            &stats,
        )
        .unwrap();

        let mut dec = FrameDecoder::new();
        dec.queue_bytes(enc.take());

        let frame = dec.try_next_frame(&registry, &stats).unwrap().unwrap();
        assert_eq!(frame.decode::<PingPacket>().unwrap().nonce, 7);

        let frame = dec.try_next_frame(&registry, &stats).unwrap().unwrap();
        assert_eq!(frame.decode::<DisconnectPacket>().unwrap().reason, "bye");

        assert!(dec.try_next_frame(&registry, &stats).unwrap().is_none());
    }

    #[test]
    fn partial_frame_suspends_without_consuming() {
        let registry = test_registry();
        let stats = NoopStats;

        let mut enc = FrameEncoder::new();
        enc.append_packet(
            &CommandReplyPacket {
                message: "hello from the tick thread".into(),
                is_error: false,
            },
            &registry,
            &stats,
        )
        .unwrap();
        let bytes = enc.take();

        let mut dec = FrameDecoder::new();

        // Feed the frame one byte at a time; every prefix must suspend.
        for chunk in bytes[..bytes.len() - 1].chunks(1) {
            dec.queue_slice(chunk);
            assert!(dec.try_next_frame(&registry, &stats).unwrap().is_none());
        }

        dec.queue_slice(&bytes[bytes.len() - 1..]);
        let frame = dec.try_next_frame(&registry, &stats).unwrap().unwrap();
        let reply = frame.decode::<CommandReplyPacket>().unwrap();
        assert_eq!(reply.message, "hello from the tick thread");
    }

    /// Bit-exact framing for a tiny uncompressed packet: id 3 with two
    /// payload bytes frames as `[0x03, 0x03, 0x01, 0x02]`.
    #[test]
    fn small_packet_frame_bytes() {
        #[derive(Clone, PartialEq, Eq, Debug)]
        struct RawBytesPacket(Vec<u8>);

        impl crate::Packet for RawBytesPacket {
            const ID: u16 = 3;
            const NAME: &'static str = "RawBytesPacket";
        }

        impl crate::Encode for RawBytesPacket {
            fn encode(&self, mut w: impl std::io::Write) -> anyhow::Result<()> {
                Ok(w.write_all(&self.0)?)
            }
        }

        impl crate::Decode<'_> for RawBytesPacket {
            fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
                let body = r.to_vec();
                *r = &[];
                Ok(Self(body))
            }
        }

        let mut builder = PacketRegistryBuilder::new();
        builder
            .register::<RawBytesPacket>(64, CompressionPolicy::Never)
            .unwrap();
        let registry = builder.build();

        let mut enc = FrameEncoder::new();
        enc.append_packet(&RawBytesPacket(vec![0x01, 0x02]), &registry, &NoopStats)
            .unwrap();
        let bytes = enc.take();
        assert_eq!(&bytes[..], &[0x03, 0x03, 0x01, 0x02]);

        let mut dec = FrameDecoder::new();
        dec.queue_bytes(bytes);
        let frame = dec.try_next_frame(&registry, &NoopStats).unwrap().unwrap();
        assert_eq!(frame.decode::<RawBytesPacket>().unwrap().0, vec![0x01, 0x02]);
    }

    #[test]
    fn unknown_id_is_fatal() {
        let registry = test_registry();
        let stats = NoopStats;

        // Hand-build a frame for the smallest unregistered id.
        let unknown = registry.id_bound();
        let mut frame = vec![];
        crate::Encode::encode(&VarUInt::from(unknown), &mut frame).unwrap();

        let mut bytes = vec![];
        crate::Encode::encode(&VarUInt(frame.len() as u32), &mut bytes).unwrap();
        bytes.extend_from_slice(&frame);

        let mut dec = FrameDecoder::new();
        dec.queue_slice(&bytes);

        assert!(matches!(
            dec.try_next_frame(&registry, &stats),
            Err(ProtocolError::UnknownPacketId(id)) if id == unknown
        ));
    }

    #[test]
    fn compression_applied_only_when_smaller() {
        let registry = test_registry();
        let stats = AtomicStats::new(registry.id_bound());

        // Highly compressible payload over the threshold.
        let mut enc = FrameEncoder::new();
        enc.append_packet(
            &CommandReplyPacket {
                message: "a".repeat(4096),
                is_error: false,
            },
            &registry,
            &stats,
        )
        .unwrap();
        let bytes = enc.take();

        let entry = stats.snapshot(CommandReplyPacket::ID);
        assert!(entry.sent_compressed_bytes < entry.sent_uncompressed_bytes);
        assert_eq!(entry.sent_compressed_bytes as usize, bytes.len());

        // And it still decodes to the original.
        let mut dec = FrameDecoder::new();
        dec.queue_bytes(bytes);
        let frame = dec.try_next_frame(&registry, &stats).unwrap().unwrap();
        let reply = frame.decode::<CommandReplyPacket>().unwrap();
        assert_eq!(reply.message.len(), 4096);
    }

    #[test]
    fn decompression_bomb_is_rejected_before_allocation() {
        let registry = test_registry();
        let stats = NoopStats;

        let desc = registry.lookup(CommandReplyPacket::ID).unwrap();
        let declared = desc.max_size + 1;

        // Declared uncompressed length over the registered max.
        let mut frame = vec![];
        crate::Encode::encode(&VarUInt::from(CommandReplyPacket::ID), &mut frame).unwrap();
        crate::Encode::encode(&VarUInt(declared), &mut frame).unwrap();

        let mut bytes = vec![];
        crate::Encode::encode(&VarUInt(frame.len() as u32), &mut bytes).unwrap();
        bytes.extend_from_slice(&frame);

        let mut dec = FrameDecoder::new();
        dec.queue_slice(&bytes);

        assert!(matches!(
            dec.try_next_frame(&registry, &stats),
            Err(ProtocolError::DecompressionBomb { id, declared: d, .. })
                if id == CommandReplyPacket::ID && d == declared
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let registry = test_registry();
        let stats = NoopStats;

        // A ping payload with one extra byte.
        let mut frame = vec![];
        crate::Encode::encode(&VarUInt::from(PingPacket::ID), &mut frame).unwrap();
        crate::Encode::encode(&0u64, &mut frame).unwrap();
        frame.push(0xaa);

        let mut bytes = vec![];
        crate::Encode::encode(&VarUInt(frame.len() as u32), &mut bytes).unwrap();
        bytes.extend_from_slice(&frame);

        let mut dec = FrameDecoder::new();
        dec.queue_slice(&bytes);

        let raw = dec.try_next_frame(&registry, &stats).unwrap().unwrap();
        assert!(matches!(
            raw.decode::<PingPacket>(),
            Err(ProtocolError::TrailingBytes { count: 1, .. })
        ));
        assert!(matches!(
            raw.decode_erased(&registry),
            Err(ProtocolError::TrailingBytes { count: 1, .. })
        ));
    }
}
