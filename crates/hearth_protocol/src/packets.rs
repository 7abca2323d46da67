//! The packet vocabulary spoken by the core.
//!
//! Payloads here are deliberately plain: ids, length-prefixed strings and
//! blobs. Anything richer belongs to the host and travels as an opaque
//! blob inside one of these envelopes.

use std::io::Write;

use crate::registry::{CompressionPolicy, PacketRegistry, PacketRegistryBuilder, RegistryError};
use crate::var_uint::VarUInt;
use crate::{Decode, Encode, Packet};

macro_rules! packet {
    ($ty:ident, $id:expr) => {
        impl Packet for $ty {
            const ID: u16 = $id;
            const NAME: &'static str = stringify!($ty);
        }
    };
}

/// Sent before closing a connection, in both directions. The reason for
/// protocol-fatal errors comes from
/// [`ProtocolError::disconnect_reason`](crate::ProtocolError::disconnect_reason).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DisconnectPacket {
    pub reason: String,
}

packet!(DisconnectPacket, 0);

impl Encode for DisconnectPacket {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.reason.encode(w)
    }
}

impl Decode<'_> for DisconnectPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            reason: String::decode(r)?,
        })
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PingPacket {
    pub nonce: u64,
}

packet!(PingPacket, 1);

impl Encode for PingPacket {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.nonce.encode(w)
    }
}

impl Decode<'_> for PingPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            nonce: u64::decode(r)?,
        })
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PongPacket {
    pub nonce: u64,
}

packet!(PongPacket, 2);

impl Encode for PongPacket {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.nonce.encode(w)
    }
}

impl Decode<'_> for PongPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            nonce: u64::decode(r)?,
        })
    }
}

/// A command line typed by the player, executed on the tick thread of the
/// world owning the sender.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommandRequestPacket {
    pub line: String,
}

packet!(CommandRequestPacket, 3);

impl Encode for CommandRequestPacket {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.line.encode(w)
    }
}

impl Decode<'_> for CommandRequestPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            line: String::decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommandReplyPacket {
    pub message: String,
    pub is_error: bool,
}

packet!(CommandReplyPacket, 4);

impl Encode for CommandReplyPacket {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.message.encode(&mut w)?;
        self.is_error.encode(w)
    }
}

impl Decode<'_> for CommandReplyPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            message: String::decode(r)?,
            is_error: bool::decode(r)?,
        })
    }
}

/// One component's encoded value, tagged with its registered type id.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ComponentBlob {
    pub type_id: u16,
    pub data: Vec<u8>,
}

impl Encode for ComponentBlob {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        VarUInt::from(self.type_id).encode(&mut w)?;
        self.data.as_slice().encode(w)
    }
}

impl Decode<'_> for ComponentBlob {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let type_id = VarUInt::read(r)?;
        Ok(Self {
            type_id: u16::try_from(type_id)?,
            data: <&[u8]>::decode(r)?.to_vec(),
        })
    }
}

/// Full state of an entity that just entered a viewer's tracker.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EntityInitPacket {
    pub entity: u64,
    pub components: Vec<ComponentBlob>,
}

packet!(EntityInitPacket, 5);

impl Encode for EntityInitPacket {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.entity.encode(&mut w)?;
        self.components.encode(w)
    }
}

impl Decode<'_> for EntityInitPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            entity: u64::decode(r)?,
            components: Vec::decode(r)?,
        })
    }
}

/// Delta for an entity with at least one dirty component. At most one of
/// these per entity per viewer per tick.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EntityUpdatePacket {
    pub entity: u64,
    pub components: Vec<ComponentBlob>,
}

packet!(EntityUpdatePacket, 6);

impl Encode for EntityUpdatePacket {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.entity.encode(&mut w)?;
        self.components.encode(w)
    }
}

impl Decode<'_> for EntityUpdatePacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            entity: u64::decode(r)?,
            components: Vec::decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EntityRemovePacket {
    pub entities: Vec<u64>,
}

packet!(EntityRemovePacket, 7);

impl Encode for EntityRemovePacket {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.entities.encode(w)
    }
}

impl Decode<'_> for EntityRemovePacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            entities: Vec::decode(r)?,
        })
    }
}

/// Follows [`EntityRemovePacket`] when the departed entity carried a
/// dynamic light, so the client tears down the lighting effect too.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LightCleanupPacket {
    pub entity: u64,
}

packet!(LightCleanupPacket, 8);

impl Encode for LightCleanupPacket {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.entity.encode(w)
    }
}

impl Decode<'_> for LightCleanupPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            entity: u64::decode(r)?,
        })
    }
}

/// One asset in a sync packet: its string key, the stable integer index
/// assigned by the server, and the codec-encoded record.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetEntry {
    pub key: String,
    pub index: u32,
    pub payload: Vec<u8>,
}

impl Encode for AssetEntry {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.key.encode(&mut w)?;
        VarUInt(self.index).encode(&mut w)?;
        self.payload.as_slice().encode(w)
    }
}

impl Decode<'_> for AssetEntry {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            key: String::decode(r)?,
            index: VarUInt::read(r)?,
            payload: <&[u8]>::decode(r)?.to_vec(),
        })
    }
}

/// Full contents of one indexed asset table, sent on join.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetInitPacket {
    pub kind: String,
    pub entries: Vec<AssetEntry>,
}

packet!(AssetInitPacket, 9);

impl Encode for AssetInitPacket {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.kind.encode(&mut w)?;
        self.entries.encode(w)
    }
}

impl Decode<'_> for AssetInitPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            kind: String::decode(r)?,
            entries: Vec::decode(r)?,
        })
    }
}

/// Assets added or changed by a hot reload. Indices of surviving keys
/// never change; new keys extend the index range.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetUpsertPacket {
    pub kind: String,
    pub entries: Vec<AssetEntry>,
}

packet!(AssetUpsertPacket, 10);

impl Encode for AssetUpsertPacket {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.kind.encode(&mut w)?;
        self.entries.encode(w)
    }
}

impl Decode<'_> for AssetUpsertPacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            kind: String::decode(r)?,
            entries: Vec::decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AssetRemovePacket {
    pub kind: String,
    pub keys: Vec<String>,
}

packet!(AssetRemovePacket, 11);

impl Encode for AssetRemovePacket {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.kind.encode(&mut w)?;
        self.keys.encode(w)
    }
}

impl Decode<'_> for AssetRemovePacket {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            kind: String::decode(r)?,
            keys: Vec::decode(r)?,
        })
    }
}

/// Default compression threshold for the compressible core packets.
pub const DEFAULT_COMPRESSION_THRESHOLD: u32 = 256;

/// Registers the core packet set with its size limits and compression
/// policies. Host packets register on top of this before the registry is
/// sealed.
pub fn register_core_packets(builder: &mut PacketRegistryBuilder) -> Result<(), RegistryError> {
    register_core_packets_with(builder, DEFAULT_COMPRESSION_THRESHOLD)
}

/// Like [`register_core_packets`] with an operator-chosen compression
/// threshold for the bulky packets.
pub fn register_core_packets_with(
    builder: &mut PacketRegistryBuilder,
    threshold: u32,
) -> Result<(), RegistryError> {
    use CompressionPolicy::{IfLargerThan, Never};

    builder.register::<DisconnectPacket>(1024, Never)?;
    builder.register::<PingPacket>(16, Never)?;
    builder.register::<PongPacket>(16, Never)?;
    builder.register::<CommandRequestPacket>(4096, Never)?;
    builder.register::<CommandReplyPacket>(1 << 16, IfLargerThan(threshold))?;
    builder.register::<EntityInitPacket>(1 << 20, IfLargerThan(threshold))?;
    builder.register::<EntityUpdatePacket>(1 << 20, IfLargerThan(threshold))?;
    builder.register::<EntityRemovePacket>(1 << 16, Never)?;
    builder.register::<LightCleanupPacket>(16, Never)?;
    builder.register::<AssetInitPacket>(1 << 21, IfLargerThan(threshold))?;
    builder.register::<AssetUpsertPacket>(1 << 21, IfLargerThan(threshold))?;
    builder.register::<AssetRemovePacket>(1 << 16, Never)?;

    Ok(())
}

/// A registry holding exactly the core packet set. Tests and the default
/// server bootstrap start from this.
pub fn core_registry() -> Result<PacketRegistry, RegistryError> {
    let mut builder = PacketRegistryBuilder::new();
    register_core_packets(&mut builder)?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::decode::FrameDecoder;
    use crate::encode::FrameEncoder;
    use crate::stats::NoopStats;

    /// Decodes `frame` as whatever packet type `hint` is, letting the
    /// compiler infer the type parameter from the call site instead of
    /// requiring an explicit turbofish.
    fn decode_like<'a, P: Packet + Decode<'a>>(
        frame: &'a crate::decode::RawFrame,
        _hint: &P,
    ) -> Result<P, crate::ProtocolError> {
        frame.decode()
    }

    /// Every registered packet type survives a frame round trip.
    #[test]
    fn registered_packets_round_trip() {
        let registry = core_registry().unwrap();
        let stats = NoopStats;

        let blob = ComponentBlob {
            type_id: 3,
            data: vec![1, 2, 3, 4],
        };
        let entry = AssetEntry {
            key: "hearth:water".into(),
            index: 0,
            payload: vec![9, 9],
        };

        let mut enc = FrameEncoder::new();
        macro_rules! check {
            ($pkt:expr) => {{
                let pkt = $pkt;
                enc.append_packet(&pkt, &registry, &stats).unwrap();

                let mut dec = FrameDecoder::new();
                dec.queue_bytes(enc.take());
                let frame = dec.try_next_frame(&registry, &stats).unwrap().unwrap();
                assert_eq!(decode_like(&frame, &pkt).unwrap(), pkt);
            }};
        }

        check!(DisconnectPacket {
            reason: "shutting down".into()
        });
        check!(PingPacket { nonce: 1 });
        check!(PongPacket { nonce: 1 });
        check!(CommandRequestPacket {
            line: "/tp 0 64 0".into()
        });
        check!(CommandReplyPacket {
            message: "teleported".into(),
            is_error: false,
        });
        check!(EntityInitPacket {
            entity: 42,
            components: vec![blob.clone()],
        });
        check!(EntityUpdatePacket {
            entity: 42,
            components: vec![blob],
        });
        check!(EntityRemovePacket {
            entities: vec![42, 43],
        });
        check!(LightCleanupPacket { entity: 42 });
        check!(AssetInitPacket {
            kind: "fluid".into(),
            entries: vec![entry.clone()],
        });
        check!(AssetUpsertPacket {
            kind: "fluid".into(),
            entries: vec![entry],
        });
        check!(AssetRemovePacket {
            kind: "fluid".into(),
            keys: vec!["hearth:slime".into()],
        });
    }
}
