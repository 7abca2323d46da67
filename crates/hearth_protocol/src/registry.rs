//! The process-wide table of packet descriptors.
//!
//! Registration happens in bulk during startup on a single thread; the
//! built registry is immutable and shared behind an `Arc`, so lookups on
//! the hot path are plain reads.

use std::any::{Any, TypeId};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::error::ProtocolError;
use crate::{Decode, Packet, MAX_PACKET_ID};

/// When the encoder compresses a payload.
///
/// Compression is only kept when the compressed form is strictly smaller
/// than the original, whatever the policy says.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CompressionPolicy {
    /// Never compress this packet.
    Never,
    /// Compress when the encoded payload exceeds this many bytes.
    IfLargerThan(u32),
}

/// A decoded packet with its concrete type erased, as produced by the
/// registry dispatch path. Downcast with [`Any`].
pub type DecodedPacket = Box<dyn Any + Send>;

type DecodeFn = fn(&mut &[u8]) -> anyhow::Result<DecodedPacket>;

/// Everything the codec needs to know about one registered packet type.
#[derive(Debug)]
pub struct PacketDescriptor {
    pub id: u16,
    pub name: &'static str,
    /// Upper bound on the *uncompressed* payload size, both directions.
    pub max_size: u32,
    pub compression: CompressionPolicy,
    decode_fn: DecodeFn,
}

impl PacketDescriptor {
    /// Runs the registered payload decoder over `body`, requiring full
    /// consumption.
    pub fn decode_erased(&self, body: &[u8]) -> Result<DecodedPacket, ProtocolError> {
        let mut r = body;

        let pkt = (self.decode_fn)(&mut r).map_err(|source| ProtocolError::MalformedPayload {
            packet: self.name,
            source,
        })?;

        if !r.is_empty() {
            return Err(ProtocolError::TrailingBytes {
                packet: self.name,
                count: r.len(),
            });
        }

        Ok(pkt)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// A registered id has exactly one encoder and one decoder; a second
    /// registration under the same id aborts startup.
    #[error("packet id {0} is already registered")]
    DuplicatePacketId(u16),

    #[error("packet id {0} does not fit in 15 bits")]
    PacketIdOutOfRange(u16),
}

/// Startup-time builder. Dropped after [`build`](Self::build).
#[derive(Default)]
pub struct PacketRegistryBuilder {
    slots: Vec<Option<PacketDescriptor>>,
    by_type: FxHashMap<TypeId, u16>,
}

impl PacketRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P>(
        &mut self,
        max_size: u32,
        compression: CompressionPolicy,
    ) -> Result<&mut Self, RegistryError>
    where
        P: Packet + for<'a> Decode<'a> + Send + 'static,
    {
        if P::ID > MAX_PACKET_ID {
            return Err(RegistryError::PacketIdOutOfRange(P::ID));
        }

        let idx = usize::from(P::ID);
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }

        if self.slots[idx].is_some() {
            return Err(RegistryError::DuplicatePacketId(P::ID));
        }

        self.slots[idx] = Some(PacketDescriptor {
            id: P::ID,
            name: P::NAME,
            max_size,
            compression,
            decode_fn: decode_erased::<P>,
        });
        self.by_type.insert(TypeId::of::<P>(), P::ID);

        Ok(self)
    }

    /// Seals the registry. No registration is possible afterwards.
    pub fn build(self) -> PacketRegistry {
        PacketRegistry {
            slots: self.slots.into_boxed_slice(),
            by_type: self.by_type,
        }
    }
}

fn decode_erased<P>(r: &mut &[u8]) -> anyhow::Result<DecodedPacket>
where
    P: Packet + for<'a> Decode<'a> + Send + 'static,
{
    Ok(Box::new(P::decode(r)?))
}

/// The sealed, read-only packet table.
#[derive(Debug)]
pub struct PacketRegistry {
    slots: Box<[Option<PacketDescriptor>]>,
    by_type: FxHashMap<TypeId, u16>,
}

impl PacketRegistry {
    pub fn lookup(&self, id: u16) -> Option<&PacketDescriptor> {
        self.slots.get(usize::from(id))?.as_ref()
    }

    /// Looks up the descriptor registered for the static packet type `P`.
    pub fn descriptor_for<P: Packet + 'static>(&self) -> Option<&PacketDescriptor> {
        let id = *self.by_type.get(&TypeId::of::<P>())?;
        self.lookup(id)
    }

    /// One past the highest registered id. Bounds per-id tables such as
    /// the stats recorder.
    pub fn id_bound(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PacketDescriptor> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::PingPacket;

    #[test]
    fn duplicate_registration_is_a_startup_error() {
        let mut builder = PacketRegistryBuilder::new();
        builder
            .register::<PingPacket>(64, CompressionPolicy::Never)
            .unwrap();

        assert!(matches!(
            builder.register::<PingPacket>(64, CompressionPolicy::Never),
            Err(RegistryError::DuplicatePacketId(PingPacket::ID)),
        ));
    }

    #[test]
    fn lookup_by_id_and_type_agree() {
        let mut builder = PacketRegistryBuilder::new();
        builder
            .register::<PingPacket>(64, CompressionPolicy::Never)
            .unwrap();
        let registry = builder.build();

        let by_id = registry.lookup(PingPacket::ID).unwrap();
        let by_type = registry.descriptor_for::<PingPacket>().unwrap();
        assert_eq!(by_id.id, by_type.id);
        assert!(registry.lookup(PingPacket::ID + 1).is_none());
    }
}
