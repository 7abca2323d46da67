#![doc = include_str!("../README.md")]

pub mod decode;
pub mod encode;
mod error;
mod impls;
pub mod packets;
pub mod registry;
pub mod stats;
pub mod var_uint;

use std::io::Write;

pub use crate::decode::{FrameDecoder, RawFrame};
pub use crate::encode::FrameEncoder;
pub use crate::error::ProtocolError;
pub use crate::registry::{CompressionPolicy, PacketDescriptor, PacketRegistry};
pub use crate::stats::{AtomicStats, NoopStats, PacketStats, StatsEntry};
pub use crate::var_uint::VarUInt;

/// Upper bound on any frame's length prefix, registered maxima included.
pub const MAX_FRAME_SIZE: u32 = 1 << 21;

/// Packet ids occupy 15 bits. The id varint is followed by a `data_len`
/// varint only when the id's registry descriptor declares the packet
/// compressible; there is no per-frame flag bit.
pub const MAX_PACKET_ID: u16 = (1 << 15) - 1;

/// The `Encode` trait allows objects to be written to the wire. It is the
/// inverse of [`Decode`].
pub trait Encode {
    /// Writes this object to the provided writer.
    ///
    /// If this type also implements [`Decode`] then successful calls must
    /// always decode back to an equal value, consuming exactly the bytes
    /// that were written.
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;

    /// Encodes a whole slice of values with no length prefix.
    ///
    /// Semantically identical to encoding each element in sequence, but
    /// types like `u8` override it with a single bulk write.
    fn encode_slice(slice: &[Self], mut w: impl Write) -> anyhow::Result<()>
    where
        Self: Sized,
    {
        for value in slice {
            value.encode(&mut w)?;
        }

        Ok(())
    }
}

/// The `Decode` trait allows objects to be read from the wire. It is the
/// inverse of [`Encode`].
///
/// The lifetime parameter allows decoded values to borrow from the byte
/// slice they were read from.
pub trait Decode<'a>: Sized {
    /// Reads this object from the front of `r`, shrinking the slice.
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self>;
}

/// Types that travel as the payload of a frame.
///
/// The implementations of [`Encode`] and [`Decode`] on `Self` cover only
/// the payload; the frame envelope (length, id, optional uncompressed
/// length) is the codec's business.
pub trait Packet: std::fmt::Debug {
    /// The registered id of this packet. Must fit in 15 bits.
    const ID: u16;
    /// The name of this packet for diagnostics.
    const NAME: &'static str;
}
