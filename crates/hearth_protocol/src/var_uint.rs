use std::io::Write;

use byteorder::ReadBytesExt;

use crate::error::ProtocolError;
use crate::{Decode, Encode};

/// A `u32` encoded with variable length: base-128, little-endian, with the
/// high bit of each byte flagging a continuation.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct VarUInt(pub u32);

impl VarUInt {
    /// The maximum number of bytes a `VarUInt` occupies on the wire.
    pub const MAX_SIZE: usize = 5;

    /// Returns the exact number of bytes this varint writes, in `1..=5`.
    pub fn written_size(self) -> usize {
        match self.0 {
            0 => 1,
            n => (31 - n.leading_zeros() as usize) / 7 + 1,
        }
    }

    /// Reads a varint from the front of `r`, shrinking the slice.
    pub fn read(r: &mut &[u8]) -> Result<u32, ProtocolError> {
        let mut val = 0u32;
        for i in 0..Self::MAX_SIZE {
            let byte = r.read_u8().map_err(|_| ProtocolError::MalformedVarInt)?;
            val |= u32::from(byte & 0x7f) << (i * 7);
            if byte & 0x80 == 0 {
                // The fifth byte only has 4 usable bits.
                if i == Self::MAX_SIZE - 1 && byte > 0x0f {
                    return Err(ProtocolError::MalformedVarInt);
                }
                return Ok(val);
            }
        }
        Err(ProtocolError::MalformedVarInt)
    }

    /// Decodes the varint beginning at `offset` without consuming anything.
    ///
    /// Returns `Ok(None)` when `buf` ends mid-varint; the caller should
    /// suspend and retry once more bytes arrive. A fifth byte with the
    /// continuation bit set is malformed, not incomplete.
    pub fn peek(buf: &[u8], offset: usize) -> Result<Option<(u32, usize)>, ProtocolError> {
        let mut val = 0u32;
        for i in 0..Self::MAX_SIZE {
            let Some(&byte) = buf.get(offset + i) else {
                return Ok(None);
            };
            val |= u32::from(byte & 0x7f) << (i * 7);
            if byte & 0x80 == 0 {
                if i == Self::MAX_SIZE - 1 && byte > 0x0f {
                    return Err(ProtocolError::MalformedVarInt);
                }
                return Ok(Some((val, i + 1)));
            }
        }
        Err(ProtocolError::MalformedVarInt)
    }

    /// Returns the encoded length of the varint at `offset`, or `None` when
    /// the buffer ends mid-varint. Never advances a cursor.
    pub fn length_at(buf: &[u8], offset: usize) -> Option<usize> {
        for i in 0..Self::MAX_SIZE {
            let byte = *buf.get(offset + i)?;
            if byte & 0x80 == 0 {
                return Some(i + 1);
            }
        }
        // Five continuation bytes in a row cannot begin a valid varint.
        None
    }
}

impl Encode for VarUInt {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        let mut x = self.0;
        loop {
            let byte = (x & 0x7f) as u8;
            x >>= 7;
            if x == 0 {
                w.write_all(&[byte])?;
                return Ok(());
            }
            w.write_all(&[byte | 0x80])?;
        }
    }
}

impl Decode<'_> for VarUInt {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(VarUInt(Self::read(r)?))
    }
}

impl From<u32> for VarUInt {
    fn from(n: u32) -> Self {
        VarUInt(n)
    }
}

impl From<u16> for VarUInt {
    fn from(n: u16) -> Self {
        VarUInt(u32::from(n))
    }
}

impl From<VarUInt> for u32 {
    fn from(n: VarUInt) -> Self {
        n.0
    }
}

/// Signed values have no representation in this encoding.
impl TryFrom<i32> for VarUInt {
    type Error = ProtocolError;

    fn try_from(n: i32) -> Result<Self, Self::Error> {
        u32::try_from(n)
            .map(VarUInt)
            .map_err(|_| ProtocolError::MalformedVarInt)
    }
}

impl TryFrom<usize> for VarUInt {
    type Error = ProtocolError;

    fn try_from(n: usize) -> Result<Self, Self::Error> {
        u32::try_from(n)
            .map(VarUInt)
            .map_err(|_| ProtocolError::MalformedVarInt)
    }
}
