//! `Encode`/`Decode` implementations for the primitive building blocks of
//! packet payloads.

use std::io::Write;

use anyhow::{bail, ensure, Context};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::var_uint::VarUInt;
use crate::{Decode, Encode};

impl Encode for bool {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_u8(u8::from(*self))?)
    }
}

impl Decode<'_> for bool {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        match r.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => bail!("invalid boolean byte {n}"),
        }
    }
}

impl Encode for u8 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_u8(*self)?)
    }

    fn encode_slice(slice: &[u8], mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(slice)?)
    }
}

impl Decode<'_> for u8 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_u8()?)
    }
}

macro_rules! scalar_impls {
    ($($ty:ty => $write:ident / $read:ident),* $(,)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
                    Ok(w.$write::<LittleEndian>(*self)?)
                }
            }

            impl Decode<'_> for $ty {
                fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
                    Ok(r.$read::<LittleEndian>()?)
                }
            }
        )*
    };
}

scalar_impls! {
    u16 => write_u16 / read_u16,
    u32 => write_u32 / read_u32,
    u64 => write_u64 / read_u64,
    i16 => write_i16 / read_i16,
    i32 => write_i32 / read_i32,
    i64 => write_i64 / read_i64,
    f32 => write_f32 / read_f32,
    f64 => write_f64 / read_f64,
}

impl Encode for str {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        VarUInt::try_from(self.len())?.encode(&mut w)?;
        Ok(w.write_all(self.as_bytes())?)
    }
}

impl Encode for &str {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        str::encode(self, w)
    }
}

impl Encode for String {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        str::encode(self, w)
    }
}

impl<'a> Decode<'a> for &'a str {
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self> {
        let bytes = <&[u8]>::decode(r)?;
        std::str::from_utf8(bytes).context("string is not valid UTF-8")
    }
}

impl Decode<'_> for String {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(<&str>::decode(r)?.to_owned())
    }
}

/// Length-prefixed byte slice.
impl<'a> Decode<'a> for &'a [u8] {
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self> {
        let len = VarUInt::read(r)? as usize;
        ensure!(len <= r.len(), "byte slice length of {len} exceeds input");

        let (front, back) = r.split_at(len);
        *r = back;
        Ok(front)
    }
}

impl Encode for [u8] {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        VarUInt::try_from(self.len())?.encode(&mut w)?;
        Ok(w.write_all(self)?)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        VarUInt::try_from(self.len())?.encode(&mut w)?;
        T::encode_slice(self, w)
    }
}

impl<'a, T: Decode<'a>> Decode<'a> for Vec<T> {
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self> {
        let len = VarUInt::read(r)? as usize;

        // One element is at least one byte, so this bounds allocation.
        ensure!(len <= r.len(), "vector length of {len} exceeds input");

        let mut vec = Vec::with_capacity(len);
        for _ in 0..len {
            vec.push(T::decode(r)?);
        }
        Ok(vec)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        match self {
            Some(value) => {
                true.encode(&mut w)?;
                value.encode(w)
            }
            None => false.encode(w),
        }
    }
}

impl<'a, T: Decode<'a>> Decode<'a> for Option<T> {
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self> {
        Ok(if bool::decode(r)? {
            Some(T::decode(r)?)
        } else {
            None
        })
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.0.encode(&mut w)?;
        self.1.encode(w)
    }
}

impl<'a, A: Decode<'a>, B: Decode<'a>> Decode<'a> for (A, B) {
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self> {
        Ok((A::decode(r)?, B::decode(r)?))
    }
}
