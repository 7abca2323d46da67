use thiserror::Error;

/// Errors raised by the wire codec.
///
/// Every variant is fatal to the connection it occurred on: the peer is sent
/// a disconnect with [`disconnect_reason`](ProtocolError::disconnect_reason)
/// and the socket is closed. The codec itself stays consistent: a failed
/// frame is either fully consumed or the read cursor is left untouched.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A varint ran past five bytes or encoded a negative value.
    #[error("malformed VarUInt")]
    MalformedVarInt,

    /// A payload decoder rejected the frame body.
    #[error("malformed payload for packet '{packet}': {source}")]
    MalformedPayload {
        packet: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A payload decoder finished without consuming the whole frame body.
    #[error("{count} trailing bytes after decoding packet '{packet}'")]
    TrailingBytes { packet: &'static str, count: usize },

    /// The frame named a packet id with no registered descriptor.
    #[error("unknown packet id {0}")]
    UnknownPacketId(u16),

    /// An encoded payload exceeded the registered maximum for its packet.
    #[error("payload of packet id {id} is {len} bytes, exceeding the maximum of {max}")]
    PayloadTooLarge { id: u16, len: usize, max: u32 },

    /// A compressed frame declared an uncompressed length over the
    /// registered maximum. Raised before any buffer is allocated.
    #[error("packet id {id} declares {declared} uncompressed bytes, exceeding the maximum of {max}")]
    DecompressionBomb { id: u16, declared: u32, max: u32 },
}

impl ProtocolError {
    /// The reason string carried by the disconnect packet sent to the peer.
    pub fn disconnect_reason(&self) -> String {
        match self {
            Self::MalformedVarInt => "malformed varint".into(),
            Self::MalformedPayload { packet, .. } => format!("malformed payload ({packet})"),
            Self::TrailingBytes { packet, .. } => format!("trailing bytes ({packet})"),
            Self::UnknownPacketId(id) => format!("unknown packet id {id}"),
            Self::PayloadTooLarge { max, .. } => format!("payload exceeds maximum of {max} bytes"),
            Self::DecompressionBomb { max, .. } => {
                format!("declared uncompressed length exceeds maximum of {max} bytes")
            }
        }
    }
}
