//! Packet encoding and decoding for the UDP session protocol.
//!
//! Every datagram carries one packet. Multi-byte integers are big-endian and
//! string fields are netstrings (`<decimal length>:<bytes>,`):
//!
//! ```text
//! ┌──────────────┬─────────────────────┬──────────────────┬─────────────────────┐
//! │ type (u16 BE)│ netstring sessionId │ netstring version│ payload (DATA only) │
//! └──────────────┴─────────────────────┴──────────────────┴─────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest UDP payload that fits in an IPv4 datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest payload carried by one DATA packet.
///
/// Leaves room for the type field and both netstrings.
pub const MAX_DATA_PAYLOAD: usize = 65_000;

/// Length of a generated session id in bytes, before hex encoding.
pub const SESSION_ID_LEN: usize = 16;

/// Longest accepted netstring length prefix.
const MAX_NETSTRING_DIGITS: usize = 9;

/// Packet decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer ends before the header is complete
    #[error("packet truncated")]
    Truncated,

    /// Type field holds no known packet type
    #[error("unknown packet type: {0:#06x}")]
    UnknownType(u16),

    /// Netstring field is not `<len>:<bytes>,`
    #[error("malformed netstring field")]
    MalformedNetstring,

    /// Session id or version is not UTF-8
    #[error("header field is not valid UTF-8")]
    InvalidUtf8,

    /// Control packet carries trailing bytes
    #[error("{0:?} packet must not carry a payload")]
    UnexpectedPayload(PacketType),
}

/// Packet types of the session protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    /// Session open request
    Syn = 0x0000,
    /// Session open acknowledgment
    SynAck = 0x0001,
    /// Stream payload
    Data = 0x0010,
    /// Sender half-closed its write side
    Fin = 0x0011,
    /// Session reset
    Rst = 0x0100,
}

impl PacketType {
    /// Wire value of this type
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for PacketType {
    type Error = PacketError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Self::Syn),
            0x0001 => Ok(Self::SynAck),
            0x0010 => Ok(Self::Data),
            0x0011 => Ok(Self::Fin),
            0x0100 => Ok(Self::Rst),
            _ => Err(PacketError::UnknownType(value)),
        }
    }
}

/// Decoded session packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type
    pub packet_type: PacketType,
    /// Session the packet belongs to
    pub session_id: String,
    /// Protocol version of the sender
    pub version: String,
    /// Stream bytes (empty unless DATA)
    pub payload: Bytes,
}

impl Packet {
    /// Build a control packet (everything except DATA).
    #[must_use]
    pub fn control(
        packet_type: PacketType,
        session_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            packet_type,
            session_id: session_id.into(),
            version: version.into(),
            payload: Bytes::new(),
        }
    }

    /// Build a DATA packet.
    #[must_use]
    pub fn data(
        session_id: impl Into<String>,
        version: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            packet_type: PacketType::Data,
            session_id: session_id.into(),
            version: version.into(),
            payload: payload.into(),
        }
    }

    /// Serialize the packet into a datagram.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            header_len(&self.session_id, &self.version) + self.payload.len(),
        );
        encode_header(&mut buf, self.packet_type, &self.session_id, &self.version);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a datagram.
    ///
    /// # Errors
    /// Returns `PacketError` for truncated or malformed input
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() < 2 {
            return Err(PacketError::Truncated);
        }
        let packet_type = PacketType::try_from(u16::from_be_bytes([datagram[0], datagram[1]]))?;
        let mut offset = 2;

        let (session_id, used) = read_netstring(&datagram[offset..])?;
        offset += used;
        let (version, used) = read_netstring(&datagram[offset..])?;
        offset += used;

        let rest = &datagram[offset..];
        if packet_type != PacketType::Data && !rest.is_empty() {
            return Err(PacketError::UnexpectedPayload(packet_type));
        }

        Ok(Self {
            packet_type,
            session_id: utf8(session_id)?,
            version: utf8(version)?,
            payload: Bytes::copy_from_slice(rest),
        })
    }
}

/// Write the packet header (type and both netstrings) into `buf`.
pub fn encode_header(buf: &mut BytesMut, packet_type: PacketType, session_id: &str, version: &str) {
    buf.put_u16(packet_type.as_u16());
    write_netstring(buf, session_id.as_bytes());
    write_netstring(buf, version.as_bytes());
}

/// Encoded header size for the given fields.
#[must_use]
pub fn header_len(session_id: &str, version: &str) -> usize {
    2 + netstring_len(session_id.len()) + netstring_len(version.len())
}

/// Generate a random session id (16 bytes, hex encoded).
#[must_use]
pub fn generate_session_id() -> String {
    hex::encode(rand::random::<[u8; SESSION_ID_LEN]>())
}

fn netstring_len(len: usize) -> usize {
    len.to_string().len() + 1 + len + 1
}

fn write_netstring(buf: &mut BytesMut, data: &[u8]) {
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(data);
    buf.put_u8(b',');
}

/// Returns the field contents and the number of bytes consumed.
fn read_netstring(buf: &[u8]) -> Result<(&[u8], usize), PacketError> {
    let colon = buf
        .iter()
        .take(MAX_NETSTRING_DIGITS + 1)
        .position(|&b| b == b':')
        .ok_or(if buf.len() <= MAX_NETSTRING_DIGITS {
            PacketError::Truncated
        } else {
            PacketError::MalformedNetstring
        })?;

    let digits = &buf[..colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(PacketError::MalformedNetstring);
    }
    // Digits were validated above
    let len: usize = std::str::from_utf8(digits)
        .map_err(|_| PacketError::MalformedNetstring)?
        .parse()
        .map_err(|_| PacketError::MalformedNetstring)?;

    let start = colon + 1;
    let end = start + len;
    if buf.len() <= end {
        return Err(PacketError::Truncated);
    }
    if buf[end] != b',' {
        return Err(PacketError::MalformedNetstring);
    }
    Ok((&buf[start..end], end + 1))
}

fn utf8(bytes: &[u8]) -> Result<String, PacketError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| PacketError::InvalidUtf8)
}
