//! Per-category payloads
//!
//! Each payload knows its encoded size and writes/reads itself after the
//! header. Writers refuse to truncate: a destination with fewer remaining
//! bytes than the payload is an error.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::header::{read_header, write_header, Category, PacketHeader, HEADER_SIZE};
use super::MAX_DATAGRAM_SIZE;
use crate::error::ProtocolError;

/// Complete client keepalive datagram, built once.
pub const CLIENT_KEEPALIVE_DATAGRAM: [u8; HEADER_SIZE] =
    PacketHeader::new(Category::ClientKeepAlive, HEADER_SIZE as u16).to_bytes();

/// Complete disconnect datagram, built once.
pub const DISCONNECT_DATAGRAM: [u8; HEADER_SIZE] =
    PacketHeader::new(Category::Disconnect, HEADER_SIZE as u16).to_bytes();

/// A payload that follows the packet header.
pub trait Payload: Sized {
    /// Category this payload is sent under
    const CATEGORY: Category;

    /// Encoded size in bytes, excluding the header
    fn encoded_len(&self) -> usize;

    /// Write the payload into `buf`
    fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError>;

    /// Read the payload from `buf`
    fn read<B: Buf>(buf: &mut B) -> Result<Self, ProtocolError>;
}

fn ensure_writable<B: BufMut>(buf: &B, needed: usize) -> Result<(), ProtocolError> {
    let remaining = buf.remaining_mut();
    if remaining < needed {
        return Err(ProtocolError::BufferTooSmall { needed, remaining });
    }
    Ok(())
}

fn ensure_readable<B: Buf>(buf: &B, needed: usize) -> Result<(), ProtocolError> {
    let remaining = buf.remaining();
    if remaining < needed {
        return Err(ProtocolError::Truncated { needed, remaining });
    }
    Ok(())
}

/// Compression level requested from the server.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Raw PCM
    None = 0,
    Kbps64 = 1,
    #[default]
    Kbps128 = 2,
    Kbps192 = 3,
    Kbps256 = 4,
    Kbps320 = 5,
}

impl Compression {
    pub const ALL: [Self; 6] = [
        Self::None,
        Self::Kbps64,
        Self::Kbps128,
        Self::Kbps192,
        Self::Kbps256,
        Self::Kbps320,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Target bitrate in kbps, `None` for uncompressed audio
    pub const fn kbps(self) -> Option<u32> {
        match self {
            Self::None => None,
            Self::Kbps64 => Some(64),
            Self::Kbps128 => Some(128),
            Self::Kbps192 => Some(192),
            Self::Kbps256 => Some(256),
            Self::Kbps320 => Some(320),
        }
    }
}

impl TryFrom<u8> for Compression {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|level| level.code() == code)
            .ok_or(ProtocolError::InvalidCompression(code))
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kbps() {
            Some(kbps) => write!(f, "{kbps} kbps"),
            None => f.write_str("uncompressed"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    /// Accepts `none`, `kbps128` or a bare bitrate such as `128`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "none" || s == "0" {
            return Ok(Self::None);
        }
        let kbps: u32 = s
            .strip_prefix("kbps")
            .unwrap_or(s.as_str())
            .parse()
            .map_err(|_| format!("unknown compression level: {s}"))?;
        Self::ALL
            .into_iter()
            .find(|level| level.kbps() == Some(kbps))
            .ok_or_else(|| format!("unsupported bitrate: {kbps} kbps"))
    }
}

/// Modifier bits sent with a hotkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Modifiers(u8);

impl Modifiers {
    pub const CTRL: u8 = 1 << 0;
    pub const SHIFT: u8 = 1 << 1;
    pub const ALT: u8 = 1 << 2;
    pub const META: u8 = 1 << 3;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }
}

impl FromStr for Modifiers {
    type Err = String;

    /// Accepts raw bits (`5`) or names joined by `+` (`ctrl+alt`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Ok(bits) = s.parse::<u8>() {
            return Ok(Self(bits));
        }
        s.split('+')
            .map(|name| match name.trim() {
                "ctrl" | "control" => Ok(Self::CTRL),
                "shift" => Ok(Self::SHIFT),
                "alt" => Ok(Self::ALT),
                "meta" | "win" | "cmd" => Ok(Self::META),
                other => Err(format!("unknown modifier: {other}")),
            })
            .try_fold(0u8, |bits, bit| bit.map(|bit| bits | bit))
            .map(Self)
    }
}

/// Handshake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    pub protocol_version: u32,
    pub request_id: u16,
    pub compression: Compression,
}

impl Connect {
    pub const SIZE: usize = 4 + 2 + 1;
}

impl Payload for Connect {
    const CATEGORY: Category = Category::Connect;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        ensure_writable(buf, Self::SIZE)?;
        buf.put_u32(self.protocol_version);
        buf.put_u16(self.request_id);
        buf.put_u8(self.compression.code());
        Ok(())
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, ProtocolError> {
        ensure_readable(buf, Self::SIZE)?;
        Ok(Self {
            protocol_version: buf.get_u32(),
            request_id: buf.get_u16(),
            compression: Compression::try_from(buf.get_u8())?,
        })
    }
}

/// Audio format change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetFormat {
    pub request_id: u16,
    pub compression: Compression,
}

impl SetFormat {
    pub const SIZE: usize = 2 + 1;
}

impl Payload for SetFormat {
    const CATEGORY: Category = Category::SetFormat;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        ensure_writable(buf, Self::SIZE)?;
        buf.put_u16(self.request_id);
        buf.put_u8(self.compression.code());
        Ok(())
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, ProtocolError> {
        ensure_readable(buf, Self::SIZE)?;
        Ok(Self {
            request_id: buf.get_u16(),
            compression: Compression::try_from(buf.get_u8())?,
        })
    }
}

/// Key press forwarded to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hotkey {
    pub key_code: u16,
    pub modifiers: Modifiers,
}

impl Hotkey {
    pub const SIZE: usize = 2 + 1;
}

impl Payload for Hotkey {
    const CATEGORY: Category = Category::Hotkey;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        ensure_writable(buf, Self::SIZE)?;
        buf.put_u16(self.key_code);
        buf.put_u8(self.modifiers.bits());
        Ok(())
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, ProtocolError> {
        ensure_readable(buf, Self::SIZE)?;
        Ok(Self {
            key_code: buf.get_u16(),
            modifiers: Modifiers::from_bits(buf.get_u8()),
        })
    }
}

/// Audio payload: a sequence number followed by opaque sample data.
///
/// The same layout is used for both audio categories; only the category
/// says whether `payload` is raw PCM or an Opus frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioData {
    pub sequence: u16,
    pub payload: Bytes,
}

impl AudioData {
    pub const PREFIX_SIZE: usize = 2;
}

impl Payload for AudioData {
    const CATEGORY: Category = Category::AudioDataOpus;

    fn encoded_len(&self) -> usize {
        Self::PREFIX_SIZE + self.payload.len()
    }

    fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        ensure_writable(buf, self.encoded_len())?;
        buf.put_u16(self.sequence);
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, ProtocolError> {
        ensure_readable(buf, Self::PREFIX_SIZE)?;
        let sequence = buf.get_u16();
        let payload = buf.copy_to_bytes(buf.remaining());
        Ok(Self { sequence, payload })
    }
}

/// Acknowledgement of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub request_id: u16,
    /// Reply body, interpreted by the category of the acknowledged request
    pub custom: [u8; 4],
}

impl Ack {
    pub const SIZE: usize = 2 + 4;

    /// Negotiated protocol version carried by a `Connect` acknowledgement.
    pub const fn protocol_version(&self) -> u32 {
        u32::from_be_bytes(self.custom)
    }
}

impl Payload for Ack {
    const CATEGORY: Category = Category::Ack;

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), ProtocolError> {
        ensure_writable(buf, Self::SIZE)?;
        buf.put_u16(self.request_id);
        buf.put_slice(&self.custom);
        Ok(())
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, ProtocolError> {
        ensure_readable(buf, Self::SIZE)?;
        let request_id = buf.get_u16();
        let mut custom = [0u8; 4];
        buf.copy_to_slice(&mut custom);
        Ok(Self { request_id, custom })
    }
}

macro_rules! empty_payload {
    ($(#[$meta:meta])* $name:ident => $category:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl Payload for $name {
            const CATEGORY: Category = Category::$category;

            fn encoded_len(&self) -> usize {
                0
            }

            fn write<B: BufMut>(&self, _buf: &mut B) -> Result<(), ProtocolError> {
                Ok(())
            }

            fn read<B: Buf>(_buf: &mut B) -> Result<Self, ProtocolError> {
                Ok(Self)
            }
        }
    };
}

empty_payload!(
    /// Session teardown, sent by either side.
    Disconnect => Disconnect
);
empty_payload!(
    /// Liveness datagram from the client.
    ClientKeepAlive => ClientKeepAlive
);
empty_payload!(
    /// Liveness datagram from the server.
    ServerKeepAlive => ServerKeepAlive
);

/// Encode `payload` under `category` as one complete datagram.
pub fn encode_with_category<P: Payload>(
    category: Category,
    payload: &P,
) -> Result<Bytes, ProtocolError> {
    let total = HEADER_SIZE + payload.encoded_len();
    if total > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::PacketTooLarge(total));
    }
    let size = u16::try_from(total).map_err(|_| ProtocolError::PacketTooLarge(total))?;

    let mut buf = BytesMut::with_capacity(total);
    write_header(&PacketHeader::new(category, size), &mut buf)?;
    payload.write(&mut buf)?;
    Ok(buf.freeze())
}

/// Encode `payload` under its own category as one complete datagram.
pub fn encode_datagram<P: Payload>(payload: &P) -> Result<Bytes, ProtocolError> {
    encode_with_category(P::CATEGORY, payload)
}

/// A fully decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Disconnect,
    SetFormat(SetFormat),
    Hotkey(Hotkey),
    AudioUncompressed(AudioData),
    AudioOpus(AudioData),
    ClientKeepAlive,
    ServerKeepAlive,
    Ack(Ack),
}

impl Packet {
    pub fn category(&self) -> Category {
        match self {
            Self::Connect(_) => Category::Connect,
            Self::Disconnect => Category::Disconnect,
            Self::SetFormat(_) => Category::SetFormat,
            Self::Hotkey(_) => Category::Hotkey,
            Self::AudioUncompressed(_) => Category::AudioDataUncompressed,
            Self::AudioOpus(_) => Category::AudioDataOpus,
            Self::ClientKeepAlive => Category::ClientKeepAlive,
            Self::ServerKeepAlive => Category::ServerKeepAlive,
            Self::Ack(_) => Category::Ack,
        }
    }

    /// Validate the header of `datagram` and decode its payload.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let header = read_header(datagram)?;
        let category = Category::try_from(header.category)?;
        let mut body = &datagram[HEADER_SIZE..];

        Ok(match category {
            Category::Connect => Self::Connect(Connect::read(&mut body)?),
            Category::Disconnect => Self::Disconnect,
            Category::SetFormat => Self::SetFormat(SetFormat::read(&mut body)?),
            Category::Hotkey => Self::Hotkey(Hotkey::read(&mut body)?),
            Category::AudioDataUncompressed => Self::AudioUncompressed(AudioData::read(&mut body)?),
            Category::AudioDataOpus => Self::AudioOpus(AudioData::read(&mut body)?),
            Category::ClientKeepAlive => Self::ClientKeepAlive,
            Category::ServerKeepAlive => Self::ServerKeepAlive,
            Category::Ack => Self::Ack(Ack::read(&mut body)?),
        })
    }

    /// Encode as one complete datagram.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            Self::Connect(p) => encode_datagram(p),
            Self::Disconnect => Ok(Bytes::from_static(&DISCONNECT_DATAGRAM)),
            Self::SetFormat(p) => encode_datagram(p),
            Self::Hotkey(p) => encode_datagram(p),
            Self::AudioUncompressed(p) => encode_with_category(Category::AudioDataUncompressed, p),
            Self::AudioOpus(p) => encode_with_category(Category::AudioDataOpus, p),
            Self::ClientKeepAlive => Ok(Bytes::from_static(&CLIENT_KEEPALIVE_DATAGRAM)),
            Self::ServerKeepAlive => encode_datagram(&ServerKeepAlive),
            Self::Ack(p) => encode_datagram(p),
        }
    }
}
