//! Packet header and category codes.

use bytes::BufMut;

use crate::error::ProtocolError;

/// Signature carried by every datagram ("RA").
///
/// Anything not starting with these two bytes is foreign traffic.
pub const SIGNATURE: u16 = 0x5241;

/// Header size in bytes: signature (2) + category (1) + packet size (2).
pub const HEADER_SIZE: usize = 2 + 1 + 2;

/// Packet categories known to this client.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Connect = 1,
    Disconnect = 2,
    SetFormat = 3,
    Hotkey = 4,
    AudioDataUncompressed = 5,
    AudioDataOpus = 6,
    ClientKeepAlive = 7,
    ServerKeepAlive = 8,
    Ack = 9,
}

impl Category {
    /// Raw category code as written on the wire.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Map a raw code back to a category, `None` for unknown codes.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Connect,
            2 => Self::Disconnect,
            3 => Self::SetFormat,
            4 => Self::Hotkey,
            5 => Self::AudioDataUncompressed,
            6 => Self::AudioDataOpus,
            7 => Self::ClientKeepAlive,
            8 => Self::ServerKeepAlive,
            9 => Self::Ack,
            _ => return None,
        })
    }

    /// Returns `true` for the two audio categories.
    pub const fn is_audio(self) -> bool {
        matches!(self, Self::AudioDataUncompressed | Self::AudioDataOpus)
    }
}

impl TryFrom<u8> for Category {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(ProtocolError::UnknownCategory(code))
    }
}

/// Packet header.
///
/// The signature is validated by [`read_header`] and not stored. The category
/// is kept as the raw code so that datagrams of unknown categories still
/// parse and can be ignored by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHeader {
    /// Raw category code
    pub category: u8,
    /// Total datagram size including the header
    pub size: u16,
}

impl PacketHeader {
    pub const fn new(category: Category, size: u16) -> Self {
        Self {
            category: category.code(),
            size,
        }
    }

    /// Decoded category, `None` if the code is unknown.
    pub const fn category(&self) -> Option<Category> {
        Category::from_code(self.category)
    }

    /// Header bytes, usable in `const` context.
    pub const fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let sig = SIGNATURE.to_be_bytes();
        let size = self.size.to_be_bytes();
        [sig[0], sig[1], self.category, size[0], size[1]]
    }
}

/// Read and validate the header of a complete datagram.
///
/// The transport delivers exactly one datagram per read, so the declared size
/// must equal `datagram.len()`.
pub fn read_header(datagram: &[u8]) -> Result<PacketHeader, ProtocolError> {
    let Some((head, _)) = datagram.split_first_chunk::<HEADER_SIZE>() else {
        return Err(ProtocolError::Truncated {
            needed: HEADER_SIZE,
            remaining: datagram.len(),
        });
    };

    if u16::from_be_bytes([head[0], head[1]]) != SIGNATURE {
        return Err(ProtocolError::InvalidSignature);
    }

    let header = PacketHeader {
        category: head[2],
        size: u16::from_be_bytes([head[3], head[4]]),
    };

    if usize::from(header.size) != datagram.len() {
        return Err(ProtocolError::SizeMismatch {
            declared: header.size.into(),
            actual: datagram.len(),
        });
    }

    Ok(header)
}

/// Write a header. Fails if `buf` cannot hold [`HEADER_SIZE`] more bytes.
pub fn write_header<B: BufMut>(header: &PacketHeader, buf: &mut B) -> Result<(), ProtocolError> {
    if buf.remaining_mut() < HEADER_SIZE {
        return Err(ProtocolError::BufferTooSmall {
            needed: HEADER_SIZE,
            remaining: buf.remaining_mut(),
        });
    }
    buf.put_slice(&header.to_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = PacketHeader::new(Category::Ack, 11);
        assert_eq!(header.to_bytes(), [0x52, 0x41, 9, 0, 11]);
    }

    #[test]
    fn test_read_header() {
        let mut datagram = PacketHeader::new(Category::Hotkey, 8).to_bytes().to_vec();
        datagram.extend_from_slice(&[0, 0x20, 1]);

        let header = read_header(&datagram).unwrap();
        assert_eq!(header.category(), Some(Category::Hotkey));
        assert_eq!(header.size, 8);
    }

    #[test]
    fn test_rejects_size_mismatch() {
        let mut datagram = PacketHeader::new(Category::Hotkey, 8).to_bytes().to_vec();
        datagram.extend_from_slice(&[0, 0x20]);

        assert_eq!(
            read_header(&datagram),
            Err(ProtocolError::SizeMismatch {
                declared: 8,
                actual: 7
            })
        );
    }

    #[test]
    fn test_rejects_bad_signature() {
        let datagram = [0x52, 0x42, 7, 0, 5];
        assert_eq!(read_header(&datagram), Err(ProtocolError::InvalidSignature));
    }

    #[test]
    fn test_rejects_short_datagram() {
        assert!(matches!(
            read_header(&[0x52, 0x41, 7]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_category_still_parses() {
        let datagram = [0x52, 0x41, 0xEE, 0, 5];
        let header = read_header(&datagram).unwrap();
        assert_eq!(header.category, 0xEE);
        assert_eq!(header.category(), None);
        assert_eq!(
            Category::try_from(0xEE),
            Err(ProtocolError::UnknownCategory(0xEE))
        );
    }

    #[test]
    fn test_audio_categories() {
        let audio: Vec<_> = (0..=u8::MAX)
            .filter_map(Category::from_code)
            .filter(|c| c.is_audio())
            .collect();
        assert_eq!(
            audio,
            vec![Category::AudioDataUncompressed, Category::AudioDataOpus]
        );
    }

    #[test]
    fn test_write_header_needs_room() {
        let mut small = [0u8; 4];
        let mut slice = &mut small[..];
        let result = write_header(&PacketHeader::new(Category::Connect, 12), &mut slice);
        assert_eq!(
            result,
            Err(ProtocolError::BufferTooSmall {
                needed: HEADER_SIZE,
                remaining: 4
            })
        );
    }
}
