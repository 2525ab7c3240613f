//! Wire protocol shared with the PC server
//!
//! Every datagram starts with a fixed 5-byte header followed by a
//! category-specific payload. All integers are big-endian.

pub mod header;
pub mod packet;

pub use header::{read_header, write_header, Category, PacketHeader, HEADER_SIZE, SIGNATURE};
pub use packet::{
    encode_datagram, encode_with_category, Ack, AudioData, ClientKeepAlive, Compression, Connect,
    Disconnect, Hotkey, Modifiers, Packet, Payload, ServerKeepAlive, SetFormat, CLIENT_KEEPALIVE_DATAGRAM,
    DISCONNECT_DATAGRAM,
};

/// Protocol version announced in `Connect`
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram the client sends or accepts (MTU - IP/UDP headers)
pub const MAX_DATAGRAM_SIZE: usize = 1472;
