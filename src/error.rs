//! Error types for the remote audio client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio output errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),

    /// The playback multiplexer was used after `release()`.
    #[error("Playback has been released")]
    Released,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid packet duration: {0}us (must be 2500..=60000 in steps of 2500)")]
    InvalidPacketDuration(u32),

    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Concealment failed: {0}")]
    ConcealmentFailed(String),

    #[error("Output buffer too small: need {needed} bytes, have {available}")]
    OutputTooSmall { needed: usize, available: usize },
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Port {0} is already in use")]
    AddressInUse(u16),

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Not connected")]
    NotConnected,
}

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet signature")]
    InvalidSignature,

    #[error("Packet size mismatch: header says {declared}, datagram is {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("Truncated packet: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Buffer too small: need {needed} bytes, {remaining} remaining")]
    BufferTooSmall { needed: usize, remaining: usize },

    #[error("Unknown packet category: {0}")]
    UnknownCategory(u8),

    #[error("Invalid compression level: {0}")]
    InvalidCompression(u8),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;
