//! # Remote Audio Client
//!
//! Client side of a PC remote control: plays audio streamed from the PC over
//! UDP and sends hotkeys back.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        I/O RUNTIME                                    │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │                 Session (network::session)                      │  │
//! │  │   send socket ──► Connect / SetFormat / Hotkey / KeepAlive      │  │
//! │  │   receive loop ◄── ACK / KeepAlive / Disconnect / Audio         │  │
//! │  │   keepalive loop: 1 s tick, 5 s contact timeout                 │  │
//! │  └───────────┬───────────────────────┬───────────────┬────────────┘  │
//! │              │ PCM16                 │ Opus          │ lost packets  │
//! │              ▼                       ▼               ▼               │
//! │      ┌──────────────┐        ┌──────────────┐  ┌──────────────┐     │
//! │      │ bounded mpsc │        │ bounded mpsc │  │ LossCounter  │     │
//! │      └──────┬───────┘        └──────┬───────┘  └──────┬───────┘     │
//! └─────────────┼───────────────────────┼─────────────────┼─────────────┘
//!               ▼                       ▼                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      PLAYBACK RUNTIME                                 │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │        PlaybackMultiplexer (audio::playback)                    │  │
//! │  │   silence / PLC for lost packets ─► Opus decode ─► AudioSink    │  │
//! │  └────────────────────────────────────────────┬───────────────────┘  │
//! │                                               ▼                      │
//! │                    ┌────────────────────────────────────────┐        │
//! │                    │ CpalSink: SampleRing ─► output thread  │        │
//! │                    └────────────────────────────────────────┘        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod messages;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for playback
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default packet duration in microseconds
    pub const DEFAULT_PACKET_DURATION_US: u32 = 10_000;

    /// Default server control port
    pub const DEFAULT_SERVER_PORT: u16 = 5000;

    /// Default local port the server streams to
    pub const DEFAULT_LOCAL_PORT: u16 = 5001;
}
