//! Opus codec wrapper
//!
//! Decodes compressed audio frames from the server and synthesizes
//! concealment audio for frames that never arrived.

pub mod decoder;

pub use decoder::{AudioDecoder, DecoderStats, SAMPLE_SIZE};
