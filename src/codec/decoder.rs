//! Opus decoder wrapper
//!
//! Provides Opus decoding to 16-bit PCM bytes with packet loss concealment.

use opus::{Channels, Decoder};

use crate::error::CodecError;

/// Bytes per PCM sample (signed 16-bit)
pub const SAMPLE_SIZE: usize = 2;

/// Sample rates the Opus decoder can produce
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

const MIN_PACKET_DURATION_US: u32 = 2_500;
const MAX_PACKET_DURATION_US: u32 = 60_000;
const PACKET_DURATION_STEP_US: u32 = 2_500;

/// Longest gap the decoder is allowed to conceal, in microseconds
const MAX_CONCEALMENT_US: u32 = 60_000;

/// Largest frame Opus can emit (120 ms)
const MAX_FRAME_MS: usize = 120;

/// Opus decoder with framing constants frozen at construction
pub struct AudioDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    packet_duration_us: u32,
    frames_per_packet: usize,
    bytes_per_packet: usize,
    max_concealable_packets: u32,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    packets_decoded: u64,
    packets_concealed: u64,
    bytes_produced: u64,
}

impl AudioDecoder {
    /// Create a new decoder.
    ///
    /// `packet_duration_us` must lie in `2500..=60000` and be a multiple of
    /// 2500; this is checked before the codec is touched.
    pub fn new(sample_rate: u32, channels: u16, packet_duration_us: u32) -> Result<Self, CodecError> {
        if !(MIN_PACKET_DURATION_US..=MAX_PACKET_DURATION_US).contains(&packet_duration_us)
            || packet_duration_us % PACKET_DURATION_STEP_US != 0
        {
            return Err(CodecError::InvalidPacketDuration(packet_duration_us));
        }

        if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
            return Err(CodecError::UnsupportedSampleRate(sample_rate));
        }

        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        let frames_per_packet =
            (u64::from(sample_rate) * u64::from(packet_duration_us) / 1_000_000) as usize;
        let bytes_per_packet = frames_per_packet * channels as usize * SAMPLE_SIZE;
        let max_concealable_packets = MAX_CONCEALMENT_US / packet_duration_us;

        let max_frames = sample_rate as usize * MAX_FRAME_MS / 1000;
        let decode_buffer = vec![0i16; max_frames * channels as usize];

        tracing::debug!(
            sample_rate,
            channels,
            packet_duration_us,
            frames_per_packet,
            "Opus decoder created"
        );

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            packet_duration_us,
            frames_per_packet,
            bytes_per_packet,
            max_concealable_packets,
            decode_buffer,
            packets_decoded: 0,
            packets_concealed: 0,
            bytes_produced: 0,
        })
    }

    /// Decode one Opus packet into interleaved little-endian PCM16 bytes.
    ///
    /// Returns the number of bytes written to `out`.
    pub fn decode(&mut self, compressed: &[u8], out: &mut [u8]) -> Result<usize, CodecError> {
        let frames = self
            .decoder
            .decode(compressed, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        let written = self.copy_out(frames, out)?;
        self.packets_decoded += 1;
        Ok(written)
    }

    /// Synthesize `frames_requested` frames of concealment audio from the
    /// decoder's retained state.
    ///
    /// The requested duration must be a multiple of 2.5 ms.
    pub fn plc(&mut self, out: &mut [u8], frames_requested: usize) -> Result<usize, CodecError> {
        let frames_per_step = (self.sample_rate / 400) as usize;
        if frames_requested == 0
            || frames_requested % frames_per_step != 0
            || frames_requested * self.channels as usize > self.decode_buffer.len()
        {
            return Err(CodecError::ConcealmentFailed(format!(
                "{} frames is not a valid concealment length at {} Hz",
                frames_requested, self.sample_rate
            )));
        }

        let needed = frames_requested * self.channels as usize * SAMPLE_SIZE;
        if out.len() < needed {
            return Err(CodecError::OutputTooSmall {
                needed,
                available: out.len(),
            });
        }

        let samples = frames_requested * self.channels as usize;
        let frames = self
            .decoder
            .decode(&[], &mut self.decode_buffer[..samples], false)
            .map_err(|e| CodecError::ConcealmentFailed(e.to_string()))?;

        let written = self.copy_out(frames, out)?;
        self.packets_concealed += 1;
        Ok(written)
    }

    fn copy_out(&mut self, frames: usize, out: &mut [u8]) -> Result<usize, CodecError> {
        let samples = frames * self.channels as usize;
        let needed = samples * SAMPLE_SIZE;
        if out.len() < needed {
            return Err(CodecError::OutputTooSmall {
                needed,
                available: out.len(),
            });
        }

        for (dst, sample) in out[..needed]
            .chunks_exact_mut(SAMPLE_SIZE)
            .zip(&self.decode_buffer[..samples])
        {
            dst.copy_from_slice(&sample.to_le_bytes());
        }

        self.bytes_produced += needed as u64;
        Ok(needed)
    }

    /// Release the native decoder state.
    pub fn release(self) {
        tracing::debug!(
            packets_decoded = self.packets_decoded,
            packets_concealed = self.packets_concealed,
            "Opus decoder released"
        );
        drop(self.decoder);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn packet_duration_us(&self) -> u32 {
        self.packet_duration_us
    }

    /// Frames (samples per channel) in one packet
    pub fn frames_per_packet(&self) -> usize {
        self.frames_per_packet
    }

    /// PCM bytes in one packet
    pub fn bytes_per_packet(&self) -> usize {
        self.bytes_per_packet
    }

    /// Number of consecutive packets that may be concealed (60 ms worth)
    pub fn max_concealable_packets(&self) -> u32 {
        self.max_concealable_packets
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            packets_decoded: self.packets_decoded,
            packets_concealed: self.packets_concealed,
            bytes_produced: self.bytes_produced,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub packets_decoded: u64,
    pub packets_concealed: u64,
    pub bytes_produced: u64,
}
