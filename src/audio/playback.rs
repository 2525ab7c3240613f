//! Playback multiplexer
//!
//! Drains the uncompressed and Opus queues, whichever is ready first,
//! decodes Opus packets, fills reported gaps and writes everything to an
//! [`AudioSink`]. The loop runs as a task on the runtime handed to
//! [`PlaybackMultiplexer::new`]; it owns the decoder and sink while playing
//! and hands them back when cancelled.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::channel::{AudioItem, AudioReceivers};
use crate::audio::sink::AudioSink;
use crate::codec::{AudioDecoder, SAMPLE_SIZE};
use crate::error::AudioError;
use crate::network::LossCounter;

/// Longest frame the decoder may emit, in milliseconds
const MAX_DECODED_MS: usize = 120;

/// Playback lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    /// Terminal
    Released,
}

/// How reported packet loss is filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concealment {
    /// One zero-filled packet per lost packet
    #[default]
    Silence,
    /// Opus packet loss concealment where the decoder allows it, silence beyond
    Codec,
}

/// Playback counters
#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    units_played: Arc<AtomicU64>,
    silence_units: Arc<AtomicU64>,
    concealed_units: Arc<AtomicU64>,
    decode_failures: Arc<AtomicU64>,
}

impl PlaybackStats {
    /// Packets of real audio written to the sink
    pub fn units_played(&self) -> u64 {
        self.units_played.load(Ordering::Relaxed)
    }

    pub fn silence_units(&self) -> u64 {
        self.silence_units.load(Ordering::Relaxed)
    }

    /// Packets synthesized by the decoder
    pub fn concealed_units(&self) -> u64 {
        self.concealed_units.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

/// Everything the play loop owns while running
struct PlayLoop<S> {
    receivers: AudioReceivers,
    decoder: AudioDecoder,
    sink: S,
    loss: LossCounter,
    concealment: Concealment,
    /// One packet of zeros
    silence: Vec<u8>,
    pcm: Vec<u8>,
    sink_muted: bool,
    stats: PlaybackStats,
}

impl<S: AudioSink> PlayLoop<S> {
    async fn run(mut self, cancel: CancellationToken, muted: Arc<AtomicBool>) -> Self {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = self.receivers.recv() => item,
            };

            let Some(item) = item else {
                tracing::debug!("Audio queues closed");
                break;
            };

            self.sync_mute(&muted);
            if !self.play_item(item, &cancel).await {
                break;
            }

            while let Some(e) = self.sink.take_error() {
                tracing::warn!("Output stream error: {}", e);
            }
        }
        self
    }

    fn sync_mute(&mut self, muted: &AtomicBool) {
        let muted = muted.load(Ordering::Relaxed);
        if muted != self.sink_muted {
            self.sink.set_muted(muted);
            self.sink_muted = muted;
        }
    }

    /// Returns `false` once cancelled.
    async fn play_item(&mut self, item: AudioItem, cancel: &CancellationToken) -> bool {
        let lost = self.loss.take();
        let concealed = match (&item, self.concealment) {
            (AudioItem::Opus(_), Concealment::Codec) => {
                lost.min(self.decoder.max_concealable_packets())
            }
            _ => 0,
        };

        if lost > 0 {
            tracing::trace!(lost, concealed, "Filling lost packets");
        }

        for _ in 0..concealed {
            let frames = self.decoder.frames_per_packet();
            match self.decoder.plc(&mut self.pcm, frames) {
                Ok(n) => {
                    if !write(&mut self.sink, &self.pcm[..n], cancel).await {
                        return false;
                    }
                    self.stats.concealed_units.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("Concealment failed, using silence: {}", e);
                    if !write(&mut self.sink, &self.silence, cancel).await {
                        return false;
                    }
                    self.stats.silence_units.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for _ in concealed..lost {
            if !write(&mut self.sink, &self.silence, cancel).await {
                return false;
            }
            self.stats.silence_units.fetch_add(1, Ordering::Relaxed);
        }

        let played = match item {
            AudioItem::Uncompressed(pcm) => write(&mut self.sink, &pcm, cancel).await,
            AudioItem::Opus(packet) => match self.decoder.decode(&packet, &mut self.pcm) {
                Ok(n) => write(&mut self.sink, &self.pcm[..n], cancel).await,
                Err(e) => {
                    tracing::warn!(len = packet.len(), "Dropping undecodable packet: {}", e);
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            },
        };

        if played {
            self.stats.units_played.fetch_add(1, Ordering::Relaxed);
        }
        played
    }
}

/// Write to the sink unless cancelled first. Returns `false` on cancellation.
async fn write<S: AudioSink>(sink: &mut S, pcm: &[u8], cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        result = sink.write(pcm) => {
            if let Err(e) = result {
                tracing::warn!("Sink write failed: {}", e);
            }
            true
        }
    }
}

struct ActiveLoop<S> {
    cancel: CancellationToken,
    handle: JoinHandle<PlayLoop<S>>,
}

/// Merges both audio queues into one sink
pub struct PlaybackMultiplexer<S: AudioSink> {
    state: PlaybackState,
    runtime: Handle,
    /// Present while stopped
    parts: Option<PlayLoop<S>>,
    /// Present while playing
    active: Option<ActiveLoop<S>>,
    muted: Arc<AtomicBool>,
    stats: PlaybackStats,
}

impl<S: AudioSink> PlaybackMultiplexer<S> {
    /// Create a stopped multiplexer. The play loop is spawned on `runtime`.
    pub fn new(
        runtime: Handle,
        receivers: AudioReceivers,
        decoder: AudioDecoder,
        sink: S,
        loss: LossCounter,
    ) -> Self {
        let silence = vec![0u8; decoder.bytes_per_packet()];
        let pcm = vec![
            0u8;
            decoder.sample_rate() as usize * MAX_DECODED_MS / 1000
                * decoder.channels() as usize
                * SAMPLE_SIZE
        ];
        let stats = PlaybackStats::default();

        Self {
            state: PlaybackState::Stopped,
            runtime,
            parts: Some(PlayLoop {
                receivers,
                decoder,
                sink,
                loss,
                concealment: Concealment::default(),
                silence,
                pcm,
                sink_muted: false,
                stats: stats.clone(),
            }),
            active: None,
            muted: Arc::new(AtomicBool::new(false)),
            stats,
        }
    }

    /// Select how lost packets are filled
    pub fn with_concealment(mut self, concealment: Concealment) -> Self {
        if let Some(parts) = self.parts.as_mut() {
            parts.concealment = concealment;
        }
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    /// Mute or unmute output. Playback keeps its pace while muted.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        if let Some(parts) = self.parts.as_mut() {
            parts.sink.set_muted(muted);
            parts.sink_muted = muted;
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Start the sink and the play loop.
    pub async fn start(&mut self) -> Result<(), AudioError> {
        match self.state {
            PlaybackState::Released => return Err(AudioError::Released),
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Stopped => {}
        }

        let mut parts = self.parts.take().ok_or(AudioError::Released)?;
        if let Err(e) = parts.sink.start() {
            self.parts = Some(parts);
            return Err(e);
        }

        let muted = self.muted.load(Ordering::Relaxed);
        parts.sink.set_muted(muted);
        parts.sink_muted = muted;

        let cancel = CancellationToken::new();
        let handle = self.runtime.spawn(parts.run(cancel.clone(), self.muted.clone()));
        self.active = Some(ActiveLoop { cancel, handle });
        self.state = PlaybackState::Playing;

        tracing::info!("Playback started");
        Ok(())
    }

    /// Cancel the play loop, wait for it to unwind and stop the sink.
    pub async fn stop(&mut self) -> Result<(), AudioError> {
        match self.state {
            PlaybackState::Released => return Err(AudioError::Released),
            PlaybackState::Stopped => return Ok(()),
            PlaybackState::Playing => {}
        }

        let mut parts = self.join_active().await?;
        parts.sink.stop();
        self.parts = Some(parts);
        self.state = PlaybackState::Stopped;

        tracing::info!(
            played = self.stats.units_played(),
            silence = self.stats.silence_units(),
            concealed = self.stats.concealed_units(),
            "Playback stopped"
        );
        Ok(())
    }

    /// Stop playback for good and free the decoder and sink.
    pub async fn release(&mut self) -> Result<(), AudioError> {
        if self.state == PlaybackState::Released {
            return Err(AudioError::Released);
        }

        let parts = if self.active.is_some() {
            Some(self.join_active().await?)
        } else {
            self.parts.take()
        };
        self.state = PlaybackState::Released;

        if let Some(parts) = parts {
            let PlayLoop {
                decoder, mut sink, ..
            } = parts;
            sink.stop();
            sink.release();
            decoder.release();
        }

        tracing::info!("Playback released");
        Ok(())
    }

    async fn join_active(&mut self) -> Result<PlayLoop<S>, AudioError> {
        let Some(active) = self.active.take() else {
            return self.parts.take().ok_or(AudioError::Released);
        };

        active.cancel.cancel();
        match active.handle.await {
            Ok(parts) => Ok(parts),
            Err(e) => {
                // The decoder and sink went down with the task
                tracing::error!("Play loop failed: {}", e);
                self.state = PlaybackState::Released;
                Err(AudioError::StreamError(e.to_string()))
            }
        }
    }
}

impl<S: AudioSink> Drop for PlaybackMultiplexer<S> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}
