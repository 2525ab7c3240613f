//! Platform audio output
//!
//! The playback loop writes PCM16 into an [`AudioSink`]. The cpal
//! implementation runs its output stream on a dedicated thread and feeds it
//! from a [`SampleRing`] sized as a jitter buffer.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::SampleRing;
use crate::audio::device::{find_output_device, AudioDevice};
use crate::error::AudioError;

/// Minimum buffer assumed when the device does not report one
const FALLBACK_MIN_BUFFER_MS: u32 = 20;
const MIN_JITTER_MS: u32 = 250;
const MAX_JITTER_MS: u32 = 750;

/// Destination for decoded audio
pub trait AudioSink: Send + 'static {
    /// Begin output. Calling it on a running sink is a no-op.
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop output and discard anything buffered
    fn stop(&mut self);

    /// Queue interleaved little-endian PCM16, suspending while the sink is full
    fn write<'a>(&'a mut self, pcm: &'a [u8]) -> BoxFuture<'a, Result<(), AudioError>>;

    /// Keep consuming samples but output silence
    fn set_muted(&mut self, muted: bool);

    /// Pop one asynchronous error reported by the platform, if any
    fn take_error(&mut self) -> Option<AudioError> {
        None
    }

    /// Free platform resources. The sink is not used afterwards.
    fn release(&mut self);
}

/// Jitter buffer size in frames: four platform minimums, clamped to 250..=750 ms
pub fn jitter_buffer_frames(platform_min_frames: u32, sample_rate: u32) -> u32 {
    let lower = (u64::from(sample_rate) * u64::from(MIN_JITTER_MS) / 1000) as u32;
    let upper = (u64::from(sample_rate) * u64::from(MAX_JITTER_MS) / 1000) as u32;
    platform_min_frames.saturating_mul(4).clamp(lower, upper)
}

/// Output through the default cpal host
pub struct CpalSink {
    /// Device name, `None` for the system default
    device_name: Option<String>,

    config: StreamConfig,

    ring: Arc<SampleRing>,

    /// Whether the output stream is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors
    error_rx: Option<Receiver<AudioError>>,
}

impl CpalSink {
    /// Open a sink on `device` for the given stream format.
    pub fn new(device: AudioDevice, sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        if channels == 0 {
            return Err(AudioError::UnsupportedFormat("zero channels".to_string()));
        }

        let min_frames = device
            .min_buffer_frames(sample_rate, channels)
            .unwrap_or(sample_rate * FALLBACK_MIN_BUFFER_MS / 1000);
        let frames = jitter_buffer_frames(min_frames, sample_rate);

        tracing::info!(
            device = %device.name,
            sample_rate,
            channels,
            jitter_frames = frames,
            "Output sink created"
        );

        Ok(Self {
            device_name: Some(device.name),
            config: StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            ring: Arc::new(SampleRing::new(frames as usize * channels as usize)),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
        })
    }

    /// Open a sink on a device chosen by name, or the default device
    pub fn open(name: Option<&str>, sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        Self::new(find_output_device(name)?, sample_rate, channels)
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl AudioSink for CpalSink {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_output_device(self.device_name.as_deref())?;
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let ring = self.ring.clone();
        let config = self.config.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("playback-sink".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = cpal_device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        ring.fill_output(data);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::CpalError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, stopping output
            })
            .map_err(|e| AudioError::StreamError(e.to_string()));

        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("output thread exited".to_string())));
        if let Err(e) = ready {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            tracing::error!("Failed to start output stream: {}", e);
            return Err(e);
        }

        self.thread_handle = Some(handle);
        tracing::debug!("Output stream started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!(underruns = self.ring.underrun_count(), "Output stream stopped");
        }
        self.ring.clear();
        self.ring.reset_stats();
    }

    fn write<'a>(&'a mut self, pcm: &'a [u8]) -> BoxFuture<'a, Result<(), AudioError>> {
        Box::pin(async move {
            if !self.running.load(Ordering::SeqCst) {
                return Err(AudioError::StreamError("output stream is not running".to_string()));
            }
            self.ring.write(pcm).await;
            Ok(())
        })
    }

    fn set_muted(&mut self, muted: bool) {
        self.ring.set_muted(muted);
    }

    fn take_error(&mut self) -> Option<AudioError> {
        self.check_errors()
    }

    fn release(&mut self) {
        self.stop();
        self.error_rx = None;
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_scales_platform_minimum() {
        // 4 x 4800 = 19200 frames = 400 ms at 48 kHz
        assert_eq!(jitter_buffer_frames(4800, 48000), 19200);
    }

    #[test]
    fn test_jitter_clamped_low() {
        // 4 x 256 is far below 250 ms
        assert_eq!(jitter_buffer_frames(256, 48000), 12000);
        assert_eq!(jitter_buffer_frames(0, 8000), 2000);
    }

    #[test]
    fn test_jitter_clamped_high() {
        assert_eq!(jitter_buffer_frames(48000, 48000), 36000);
        assert_eq!(jitter_buffer_frames(u32::MAX, 48000), 36000);
    }

    #[test]
    fn test_jitter_fallback_minimum() {
        let min = 48000 * FALLBACK_MIN_BUFFER_MS / 1000;
        assert_eq!(jitter_buffer_frames(min, 48000), 12000);
    }
}
