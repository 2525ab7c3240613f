//! Lock-free sample ring between the playback loop and the output callback
//!
//! The playback loop pushes PCM16 samples and suspends while the ring is
//! full; the audio callback pops them and wakes the writer. The ring's
//! capacity is the sink's jitter buffer.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::codec::SAMPLE_SIZE;

/// Ring of interleaved PCM16 samples
pub struct SampleRing {
    queue: ArrayQueue<i16>,
    /// Signalled by the consumer whenever it frees space
    space: Notify,
    muted: AtomicBool,
    underrun_count: AtomicUsize,
}

impl SampleRing {
    /// Create a ring holding `capacity` samples (frames x channels)
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            space: Notify::new(),
            muted: AtomicBool::new(false),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push as many whole little-endian samples from `pcm` as fit.
    ///
    /// Returns the number of bytes consumed.
    pub fn push_pcm(&self, pcm: &[u8]) -> usize {
        let mut consumed = 0;
        for chunk in pcm.chunks_exact(SAMPLE_SIZE) {
            if self.queue.push(i16::from_le_bytes([chunk[0], chunk[1]])).is_err() {
                break;
            }
            consumed += SAMPLE_SIZE;
        }
        consumed
    }

    /// Push all of `pcm`, waiting for the consumer whenever the ring is full.
    ///
    /// A trailing odd byte is ignored.
    pub async fn write(&self, pcm: &[u8]) {
        let whole = pcm.len() - pcm.len() % SAMPLE_SIZE;
        let mut offset = 0;
        while offset < whole {
            offset += self.push_pcm(&pcm[offset..whole]);
            if offset < whole {
                self.space.notified().await;
            }
        }
    }

    /// Fill an output buffer, padding with silence on underrun.
    ///
    /// Called from the audio callback.
    pub fn fill_output(&self, out: &mut [f32]) {
        let muted = self.muted.load(Ordering::Relaxed);
        let mut starved = false;

        for slot in out.iter_mut() {
            *slot = match self.queue.pop() {
                Some(_) if muted => 0.0,
                Some(sample) => f32::from(sample) / 32768.0,
                None => {
                    starved = true;
                    0.0
                }
            };
        }

        if starved {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        self.space.notify_one();
    }

    /// Pop one sample
    pub fn pop(&self) -> Option<i16> {
        let sample = self.queue.pop();
        if sample.is_some() {
            self.space.notify_one();
        }
        sample
    }

    /// Drop everything buffered
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
        self.space.notify_one();
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of callbacks that ran out of samples
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.underrun_count.store(0, Ordering::Relaxed);
    }
}
