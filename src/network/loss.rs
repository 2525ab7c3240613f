//! Audio sequence tracking and the shared loss counter

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Gaps at or above this are treated as late or duplicate packets
const REORDER_THRESHOLD: u16 = 0x8000;

/// Consecutive stale packets after which the stream is assumed to have jumped
const RESYNC_AFTER: u16 = 8;

/// Number of packets missing between `previous` and `current`.
///
/// Wraparound-safe; only meaningful while the real gap is well below
/// `u16::MAX`.
pub const fn calculate_gap(previous: u16, current: u16) -> u16 {
    current.wrapping_sub(previous).wrapping_sub(1)
}

/// What to do with an incoming audio packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// Forward it; `lost` packets went missing right before it
    Forward { lost: u16 },
    /// Late or duplicate, drop it
    Stale,
}

/// Tracks contiguity of the audio stream for one connection
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
    stale_run: u16,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sequence: u16) -> SequenceVerdict {
        let Some(previous) = self.last else {
            self.last = Some(sequence);
            return SequenceVerdict::Forward { lost: 0 };
        };

        let gap = calculate_gap(previous, sequence);
        if gap >= REORDER_THRESHOLD {
            self.stale_run += 1;
            if self.stale_run < RESYNC_AFTER {
                return SequenceVerdict::Stale;
            }
            // The sender restarted or skipped far ahead; take this as the new base
            self.stale_run = 0;
            self.last = Some(sequence);
            return SequenceVerdict::Forward { lost: 0 };
        }

        self.stale_run = 0;
        self.last = Some(sequence);
        SequenceVerdict::Forward { lost: gap }
    }

    /// Forget the stream position; the next packet starts a new run
    pub fn reset(&mut self) {
        self.last = None;
        self.stale_run = 0;
    }
}

/// Count of missing audio packets, written by the session and drained by
/// playback before each unit it plays.
#[derive(Debug, Clone, Default)]
pub struct LossCounter(Arc<AtomicU32>);

impl LossCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, lost: u32) {
        if lost > 0 {
            self.0.fetch_add(lost, Ordering::AcqRel);
        }
    }

    /// Read and reset
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_gap() {
        assert_eq!(calculate_gap(1, 2), 0);
        assert_eq!(calculate_gap(1, 5), 3);
        assert_eq!(calculate_gap(u16::MAX, 0), 0);
        assert_eq!(calculate_gap(u16::MAX - 1, 2), 3);
        // Duplicate wraps to the top of the range
        assert_eq!(calculate_gap(9, 9), u16::MAX);
    }

    #[test]
    fn test_tracker() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(100), SequenceVerdict::Forward { lost: 0 });
        assert_eq!(tracker.observe(101), SequenceVerdict::Forward { lost: 0 });
        assert_eq!(tracker.observe(105), SequenceVerdict::Forward { lost: 3 });
        assert_eq!(tracker.observe(104), SequenceVerdict::Stale);
        assert_eq!(tracker.observe(105), SequenceVerdict::Stale);
        assert_eq!(tracker.observe(106), SequenceVerdict::Forward { lost: 0 });

        tracker.reset();
        assert_eq!(tracker.observe(3), SequenceVerdict::Forward { lost: 0 });
    }

    #[test]
    fn test_tracker_wraps() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(u16::MAX);
        assert_eq!(tracker.observe(1), SequenceVerdict::Forward { lost: 1 });
    }

    #[test]
    fn test_tracker_resyncs_after_stale_run() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(1);

        for sequence in 40000..40000 + RESYNC_AFTER - 1 {
            assert_eq!(tracker.observe(sequence), SequenceVerdict::Stale);
        }
        let base = 40000 + RESYNC_AFTER - 1;
        assert_eq!(tracker.observe(base), SequenceVerdict::Forward { lost: 0 });
        assert_eq!(tracker.observe(base + 1), SequenceVerdict::Forward { lost: 0 });
    }

    #[test]
    fn test_forward_breaks_stale_run() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(100);

        for _ in 0..RESYNC_AFTER - 1 {
            assert_eq!(tracker.observe(90), SequenceVerdict::Stale);
        }
        assert_eq!(tracker.observe(101), SequenceVerdict::Forward { lost: 0 });

        // The run starts over after a packet in order
        for _ in 0..RESYNC_AFTER - 1 {
            assert_eq!(tracker.observe(90), SequenceVerdict::Stale);
        }
        assert_eq!(tracker.observe(102), SequenceVerdict::Forward { lost: 0 });
    }

    #[test]
    fn test_loss_counter() {
        let counter = LossCounter::new();
        let writer = counter.clone();
        writer.add(2);
        writer.add(0);
        writer.add(3);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.take(), 5);
        assert_eq!(counter.take(), 0);
    }
}
