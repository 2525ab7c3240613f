//! Bounded queues carrying audio from the session to playback
//!
//! One queue per source. A full queue suspends the sender rather than
//! dropping audio.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Default capacity of each audio queue, in packets
pub const AUDIO_QUEUE_CAPACITY: usize = 32;

/// Producer side, owned by the session
#[derive(Debug, Clone)]
pub struct AudioSenders {
    pub uncompressed: mpsc::Sender<Bytes>,
    pub opus: mpsc::Sender<Bytes>,
}

/// Consumer side, owned by playback
#[derive(Debug)]
pub struct AudioReceivers {
    pub uncompressed: mpsc::Receiver<Bytes>,
    pub opus: mpsc::Receiver<Bytes>,
}

/// One packet of audio tagged by source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioItem {
    /// Interleaved PCM16, played as is
    Uncompressed(Bytes),
    /// Opus frame, decoded before playing
    Opus(Bytes),
}

impl AudioReceivers {
    /// Wait for whichever queue has data first.
    ///
    /// Returns `None` once both queues are closed and drained. Cancel-safe.
    pub async fn recv(&mut self) -> Option<AudioItem> {
        tokio::select! {
            Some(pcm) = self.uncompressed.recv() => Some(AudioItem::Uncompressed(pcm)),
            Some(packet) = self.opus.recv() => Some(AudioItem::Opus(packet)),
            else => None,
        }
    }
}

/// Create both audio queues
pub fn audio_channels(capacity: usize) -> (AudioSenders, AudioReceivers) {
    let (uncompressed_tx, uncompressed_rx) = mpsc::channel(capacity);
    let (opus_tx, opus_rx) = mpsc::channel(capacity);
    (
        AudioSenders {
            uncompressed: uncompressed_tx,
            opus: opus_tx,
        },
        AudioReceivers {
            uncompressed: uncompressed_rx,
            opus: opus_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_serves_both_sources() {
        let (tx, mut rx) = audio_channels(4);
        tx.opus.send(Bytes::from_static(b"a")).await.unwrap();
        tx.uncompressed.send(Bytes::from_static(b"b")).await.unwrap();

        let mut items = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        items.sort_by_key(|item| matches!(item, AudioItem::Opus(_)));
        assert_eq!(
            items,
            vec![
                AudioItem::Uncompressed(Bytes::from_static(b"b")),
                AudioItem::Opus(Bytes::from_static(b"a")),
            ]
        );
    }

    #[tokio::test]
    async fn test_recv_ends_when_both_closed() {
        let (tx, mut rx) = audio_channels(4);
        tx.opus.send(Bytes::from_static(b"last")).await.unwrap();
        drop(tx);

        assert_eq!(
            rx.recv().await,
            Some(AudioItem::Opus(Bytes::from_static(b"last")))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_queue_suspends_sender() {
        let (tx, _rx) = audio_channels(1);
        tx.opus.send(Bytes::from_static(b"1")).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            tx.opus.send(Bytes::from_static(b"2")),
        )
        .await;
        assert!(blocked.is_err());
    }
}
