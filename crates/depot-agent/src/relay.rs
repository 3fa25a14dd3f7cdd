//! Bounded hand-off from the socket read loop to the processing loop.
//!
//! The read loop must never wait on the processing side. When the queue is
//! full the frame is dropped on the spot and counted.

use depot_core::protocol::MessageKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// A frame waiting for the processing loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Tag seen by the read loop
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Producer side, owned by the read loop.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<Frame>,
    dropped: Arc<AtomicU64>,
}

pub fn channel(capacity: usize) -> (RelaySender, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        RelaySender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl RelaySender {
    /// Hand a frame over without waiting. Returns false if it was dropped.
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Processing queue full, dropped {:?} ({} bytes, {} dropped so far)",
                    frame.kind,
                    frame.payload.len(),
                    total
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Processing loop gone, dropped {:?}", frame.kind);
                false
            }
        }
    }

    /// Frames dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> Frame {
        Frame {
            kind: MessageKind::DownloadNotify,
            payload: vec![n],
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_only_excess_in_order() {
        let (relay, mut rx) = channel(4);

        let accepted: Vec<bool> = (0..10).map(|n| relay.push(frame(n))).collect();
        assert_eq!(accepted.iter().filter(|ok| **ok).count(), 4);
        assert_eq!(relay.dropped(), 6);

        let mut received = Vec::new();
        while let Ok(f) = rx.try_recv() {
            received.push(f.payload[0]);
        }
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_room_frees_up_after_consumption() {
        let (relay, mut rx) = channel(1);
        assert!(relay.push(frame(1)));
        assert!(!relay.push(frame(2)));
        assert_eq!(rx.recv().await.map(|f| f.payload), Some(vec![1]));
        assert!(relay.push(frame(3)));
    }

    #[tokio::test]
    async fn test_closed_consumer_counts_as_drop() {
        let (relay, rx) = channel(1);
        drop(rx);
        assert!(!relay.push(frame(1)));
        assert_eq!(relay.dropped(), 1);
    }
}
