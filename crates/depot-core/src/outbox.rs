//! Outbound message queue.
//!
//! Everything the agent says to the server goes through here. A single
//! writer task owns the socket and drains the queue, so producers never
//! touch the connection directly.
//!
//! A small priority lane sits beside the main queue. Progress reports can
//! fill the main queue but never the lane, and the writer always empties the
//! lane first.

use crate::protocol::Outbound;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::debug;

/// Slots in the priority lane.
const PRIORITY_CAPACITY: usize = 4;

/// Producer handle for the outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
    priority: mpsc::Sender<Outbound>,
}

/// Consumer side, drained by the writer task.
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::Receiver<Outbound>,
    priority: mpsc::Receiver<Outbound>,
}

/// Create an outbox and the receiver the writer task drains.
pub fn channel(capacity: usize) -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (priority_tx, priority_rx) = mpsc::channel(PRIORITY_CAPACITY);
    (
        Outbox {
            tx,
            priority: priority_tx,
        },
        OutboxReceiver {
            rx,
            priority: priority_rx,
        },
    )
}

impl Outbox {
    /// Queue a message that must not be lost to backpressure.
    ///
    /// Waits for room. Returns false only if the writer is gone.
    pub async fn send(&self, msg: Outbound) -> bool {
        let kind = msg.kind();
        if self.tx.send(msg).await.is_err() {
            debug!("Outbox closed, dropping {}", kind);
            return false;
        }
        true
    }

    /// Queue a best-effort message (progress, heartbeat). Dropped if the queue is full.
    pub fn post(&self, msg: Outbound) -> bool {
        try_queue(&self.tx, msg)
    }

    /// Queue a message on the priority lane without waiting.
    ///
    /// For callers that can't block but whose message must not be crowded
    /// out by progress reports.
    pub fn post_priority(&self, msg: Outbound) -> bool {
        try_queue(&self.priority, msg)
    }
}

fn try_queue(tx: &mpsc::Sender<Outbound>, msg: Outbound) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            debug!("Outbox full, dropping {}", msg.kind());
            false
        }
        Err(TrySendError::Closed(msg)) => {
            debug!("Outbox closed, dropping {}", msg.kind());
            false
        }
    }
}

impl OutboxReceiver {
    /// Next message, priority lane first. None once every producer is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            Some(msg) = self.priority.recv() => Some(msg),
            Some(msg) = self.rx.recv() => Some(msg),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        match self.priority.try_recv() {
            Ok(msg) => Ok(msg),
            Err(_) => self.rx.try_recv(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_drops_when_full() {
        let (outbox, mut rx) = channel(1);
        assert!(outbox.post(Outbound::heartbeat(1)));
        assert!(!outbox.post(Outbound::heartbeat(2)));

        assert_eq!(rx.recv().await, Some(Outbound::heartbeat(1)));
        assert!(outbox.post(Outbound::heartbeat(3)));
        assert_eq!(rx.recv().await, Some(Outbound::heartbeat(3)));
    }

    #[tokio::test]
    async fn test_priority_lane_survives_full_queue() {
        let (outbox, mut rx) = channel(2);
        for pct in 0..5 {
            outbox.post(Outbound::heartbeat(pct));
        }
        assert!(outbox.post_priority(Outbound::file_list(Vec::new())));

        assert_eq!(rx.recv().await, Some(Outbound::file_list(Vec::new())));
        assert_eq!(rx.recv().await, Some(Outbound::heartbeat(0)));
        assert_eq!(rx.recv().await, Some(Outbound::heartbeat(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recv_ends_when_producers_drop() {
        let (outbox, mut rx) = channel(2);
        outbox.post(Outbound::heartbeat(1));
        drop(outbox);
        assert_eq!(rx.recv().await, Some(Outbound::heartbeat(1)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_reports_closed_writer() {
        let (outbox, rx) = channel(1);
        drop(rx);
        assert!(!outbox.send(Outbound::heartbeat(1)).await);
        assert!(!outbox.post(Outbound::heartbeat(1)));
        assert!(!outbox.post_priority(Outbound::heartbeat(1)));
    }
}
