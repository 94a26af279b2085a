//! Per-connection outbound queue
//!
//! A bounded mailbox with one producer (the hub) and one consumer (the
//! connection's write pump). The hub holds the only sender; dropping it is
//! how the queue gets closed.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// An opaque broadcast payload, shared between every queue it lands in
pub type Payload = Arc<[u8]>;

/// Why a non-blocking enqueue was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("Outbound queue is full")]
    Full,
    #[error("Outbound queue consumer is gone")]
    Closed,
}

/// Create a queue with room for `capacity` pending payloads
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutboundSender { tx }, OutboundQueue { rx })
}

/// Producer side, owned by the hub once the connection is registered
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Payload>,
}

impl OutboundSender {
    /// Enqueue without waiting
    pub fn try_enqueue(&self, payload: Payload) -> Result<(), EnqueueError> {
        self.tx.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Consumer side, owned by the write pump
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Payload>,
}

impl OutboundQueue {
    /// Wait for the next payload. `None` once the hub has closed the queue
    /// and everything queued before that has been taken.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Take whatever is queued right now, without waiting
    ///
    /// Bounded by the length at call time so a busy producer cannot keep the
    /// caller here forever.
    pub fn drain_ready(&mut self) -> Vec<Payload> {
        let pending = self.rx.len();
        let mut ready = Vec::with_capacity(pending);
        for _ in 0..pending {
            match self.rx.try_recv() {
                Ok(payload) => ready.push(payload),
                Err(_) => break,
            }
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
