//! Per-connection outbound queues with overflow detection.
//!
//! Each connection owns one bounded queue. A room fans a message out by
//! encoding it once and pushing the same `Arc` bytes into every member's
//! [`Outbox`]; the connection loop drains the matching [`Inbox`] into the
//! WebSocket.
//!
//! ```text
//! Room::broadcast(msg) ── encode once ──► Arc<Vec<u8>>
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//!    Outbox(a)          Outbox(b)          Outbox(c)      try_send, never blocks
//!        │                  │                  │
//!    Inbox(a)           Inbox(b)           Inbox(c)       drained by ws writer
//! ```
//!
//! A full queue means the peer cannot keep up. Dropping a delta would leave it
//! diverged forever, so overflow trips a signal that makes [`Inbox::recv`]
//! return `None` and the connection is closed; the editor rejoins and resyncs
//! from a fresh snapshot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::protocol::{ConnectionId, ProtocolError, ServerMessage};

/// Frame counters shared by every outbox of one coordinator.
#[derive(Debug, Default)]
pub struct FrameStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of pushing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the connection has been flagged for disconnect.
    Overflowed,
    /// Receiver is gone.
    Closed,
}

/// Sending half of a connection's queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    sender: mpsc::Sender<Arc<Vec<u8>>>,
    overflowed: Arc<AtomicBool>,
    overflow_signal: Arc<Notify>,
    stats: Arc<FrameStats>,
}

/// Receiving half, owned by the connection loop.
#[derive(Debug)]
pub struct Inbox {
    receiver: mpsc::Receiver<Arc<Vec<u8>>>,
    overflowed: Arc<AtomicBool>,
    overflow_signal: Arc<Notify>,
}

impl Outbox {
    /// Create a bounded queue of `capacity` frames for one connection.
    pub fn channel(
        connection_id: ConnectionId,
        capacity: usize,
        stats: Arc<FrameStats>,
    ) -> (Outbox, Inbox) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));
        let overflow_signal = Arc::new(Notify::new());
        (
            Outbox {
                connection_id,
                sender,
                overflowed: overflowed.clone(),
                overflow_signal: overflow_signal.clone(),
                stats,
            },
            Inbox {
                receiver,
                overflowed,
                overflow_signal,
            },
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Push pre-encoded bytes without blocking.
    pub fn push(&self, frame: Arc<Vec<u8>>) -> Delivery {
        if self.overflowed.load(Ordering::Acquire) {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Delivery::Overflowed;
        }
        match self.sender.try_send(frame) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                Delivery::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    log::warn!(
                        "Outbox of connection {} overflowed, disconnecting slow consumer",
                        self.connection_id
                    );
                    self.overflow_signal.notify_one();
                }
                Delivery::Overflowed
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Encode and push a single message.
    pub fn send(&self, msg: &ServerMessage) -> Result<Delivery, ProtocolError> {
        Ok(self.push(Arc::new(msg.encode()?)))
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Inbox {
    /// Next frame to write, or `None` once the queue is closed or overflowed.
    pub async fn recv(&mut self) -> Option<Arc<Vec<u8>>> {
        if self.overflowed.load(Ordering::Acquire) {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.overflow_signal.notified() => None,
            frame = self.receiver.recv() => frame,
        }
    }

    /// Non-blocking variant, for tests and draining.
    pub fn try_recv(&mut self) -> Option<Arc<Vec<u8>>> {
        if self.overflowed.load(Ordering::Acquire) {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Drain and decode everything currently queued.
    pub fn drain_messages(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(frame) = self.receiver.try_recv() {
            match ServerMessage::decode(&frame) {
                Ok(msg) => messages.push(msg),
                Err(e) => log::warn!("Undecodable queued frame: {}", e),
            }
        }
        messages
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}
