//! Duplex connection abstraction.
//!
//! The transport task owns the receiving half of an unbounded channel and
//! writes whatever arrives to the socket. Everything else in the engine only
//! sees a [`ConnectionHandle`]: a cheap clone with a liveness flag that can
//! queue messages without awaiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;

use super::ack::{AckTracker, DeliveryPolicy};
use crate::core::locks::lock;
use crate::core::protocol::ServerMessage;

/// Frames queued for the transport writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { reason: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    acks: Arc<Mutex<AckTracker>>,
}

impl ConnectionHandle {
    pub fn new(policy: DeliveryPolicy) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_id(uuid::Uuid::new_v4().to_string(), policy)
    }

    pub fn with_id(
        id: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: id.into(),
            tx,
            open: Arc::new(AtomicBool::new(true)),
            acks: Arc::new(Mutex::new(AckTracker::new(policy))),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Open until closed locally or the transport goes away
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue a message. Returns false when the connection is not open.
    pub fn send(&self, message: ServerMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        let message = if message.message_type.requires_ack() {
            lock(&self.acks).track(message, Instant::now())
        } else {
            message
        };
        self.push(Outbound::Message(message))
    }

    /// Ask the writer to close the socket; no further sends are accepted
    pub fn close(&self, reason: impl Into<String>) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close { reason: reason.into() });
        }
        lock(&self.acks).clear();
    }

    /// Transport reported the peer gone
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
        lock(&self.acks).clear();
    }

    pub fn acknowledge(&self, ack_id: u64) -> bool {
        lock(&self.acks).acknowledge(ack_id)
    }

    /// Resend every tracked message whose ack timed out; returns how many
    pub fn resend_due(&self, now: Instant) -> usize {
        if !self.is_open() {
            return 0;
        }
        let due = lock(&self.acks).due(now, &self.id);
        let count = due.len();
        for message in due {
            tracing::debug!(connection_id = %self.id, ack_id = ?message.ack_id, "Resending unacknowledged message");
            self.push(Outbound::Message(message));
        }
        count
    }

    pub fn pending_acks(&self) -> usize {
        lock(&self.acks).pending_count()
    }

    fn push(&self, frame: Outbound) -> bool {
        if self.tx.send(frame).is_err() {
            self.open.store(false, Ordering::Release);
            return false;
        }
        true
    }
}

/// Per-connection state held by the broadcast manager
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub handle: ConnectionHandle,
    /// Set once by the authentication handshake
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl ConnectionRecord {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            user_id: None,
            session_id: None,
            connected_at: chrono::Utc::now(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}
