//! Acknowledgement tracking for outbound messages that request one.
//!
//! A tracked message is resent when its ack timeout elapses, at most
//! `max_retries` times, and then dropped with a logged failure.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingAck {
    message: ServerMessage,
    last_sent: Instant,
    retries: u32,
}

#[derive(Debug)]
pub struct AckTracker {
    policy: DeliveryPolicy,
    next_id: u64,
    pending: BTreeMap<u64, PendingAck>,
}

impl AckTracker {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            policy,
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Assign an ack id and start waiting for it
    pub fn track(&mut self, mut message: ServerMessage, now: Instant) -> ServerMessage {
        let ack_id = self.next_id;
        self.next_id += 1;
        message.ack_id = Some(ack_id);
        self.pending.insert(
            ack_id,
            PendingAck {
                message: message.clone(),
                last_sent: now,
                retries: 0,
            },
        );
        message
    }

    /// Returns false for unknown or already acknowledged ids
    pub fn acknowledge(&mut self, ack_id: u64) -> bool {
        self.pending.remove(&ack_id).is_some()
    }

    /// Messages whose timeout elapsed and that still have retries left.
    /// Exhausted entries are dropped.
    pub fn due(&mut self, now: Instant, connection_id: &str) -> Vec<ServerMessage> {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();

        for (ack_id, entry) in self.pending.iter_mut() {
            if now.saturating_duration_since(entry.last_sent) < self.policy.ack_timeout {
                continue;
            }
            if entry.retries >= self.policy.max_retries {
                exhausted.push(*ack_id);
                continue;
            }
            entry.retries += 1;
            entry.last_sent = now;
            resend.push(entry.message.clone());
        }

        for ack_id in exhausted {
            if let Some(entry) = self.pending.remove(&ack_id) {
                tracing::warn!(
                    connection_id,
                    ack_id,
                    message_type = ?entry.message.message_type,
                    retries = entry.retries,
                    "Dropping unacknowledged message"
                );
            }
        }
        resend
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
