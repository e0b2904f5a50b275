//! Broadcast Module
//!
//! Connection handles, acknowledgement tracking and the per-encounter
//! subscription fan-out.

pub mod ack;
pub mod connection;
pub mod manager;

pub use ack::{AckTracker, DeliveryPolicy};
pub use connection::{ConnectionHandle, ConnectionRecord, Outbound};
pub use manager::{BroadcastManager, Subscription};
