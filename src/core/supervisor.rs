//! Session Lifecycle Supervisor
//!
//! Periodic reconciliation of live connections against persisted session
//! status:
//!
//! - connections whose transport is no longer open are reaped
//! - a session left without live connections is paused once its grace
//!   period runs out, unless somebody joins first
//! - a session whose persisted status turned terminal has every remaining
//!   connection notified and closed

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::core::broadcast::{BroadcastManager, ConnectionHandle};
use crate::core::encounter::EncounterRegistry;
use crate::core::locks::lock;
use crate::core::persistence::{SessionStatus, SessionStatusStore};
use crate::core::protocol::ServerMessage;

#[derive(Debug, Default)]
struct TrackedSession {
    connections: HashSet<String>,
    /// Set when the live set became empty; cleared by a join
    empty_since: Option<Instant>,
}

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped_connections: usize,
    pub pruned_subscriptions: usize,
    pub paused_sessions: Vec<String>,
    pub terminated_sessions: Vec<String>,
}

pub struct SessionSupervisor {
    sessions: Mutex<HashMap<String, TrackedSession>>,
    broadcaster: Arc<BroadcastManager>,
    registry: Arc<EncounterRegistry>,
    status_store: Arc<dyn SessionStatusStore>,
    grace_period: Duration,
}

impl SessionSupervisor {
    pub fn new(
        broadcaster: Arc<BroadcastManager>,
        registry: Arc<EncounterRegistry>,
        status_store: Arc<dyn SessionStatusStore>,
        grace_period: Duration,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            broadcaster,
            registry,
            status_store,
            grace_period,
        }
    }

    /// Add a connection to a session's live set, cancelling any pending pause
    pub fn join(&self, session_id: &str, connection_id: &str) {
        let mut sessions = lock(&self.sessions);
        let entry = sessions.entry(session_id.to_string()).or_default();
        if entry.empty_since.take().is_some() {
            tracing::info!(session_id, connection_id, "Reconnect within grace period; pause cancelled");
        }
        entry.connections.insert(connection_id.to_string());
    }

    /// Forget a closed connection; arms the grace period if it was the last
    pub fn connection_closed(&self, connection_id: &str, now: Instant) {
        let mut sessions = lock(&self.sessions);
        for (session_id, entry) in sessions.iter_mut() {
            if entry.connections.remove(connection_id) && entry.connections.is_empty() {
                entry.empty_since = Some(now);
                tracing::debug!(session_id = %session_id, "Session empty; grace period started");
            }
        }
    }

    pub fn is_tracking(&self, session_id: &str) -> bool {
        lock(&self.sessions).contains_key(session_id)
    }

    pub fn pause_pending(&self, session_id: &str) -> bool {
        lock(&self.sessions)
            .get(session_id)
            .is_some_and(|entry| entry.empty_since.is_some())
    }

    pub fn live_connections(&self, session_id: &str) -> usize {
        lock(&self.sessions)
            .get(session_id)
            .map_or(0, |entry| entry.connections.len())
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// One reconciliation pass at the given instant
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport {
            pruned_subscriptions: self
                .broadcaster
                .prune_subscriptions(|encounter_id| self.registry.contains(encounter_id)),
            ..SweepReport::default()
        };

        let session_ids: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        for session_id in session_ids {
            report.reaped_connections += self.reap_dead(&session_id, now);

            let status = match self.status_store.session_status(&session_id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to read session status");
                    None
                }
            };

            if let Some(status) = status.filter(SessionStatus::is_terminal) {
                self.terminate(&session_id, status);
                report.terminated_sessions.push(session_id);
                continue;
            }

            if self.claim_expired(&session_id, now) {
                match self
                    .status_store
                    .set_session_status(&session_id, SessionStatus::Paused)
                    .await
                {
                    Ok(()) => tracing::info!(session_id = %session_id, "Grace period expired; session paused"),
                    Err(e) => tracing::error!(
                        session_id = %session_id,
                        operation = "pause_session",
                        error = %e,
                        "Failed to persist session pause"
                    ),
                }
                report.paused_sessions.push(session_id);
            }
        }

        if report.reaped_connections > 0 || !report.paused_sessions.is_empty() || !report.terminated_sessions.is_empty() {
            tracing::debug!(?report, "Supervisor sweep");
        }
        report
    }

    /// Run sweeps on a fixed interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Session supervisor stopped");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn reap_dead(&self, session_id: &str, now: Instant) -> usize {
        let members: Vec<String> = match lock(&self.sessions).get(session_id) {
            Some(entry) => entry.connections.iter().cloned().collect(),
            None => return 0,
        };

        let dead: Vec<String> = members
            .into_iter()
            .filter(|id| !self.broadcaster.handle(id).is_some_and(|h| h.is_open()))
            .collect();
        if dead.is_empty() {
            return 0;
        }

        for connection_id in &dead {
            self.broadcaster.remove_connection(connection_id);
            tracing::debug!(session_id, connection_id = %connection_id, "Reaped dead connection");
        }

        let mut sessions = lock(&self.sessions);
        if let Some(entry) = sessions.get_mut(session_id) {
            for connection_id in &dead {
                entry.connections.remove(connection_id);
            }
            if entry.connections.is_empty() && entry.empty_since.is_none() {
                entry.empty_since = Some(now);
            }
        }
        dead.len()
    }

    /// Stop tracking the session if its grace period ran out. Only one
    /// caller can win the claim, so the pause is written once.
    fn claim_expired(&self, session_id: &str, now: Instant) -> bool {
        let mut sessions = lock(&self.sessions);
        let expired = sessions.get(session_id).is_some_and(|entry| {
            entry.connections.is_empty()
                && entry
                    .empty_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= self.grace_period)
        });
        if expired {
            sessions.remove(session_id);
        }
        expired
    }

    fn terminate(&self, session_id: &str, status: SessionStatus) {
        let members: Vec<String> = lock(&self.sessions)
            .remove(session_id)
            .map(|entry| entry.connections.into_iter().collect())
            .unwrap_or_default();

        let handles: Vec<ConnectionHandle> = members
            .iter()
            .filter_map(|id| self.broadcaster.handle(id))
            .collect();

        for handle in &handles {
            handle.send(ServerMessage::session_terminated(session_id, status.as_str()));
            handle.close(format!("Session {} is {}", session_id, status));
            self.broadcaster.remove_connection(handle.id());
        }
        tracing::info!(
            session_id,
            status = %status,
            closed = handles.len(),
            "Session terminated; connections closed"
        );
    }
}
