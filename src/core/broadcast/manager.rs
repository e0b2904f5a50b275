//! Subscription & Broadcast Manager
//!
//! Owns the connection records, the userId -> connections index used for
//! direct delivery, and the encounterId -> subscriptions index used for
//! fan-out. Registered as an [`EncounterListener`], it turns every committed
//! event into one outbound message and queues it on each live subscriber.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::connection::{ConnectionHandle, ConnectionRecord};
use crate::core::encounter::{
    EncounterListener, EncounterRegistry, EncounterSnapshot, EventContext, EventRecord,
};
use crate::core::error::{EngineError, Result};
use crate::core::locks::{read, write};
use crate::core::protocol::ServerMessage;

/// One connection's registered interest in one encounter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub connection_id: String,
    pub encounter_id: String,
    pub user_id: String,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<String, ConnectionRecord>,
    by_user: HashMap<String, HashSet<String>>,
    /// encounter id -> connection id -> subscription
    by_encounter: HashMap<String, HashMap<String, Subscription>>,
}

#[derive(Default)]
pub struct BroadcastManager {
    tables: RwLock<Tables>,
}

impl BroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn register(&self, handle: ConnectionHandle) {
        let id = handle.id().to_string();
        tracing::debug!(connection_id = %id, "Connection registered");
        write(&self.tables).connections.insert(id, ConnectionRecord::new(handle));
    }

    /// Bind a user to the connection. The user id can only be set once.
    pub fn authenticate(&self, connection_id: &str, user_id: &str) -> Result<()> {
        let mut tables = write(&self.tables);
        let record = tables
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| EngineError::NotFound { entity: "Connection", id: connection_id.to_string() })?;

        match record.user_id.as_deref() {
            Some(existing) if existing == user_id => return Ok(()),
            Some(_) => {
                return Err(EngineError::InvalidState("Connection is already authenticated".into()));
            }
            None => record.user_id = Some(user_id.to_string()),
        }

        tables
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        Ok(())
    }

    pub fn bind_session(&self, connection_id: &str, session_id: &str) -> Result<()> {
        let mut tables = write(&self.tables);
        let record = tables
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| EngineError::NotFound { entity: "Connection", id: connection_id.to_string() })?;
        match record.session_id.as_deref() {
            Some(existing) if existing != session_id => Err(EngineError::InvalidState(format!(
                "Connection already belongs to session {}",
                existing
            ))),
            _ => {
                record.session_id = Some(session_id.to_string());
                Ok(())
            }
        }
    }

    pub fn record(&self, connection_id: &str) -> Option<ConnectionRecord> {
        read(&self.tables).connections.get(connection_id).cloned()
    }

    pub fn handle(&self, connection_id: &str) -> Option<ConnectionHandle> {
        read(&self.tables).connections.get(connection_id).map(|r| r.handle.clone())
    }

    pub fn user_of(&self, connection_id: &str) -> Option<String> {
        read(&self.tables).connections.get(connection_id).and_then(|r| r.user_id.clone())
    }

    pub fn connections_of_user(&self, user_id: &str) -> Vec<ConnectionHandle> {
        let tables = read(&self.tables);
        tables
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.connections.get(id))
                    .map(|r| r.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        read(&self.tables).connections.len()
    }

    /// Drop a connection and cascade its subscriptions and user index entry.
    /// Encounter state is untouched.
    pub fn remove_connection(&self, connection_id: &str) -> Option<ConnectionRecord> {
        let mut tables = write(&self.tables);
        let record = tables.connections.remove(connection_id)?;

        if let Some(user_id) = &record.user_id {
            if let Some(ids) = tables.by_user.get_mut(user_id) {
                ids.remove(connection_id);
                if ids.is_empty() {
                    tables.by_user.remove(user_id);
                }
            }
        }

        let mut dropped = 0usize;
        tables.by_encounter.retain(|_, subscribers| {
            if subscribers.remove(connection_id).is_some() {
                dropped += 1;
            }
            !subscribers.is_empty()
        });

        tracing::debug!(connection_id, subscriptions = dropped, "Connection removed");
        Some(record)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register interest in an encounter and deliver its full snapshot to the
    /// requesting connection only.
    ///
    /// The snapshot is taken while the encounter is held, so no event can
    /// slip between it and the first broadcast delta.
    pub fn subscribe(
        &self,
        registry: &EncounterRegistry,
        connection_id: &str,
        encounter_id: &str,
        request_id: Option<String>,
    ) -> Result<EncounterSnapshot> {
        let record = self
            .record(connection_id)
            .ok_or_else(|| EngineError::NotFound { entity: "Connection", id: connection_id.to_string() })?;
        let user_id = record
            .user_id
            .clone()
            .ok_or_else(|| EngineError::Unauthorized("Connection is not authenticated".into()))?;

        registry.inspect(encounter_id, |machine| {
            let snapshot = machine.snapshot();
            write(&self.tables)
                .by_encounter
                .entry(encounter_id.to_string())
                .or_default()
                .insert(
                    connection_id.to_string(),
                    Subscription {
                        connection_id: connection_id.to_string(),
                        encounter_id: encounter_id.to_string(),
                        user_id,
                    },
                );
            record
                .handle
                .send(ServerMessage::subscribed(&snapshot).with_request_id(request_id));
            tracing::debug!(connection_id, encounter_id, "Subscribed to encounter");
            snapshot
        })
    }

    /// Idempotent; returns whether a subscription was removed
    pub fn unsubscribe(&self, connection_id: &str, encounter_id: &str) -> bool {
        let mut tables = write(&self.tables);
        let Some(subscribers) = tables.by_encounter.get_mut(encounter_id) else {
            return false;
        };
        let removed = subscribers.remove(connection_id).is_some();
        if subscribers.is_empty() {
            tables.by_encounter.remove(encounter_id);
        }
        removed
    }

    pub fn is_subscribed(&self, connection_id: &str, encounter_id: &str) -> bool {
        read(&self.tables)
            .by_encounter
            .get(encounter_id)
            .is_some_and(|subs| subs.contains_key(connection_id))
    }

    pub fn subscriptions(&self, encounter_id: &str) -> Vec<Subscription> {
        read(&self.tables)
            .by_encounter
            .get(encounter_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        read(&self.tables).by_encounter.values().map(HashMap::len).sum()
    }

    /// Drop subscriptions whose encounter is no longer live
    pub fn prune_subscriptions(&self, is_live: impl Fn(&str) -> bool) -> usize {
        let stale: Vec<String> = read(&self.tables)
            .by_encounter
            .keys()
            .filter(|id| !is_live(id))
            .cloned()
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let mut tables = write(&self.tables);
        let mut pruned = 0;
        for encounter_id in stale {
            if let Some(subs) = tables.by_encounter.remove(&encounter_id) {
                tracing::debug!(encounter_id = %encounter_id, count = subs.len(), "Pruned stale subscriptions");
                pruned += subs.len();
            }
        }
        pruned
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Deliver to every open subscriber of the encounter except `exclude`.
    /// Connections that are not open are skipped; reaping them is the
    /// supervisor's job.
    pub fn broadcast(&self, encounter_id: &str, message: &ServerMessage, exclude: Option<&str>) -> usize {
        let targets: Vec<ConnectionHandle> = {
            let tables = read(&self.tables);
            match tables.by_encounter.get(encounter_id) {
                Some(subs) => subs
                    .keys()
                    .filter(|id| Some(id.as_str()) != exclude)
                    .filter_map(|id| tables.connections.get(id))
                    .map(|r| r.handle.clone())
                    .collect(),
                None => Vec::new(),
            }
        };

        targets
            .iter()
            .filter(|handle| handle.is_open())
            .filter(|handle| handle.send(message.clone()))
            .count()
    }

    pub fn send_to(&self, connection_id: &str, message: ServerMessage) -> bool {
        match self.handle(connection_id) {
            Some(handle) => handle.send(message),
            None => false,
        }
    }

    /// Direct delivery to every connection of a user
    pub fn send_to_user(&self, user_id: &str, message: &ServerMessage) -> usize {
        self.connections_of_user(user_id)
            .iter()
            .filter(|handle| handle.send(message.clone()))
            .count()
    }
}

impl EncounterListener for BroadcastManager {
    fn on_event(&self, record: &EventRecord, context: &EventContext) {
        let message = ServerMessage::from_event(record);
        let delivered = self.broadcast(&record.encounter_id, &message, context.origin.as_deref());

        if let Some(origin) = context.origin.as_deref() {
            self.send_to(origin, message.with_request_id(context.request_id.clone()));
        }

        tracing::trace!(
            encounter_id = %record.encounter_id,
            sequence = record.sequence,
            delivered,
            "Broadcast encounter event"
        );
    }
}
