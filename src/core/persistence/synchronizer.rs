//! Persistence Synchronizer
//!
//! Trailing, best-effort projection of encounter events into durable
//! storage. The registry-side [`SyncListener`] only enqueues a copy of each
//! committed event; the [`PersistenceSynchronizer`] task applies them one at
//! a time, in order, and never reports back. A failed write is logged with
//! encounter and operation context and the live session carries on.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};

use super::store::{EncounterStore, StoreError};
use crate::core::encounter::{
    EncounterEvent, EncounterListener, EncounterRegistry, EncounterStatus, EventContext, EventRecord,
};
use crate::core::error::EngineError;

enum SyncCommand {
    Apply(EventRecord),
    Flush(oneshot::Sender<()>),
}

/// Registry listener feeding the synchronizer task
#[derive(Clone)]
pub struct SyncListener {
    tx: mpsc::UnboundedSender<SyncCommand>,
}

impl SyncListener {
    /// Resolves once every event queued before this call has been applied
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SyncCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl EncounterListener for SyncListener {
    fn on_event(&self, record: &EventRecord, _context: &EventContext) {
        if self.tx.send(SyncCommand::Apply(record.clone())).is_err() {
            tracing::error!(
                encounter_id = %record.encounter_id,
                event = record.event.name(),
                "Persistence synchronizer is gone; event not written back"
            );
        }
    }
}

pub struct PersistenceSynchronizer {
    store: Arc<dyn EncounterStore>,
    /// Weak so the registry -> listener -> task chain does not keep itself alive
    registry: Weak<EncounterRegistry>,
    rx: mpsc::UnboundedReceiver<SyncCommand>,
    conditions_supported: bool,
}

impl PersistenceSynchronizer {
    pub fn new(store: Arc<dyn EncounterStore>, registry: &Arc<EncounterRegistry>) -> (SyncListener, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conditions_supported = store.supports_conditions();
        if !conditions_supported {
            tracing::info!("Encounter store has no condition storage; condition changes are logged only");
        }
        (
            SyncListener { tx },
            Self {
                store,
                registry: Arc::downgrade(registry),
                rx,
                conditions_supported,
            },
        )
    }

    /// Process events until every listener handle is dropped
    pub async fn run(mut self) {
        tracing::debug!("Persistence synchronizer started");
        while let Some(command) = self.rx.recv().await {
            match command {
                SyncCommand::Apply(record) => self.process(&record).await,
                SyncCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Persistence synchronizer stopped");
    }

    async fn process(&self, record: &EventRecord) {
        let ended = matches!(record.event, EncounterEvent::CombatEnded { .. });

        if let Err(e) = self.apply(record).await {
            tracing::error!(
                encounter_id = %record.encounter_id,
                session_id = %record.session_id,
                sequence = record.sequence,
                event = record.event.name(),
                error = %e,
                "Encounter write-back failed"
            );
            if ended {
                // the stored row still reads as live; releasing now would let
                // hydration resurrect the encounter
                tracing::warn!(
                    encounter_id = %record.encounter_id,
                    "Completion not persisted; keeping live instance"
                );
            }
            return;
        }

        if ended {
            let released = self
                .registry
                .upgrade()
                .and_then(|registry| registry.release(&record.encounter_id));
            if released.is_some() {
                tracing::info!(encounter_id = %record.encounter_id, "Combat ended; live instance released");
            }
        }
    }

    /// Write one event's projection
    pub async fn apply(&self, record: &EventRecord) -> Result<(), EngineError> {
        let encounter_id = record.encounter_id.as_str();

        match &record.event {
            EncounterEvent::EncounterCreated { snapshot }
            | EncounterEvent::EncounterStarted { snapshot }
            | EncounterEvent::EncounterReset { snapshot } => self
                .store
                .save_encounter(snapshot)
                .await
                .map_err(|e| write_failure("save_encounter", e)),

            EncounterEvent::TurnAdvanced { turn_index, round, .. } => self
                .store
                .update_progress(encounter_id, *round, *turn_index)
                .await
                .map_err(|e| write_failure("update_progress", e)),

            EncounterEvent::RoundStarted { round } => self
                .store
                .update_round(encounter_id, *round)
                .await
                .map_err(|e| write_failure("update_round", e)),

            EncounterEvent::DamageApplied { combatant, .. }
            | EncounterEvent::HealingApplied { combatant, .. }
            | EncounterEvent::HitPointsSet { combatant, .. } => self
                .store
                .update_hit_points(encounter_id, combatant)
                .await
                .map_err(|e| write_failure("update_hit_points", e)),

            EncounterEvent::ConditionAdded { combatant_id, conditions, .. }
            | EncounterEvent::ConditionRemoved { combatant_id, conditions, .. } => {
                if !self.conditions_supported {
                    tracing::info!(
                        encounter_id,
                        combatant_id = %combatant_id,
                        conditions = conditions.len(),
                        "Condition storage unavailable; change not persisted"
                    );
                    return Ok(());
                }
                self.store
                    .replace_conditions(encounter_id, combatant_id, conditions)
                    .await
                    .map_err(|e| write_failure("replace_conditions", e))
            }

            EncounterEvent::CombatantAdded { combatant, position, turn_index } => self
                .store
                .insert_combatant(encounter_id, combatant, *position, *turn_index)
                .await
                .map_err(|e| write_failure("insert_combatant", e)),

            EncounterEvent::CombatantRemoved { combatant_id, turn_index } => self
                .store
                .delete_combatant(encounter_id, combatant_id, *turn_index)
                .await
                .map_err(|e| write_failure("delete_combatant", e)),

            EncounterEvent::StatusChanged { status } => self
                .store
                .update_status(encounter_id, *status)
                .await
                .map_err(|e| write_failure("update_status", e)),

            EncounterEvent::CombatEnded { .. } => self
                .store
                .update_status(encounter_id, EncounterStatus::Completed)
                .await
                .map_err(|e| write_failure("mark_completed", e)),

            // Carried by the hit point write
            EncounterEvent::CombatantDefeated { .. } | EncounterEvent::CombatantRevived { .. } => Ok(()),

            EncounterEvent::EncounterWarning { message } => {
                tracing::warn!(encounter_id, warning = %message, "Encounter warning");
                Ok(())
            }
        }
    }
}

fn write_failure(operation: &str, error: StoreError) -> EngineError {
    EngineError::PersistenceWriteFailure {
        operation: operation.to_string(),
        reason: error.to_string(),
    }
}
