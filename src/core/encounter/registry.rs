//! Encounter Registry
//!
//! The single shared mutable structure of the engine: encounter id -> live
//! state machine. All mutation funnels through [`EncounterRegistry::mutate`],
//! which runs the operation to completion, drains the machine's event queue
//! and hands every event to the registered listeners in emission order
//! before the encounter is released for the next caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::combat::{EncounterMachine, EncounterSnapshot};
use super::conditions::ConditionCatalog;
use super::events::{EncounterEvent, EncounterListener, EventContext, EventRecord};
use crate::core::error::{EngineError, Result};
use crate::core::locks::{lock, read, write};

struct Slot {
    machine: EncounterMachine,
    sequence: u64,
}

/// Result of a committed mutation
#[derive(Debug)]
pub struct Mutation<T> {
    pub value: T,
    pub records: Vec<EventRecord>,
}

pub struct EncounterRegistry {
    encounters: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
    listeners: RwLock<Vec<Arc<dyn EncounterListener>>>,
    catalog: Arc<dyn ConditionCatalog>,
}

impl EncounterRegistry {
    pub fn new(catalog: Arc<dyn ConditionCatalog>) -> Self {
        Self {
            encounters: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            catalog,
        }
    }

    /// Register a listener; it sees every event committed from now on
    pub fn add_listener(&self, listener: Arc<dyn EncounterListener>) {
        write(&self.listeners).push(listener);
    }

    pub fn catalog(&self) -> &dyn ConditionCatalog {
        self.catalog.as_ref()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a freshly created machine and publish its creation events
    pub fn create(&self, mut machine: EncounterMachine, context: &EventContext) -> Result<Mutation<EncounterSnapshot>> {
        let id = machine.id().to_string();
        let events = machine.drain_events();
        let slot = Arc::new(Mutex::new(Slot { machine, sequence: 0 }));

        // Hold the new slot before publishing it so nobody can dispatch
        // ahead of the creation events.
        let mut guard = lock(&slot);
        {
            let mut encounters = write(&self.encounters);
            if encounters.contains_key(&id) {
                return Err(EngineError::Validation(format!("Encounter {} already exists", id)));
            }
            encounters.insert(id, slot.clone());
        }

        let records = self.commit(&mut guard, events, context);
        Ok(Mutation { value: guard.machine.snapshot(), records })
    }

    /// Insert a machine rebuilt from storage. If another caller hydrated the
    /// same encounter first, the existing instance wins.
    pub fn insert_restored(&self, machine: EncounterMachine) -> bool {
        let mut encounters = write(&self.encounters);
        if encounters.contains_key(machine.id()) {
            return false;
        }
        tracing::debug!(encounter_id = machine.id(), "Restored encounter into registry");
        encounters.insert(
            machine.id().to_string(),
            Arc::new(Mutex::new(Slot { machine, sequence: 0 })),
        );
        true
    }

    /// Drop the in-memory instance
    pub fn release(&self, encounter_id: &str) -> Option<EncounterSnapshot> {
        let slot = write(&self.encounters).remove(encounter_id)?;
        let snapshot = lock(&slot).machine.snapshot();
        tracing::info!(encounter_id, "Released encounter from registry");
        Some(snapshot)
    }

    pub fn contains(&self, encounter_id: &str) -> bool {
        read(&self.encounters).contains_key(encounter_id)
    }

    pub fn encounter_ids(&self) -> Vec<String> {
        read(&self.encounters).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.encounters).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.encounters).is_empty()
    }

    // ========================================================================
    // Access
    // ========================================================================

    /// Run a read-only closure while holding the encounter.
    ///
    /// No events for this encounter can be dispatched while `f` runs, which
    /// lets callers register interest and take a snapshot atomically.
    pub fn inspect<T>(&self, encounter_id: &str, f: impl FnOnce(&EncounterMachine) -> T) -> Result<T> {
        let slot = self.slot(encounter_id)?;
        let guard = lock(&slot);
        Ok(f(&guard.machine))
    }

    pub fn snapshot(&self, encounter_id: &str) -> Result<EncounterSnapshot> {
        self.inspect(encounter_id, |machine| machine.snapshot())
    }

    /// Run a mutating operation to completion and publish its events
    pub fn mutate<T>(
        &self,
        encounter_id: &str,
        context: &EventContext,
        op: impl FnOnce(&mut EncounterMachine, &dyn ConditionCatalog) -> Result<T>,
    ) -> Result<Mutation<T>> {
        let slot = self.slot(encounter_id)?;
        let mut guard = lock(&slot);

        let outcome = op(&mut guard.machine, self.catalog.as_ref());
        let events = guard.machine.drain_events();
        let value = outcome?;

        let records = self.commit(&mut guard, events, context);
        Ok(Mutation { value, records })
    }

    fn slot(&self, encounter_id: &str) -> Result<Arc<Mutex<Slot>>> {
        read(&self.encounters)
            .get(encounter_id)
            .cloned()
            .ok_or_else(|| EngineError::encounter_not_found(encounter_id))
    }

    fn commit(
        &self,
        slot: &mut Slot,
        events: Vec<EncounterEvent>,
        context: &EventContext,
    ) -> Vec<EventRecord> {
        if events.is_empty() {
            return Vec::new();
        }

        let listeners: Vec<Arc<dyn EncounterListener>> = read(&self.listeners).clone();
        let mut records = Vec::with_capacity(events.len());

        for event in events {
            slot.sequence += 1;
            let record = EventRecord {
                encounter_id: slot.machine.id().to_string(),
                session_id: slot.machine.session_id().to_string(),
                sequence: slot.sequence,
                event,
            };
            tracing::trace!(
                encounter_id = %record.encounter_id,
                sequence = record.sequence,
                event = record.event.name(),
                "Dispatching encounter event"
            );
            for listener in &listeners {
                listener.on_event(&record, context);
            }
            records.push(record);
        }
        records
    }
}
