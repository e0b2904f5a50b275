//! Encounter State Machine
//!
//! Owns the authoritative in-memory state of one encounter: combatants in
//! initiative order, the turn pointer, the round counter and the lifecycle
//! status. Every mutating operation appends typed events to an internal
//! queue which the registry drains after the operation returns.
//!
//! Lifecycle: `Planned -> Active -> {Paused <-> Active} -> Completed`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use super::combatant::Combatant;
use super::conditions::{Condition, ConditionCatalog};
use super::events::{EncounterEvent, RemovalReason};
use crate::core::error::{EngineError, Result};

// ============================================================================
// Encounter Types
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncounterStatus {
    #[default]
    Planned,
    Active,
    Paused,
    Completed,
}

impl EncounterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncounterStatus::Planned => "PLANNED",
            EncounterStatus::Active => "ACTIVE",
            EncounterStatus::Paused => "PAUSED",
            EncounterStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PLANNED" => Some(EncounterStatus::Planned),
            "ACTIVE" => Some(EncounterStatus::Active),
            "PAUSED" => Some(EncounterStatus::Paused),
            "COMPLETED" => Some(EncounterStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for EncounterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full, self-contained view of an encounter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncounterSnapshot {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub status: EncounterStatus,
    pub round: u32,
    pub turn_index: usize,
    pub combatants: Vec<Combatant>,
}

impl EncounterSnapshot {
    pub fn current_combatant(&self) -> Option<&Combatant> {
        self.combatants.get(self.turn_index)
    }

    pub fn combatant(&self, combatant_id: &str) -> Option<&Combatant> {
        self.combatants.iter().find(|c| c.id == combatant_id)
    }
}

/// Requested hit point overwrite (`UPDATE_ACTOR_HEALTH`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthUpdate {
    pub current: u32,
    pub max: Option<u32>,
    pub temporary: Option<u32>,
}

// ============================================================================
// Encounter Machine
// ============================================================================

#[derive(Debug, Clone)]
pub struct EncounterMachine {
    id: String,
    session_id: String,
    name: String,
    status: EncounterStatus,
    round: u32,
    turn_index: usize,
    combatants: Vec<Combatant>,
    next_seq: u64,
    pending: VecDeque<EncounterEvent>,
}

impl EncounterMachine {
    /// Create a planned encounter. Emits `EncounterCreated`.
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        name: impl Into<String>,
        combatants: Vec<Combatant>,
    ) -> Self {
        let mut machine = Self {
            id: id.into(),
            session_id: session_id.into(),
            name: name.into(),
            status: EncounterStatus::Planned,
            round: 1,
            turn_index: 0,
            combatants: Vec::new(),
            next_seq: 0,
            pending: VecDeque::new(),
        };
        for combatant in combatants {
            machine.push_combatant(combatant);
        }
        machine.emit(EncounterEvent::EncounterCreated { snapshot: machine.snapshot() });
        machine
    }

    /// Rebuild a machine from a persisted snapshot. Emits nothing.
    pub fn restore(snapshot: EncounterSnapshot) -> Self {
        let next_seq = snapshot
            .combatants
            .iter()
            .map(|c| c.added_seq + 1)
            .max()
            .unwrap_or(0);
        let turn_index = if snapshot.combatants.is_empty() {
            0
        } else {
            snapshot.turn_index.min(snapshot.combatants.len() - 1)
        };
        Self {
            id: snapshot.id,
            session_id: snapshot.session_id,
            name: snapshot.name,
            status: snapshot.status,
            round: snapshot.round.max(1),
            turn_index,
            combatants: snapshot.combatants,
            next_seq,
            pending: VecDeque::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> EncounterStatus {
        self.status
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn turn_index(&self) -> usize {
        self.turn_index
    }

    pub fn combatants(&self) -> &[Combatant] {
        &self.combatants
    }

    pub fn current_combatant(&self) -> Option<&Combatant> {
        self.combatants.get(self.turn_index)
    }

    pub fn combatant(&self, combatant_id: &str) -> Option<&Combatant> {
        self.combatants.iter().find(|c| c.id == combatant_id)
    }

    pub fn snapshot(&self) -> EncounterSnapshot {
        EncounterSnapshot {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            name: self.name.clone(),
            status: self.status,
            round: self.round,
            turn_index: self.turn_index,
            combatants: self.combatants.clone(),
        }
    }

    /// Take every event queued since the last drain, oldest first
    pub fn drain_events(&mut self) -> Vec<EncounterEvent> {
        self.pending.drain(..).collect()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// PLANNED -> ACTIVE. Appends `combatants`, rolls the initial order and
    /// puts the turn on the highest initiative.
    pub fn start(&mut self, combatants: Vec<Combatant>) -> Result<EncounterSnapshot> {
        if self.status != EncounterStatus::Planned {
            return Err(EngineError::InvalidState(format!(
                "Encounter {} cannot start from {}",
                self.id, self.status
            )));
        }

        for (i, combatant) in combatants.iter().enumerate() {
            self.ensure_unique(&combatant.id)?;
            if combatants[..i].iter().any(|c| c.id == combatant.id) {
                return Err(EngineError::Validation(format!(
                    "Combatant {} listed twice",
                    combatant.id
                )));
            }
        }
        for combatant in combatants {
            self.push_combatant(combatant);
        }
        self.sort_initiative();
        self.status = EncounterStatus::Active;
        self.round = 1;
        self.turn_index = 0;

        if self.combatants.is_empty() {
            self.emit(EncounterEvent::EncounterWarning {
                message: format!("Encounter {} started with no combatants", self.id),
            });
        }

        let snapshot = self.snapshot();
        self.emit(EncounterEvent::EncounterStarted { snapshot: snapshot.clone() });
        Ok(snapshot)
    }

    /// Any state -> COMPLETED. Repeated calls only re-emit `CombatEnded`.
    pub fn end(&mut self) -> EncounterSnapshot {
        self.status = EncounterStatus::Completed;
        self.emit(EncounterEvent::CombatEnded { round: self.round });
        self.snapshot()
    }

    /// ACTIVE -> PAUSED
    pub fn pause(&mut self) -> Result<EncounterSnapshot> {
        self.require_active("pause")?;
        self.status = EncounterStatus::Paused;
        self.emit(EncounterEvent::StatusChanged { status: self.status });
        Ok(self.snapshot())
    }

    /// PAUSED -> ACTIVE
    pub fn resume(&mut self) -> Result<EncounterSnapshot> {
        if self.status != EncounterStatus::Paused {
            return Err(EngineError::InvalidState(format!(
                "Encounter {} cannot resume from {}",
                self.id, self.status
            )));
        }
        self.status = EncounterStatus::Active;
        self.emit(EncounterEvent::StatusChanged { status: self.status });
        Ok(self.snapshot())
    }

    /// Back to round 1, turn 0 with a fresh initiative order. The only
    /// operation that lowers the round counter.
    pub fn reset(&mut self) -> Result<EncounterSnapshot> {
        self.require_active("reset")?;
        self.sort_initiative();
        self.round = 1;
        self.turn_index = 0;
        let snapshot = self.snapshot();
        self.emit(EncounterEvent::EncounterReset { snapshot: snapshot.clone() });
        Ok(snapshot)
    }

    // ========================================================================
    // Turn Order
    // ========================================================================

    /// Advance the turn pointer, wrapping into a new round.
    ///
    /// Conditions of the combatant whose turn just ended are ticked first;
    /// their removal events precede the round and turn events.
    pub fn next_turn(&mut self) -> Result<EncounterSnapshot> {
        self.require_active("advance the turn of")?;

        if self.combatants.is_empty() {
            return Ok(self.snapshot());
        }

        let ending = self.turn_index;
        let expired = self.combatants[ending].conditions.tick_end_of_turn();
        if !expired.is_empty() {
            let combatant_id = self.combatants[ending].id.clone();
            let remaining = self.combatants[ending].conditions.conditions().to_vec();
            for condition in expired {
                self.emit(EncounterEvent::ConditionRemoved {
                    combatant_id: combatant_id.clone(),
                    name: condition.name,
                    reason: RemovalReason::Expired,
                    conditions: remaining.clone(),
                });
            }
        }

        self.turn_index += 1;
        if self.turn_index >= self.combatants.len() {
            self.turn_index = 0;
            self.round += 1;
            self.emit(EncounterEvent::RoundStarted { round: self.round });
        }

        self.emit(EncounterEvent::TurnAdvanced {
            turn_index: self.turn_index,
            round: self.round,
            combatant: self.current_combatant().cloned(),
        });
        Ok(self.snapshot())
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Insert a combatant into initiative order; the current combatant keeps its turn
    pub fn add_combatant(&mut self, combatant: Combatant) -> Result<EncounterSnapshot> {
        self.require_active("add combatants to")?;
        self.ensure_unique(&combatant.id)?;

        let current_id = self.current_combatant().map(|c| c.id.clone());
        let new_id = combatant.id.clone();
        self.push_combatant(combatant);
        self.sort_initiative();
        self.turn_index = current_id
            .and_then(|id| self.position_of(&id))
            .unwrap_or(0);

        let position = self.position_of(&new_id).unwrap_or(0);
        self.emit(EncounterEvent::CombatantAdded {
            combatant: self.combatants[position].clone(),
            position,
            turn_index: self.turn_index,
        });
        Ok(self.snapshot())
    }

    /// Remove a combatant.
    /// Removing someone before the current turn keeps the pointer on the same
    /// combatant; removing the current combatant hands the turn to the next one.
    pub fn remove_combatant(&mut self, combatant_id: &str) -> Result<EncounterSnapshot> {
        self.require_active("remove combatants from")?;
        let pos = self
            .position_of(combatant_id)
            .ok_or_else(|| EngineError::combatant_not_found(combatant_id))?;

        self.combatants.remove(pos);

        if pos < self.turn_index {
            self.turn_index -= 1;
        }
        if self.turn_index >= self.combatants.len() {
            self.turn_index = 0;
        }

        self.emit(EncounterEvent::CombatantRemoved {
            combatant_id: combatant_id.to_string(),
            turn_index: self.turn_index,
        });
        Ok(self.snapshot())
    }

    // ========================================================================
    // Hit Points
    // ========================================================================

    pub fn apply_damage(&mut self, combatant_id: &str, amount: u32) -> Result<EncounterSnapshot> {
        self.require_active("damage combatants in")?;
        let index = self.require_combatant(combatant_id)?;
        if amount == 0 {
            return Ok(self.snapshot());
        }

        let was_defeated = self.combatants[index].defeated;
        self.combatants[index].apply_damage(amount);
        let combatant = self.combatants[index].clone();

        self.emit(EncounterEvent::DamageApplied {
            combatant_id: combatant.id.clone(),
            amount,
            hit_points: combatant.hit_points,
            combatant: combatant.clone(),
        });
        self.emit_defeat_transition(&combatant, was_defeated);
        Ok(self.snapshot())
    }

    pub fn apply_healing(&mut self, combatant_id: &str, amount: u32) -> Result<EncounterSnapshot> {
        self.require_active("heal combatants in")?;
        let index = self.require_combatant(combatant_id)?;
        if amount == 0 {
            return Ok(self.snapshot());
        }

        let was_defeated = self.combatants[index].defeated;
        self.combatants[index].heal(amount);
        let combatant = self.combatants[index].clone();

        self.emit(EncounterEvent::HealingApplied {
            combatant_id: combatant.id.clone(),
            amount,
            hit_points: combatant.hit_points,
            combatant: combatant.clone(),
        });
        self.emit_defeat_transition(&combatant, was_defeated);
        Ok(self.snapshot())
    }

    /// Overwrite hit points. A lower current value is reported as damage, a
    /// higher one as healing, an unchanged one as a plain set.
    pub fn set_hit_points(&mut self, combatant_id: &str, update: HealthUpdate) -> Result<EncounterSnapshot> {
        self.require_active("update combatants in")?;
        let index = self.require_combatant(combatant_id)?;
        if update.max == Some(0) {
            return Err(EngineError::Validation("Maximum hit points must be greater than zero".into()));
        }

        let before = self.combatants[index].hit_points;
        let was_defeated = self.combatants[index].defeated;
        self.combatants[index].set_hit_points(update.current, update.max, update.temporary);
        let combatant = self.combatants[index].clone();
        let after = combatant.hit_points;

        let event = if after.current < before.current {
            EncounterEvent::DamageApplied {
                combatant_id: combatant.id.clone(),
                amount: before.current - after.current,
                hit_points: after,
                combatant: combatant.clone(),
            }
        } else if after.current > before.current {
            EncounterEvent::HealingApplied {
                combatant_id: combatant.id.clone(),
                amount: after.current - before.current,
                hit_points: after,
                combatant: combatant.clone(),
            }
        } else {
            EncounterEvent::HitPointsSet {
                combatant_id: combatant.id.clone(),
                hit_points: after,
                combatant: combatant.clone(),
            }
        };
        self.emit(event);
        self.emit_defeat_transition(&combatant, was_defeated);
        Ok(self.snapshot())
    }

    // ========================================================================
    // Conditions
    // ========================================================================

    /// Attach a condition; how duplicates combine is decided by the catalog
    pub fn add_condition(
        &mut self,
        combatant_id: &str,
        condition: Condition,
        catalog: &dyn ConditionCatalog,
    ) -> Result<EncounterSnapshot> {
        self.require_active("add conditions in")?;
        let index = self.require_combatant(combatant_id)?;
        if condition.name.trim().is_empty() {
            return Err(EngineError::Validation("Condition name must not be empty".into()));
        }
        if condition.remaining == Some(0) {
            return Err(EngineError::Validation("Condition duration must be at least 1".into()));
        }

        let rule = catalog.stacking_rule(&condition.name);
        let combatant = &mut self.combatants[index];
        combatant.conditions.add(condition.clone(), rule);
        let conditions = combatant.conditions.conditions().to_vec();
        let combatant_id = combatant.id.clone();

        self.emit(EncounterEvent::ConditionAdded { combatant_id, condition, conditions });
        Ok(self.snapshot())
    }

    /// Detach a condition by name; absent conditions are a silent no-op
    pub fn remove_condition(&mut self, combatant_id: &str, name: &str) -> Result<EncounterSnapshot> {
        self.require_active("remove conditions in")?;
        let index = self.require_combatant(combatant_id)?;

        let combatant = &mut self.combatants[index];
        let removed = combatant.conditions.remove_by_name(name);
        if !removed.is_empty() {
            let conditions = combatant.conditions.conditions().to_vec();
            let combatant_id = combatant.id.clone();
            self.emit(EncounterEvent::ConditionRemoved {
                combatant_id,
                name: name.to_string(),
                reason: RemovalReason::Removed,
                conditions,
            });
        }
        Ok(self.snapshot())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn emit(&mut self, event: EncounterEvent) {
        self.pending.push_back(event);
    }

    fn emit_defeat_transition(&mut self, combatant: &Combatant, was_defeated: bool) {
        match (was_defeated, combatant.defeated) {
            (false, true) => self.emit(EncounterEvent::CombatantDefeated {
                combatant_id: combatant.id.clone(),
            }),
            (true, false) => self.emit(EncounterEvent::CombatantRevived {
                combatant_id: combatant.id.clone(),
            }),
            _ => {}
        }
    }

    fn require_active(&self, action: &str) -> Result<()> {
        if self.status == EncounterStatus::Active {
            Ok(())
        } else {
            Err(EngineError::InvalidState(format!(
                "Cannot {} encounter {} while {}",
                action, self.id, self.status
            )))
        }
    }

    fn require_combatant(&self, combatant_id: &str) -> Result<usize> {
        self.position_of(combatant_id)
            .ok_or_else(|| EngineError::combatant_not_found(combatant_id))
    }

    fn ensure_unique(&self, combatant_id: &str) -> Result<()> {
        if self.position_of(combatant_id).is_some() {
            Err(EngineError::Validation(format!(
                "Combatant {} is already in encounter {}",
                combatant_id, self.id
            )))
        } else {
            Ok(())
        }
    }

    fn position_of(&self, combatant_id: &str) -> Option<usize> {
        self.combatants.iter().position(|c| c.id == combatant_id)
    }

    fn push_combatant(&mut self, mut combatant: Combatant) {
        combatant.added_seq = self.next_seq;
        self.next_seq += 1;
        self.combatants.push(combatant);
    }

    /// Highest initiative first, ties by insertion order
    fn sort_initiative(&mut self) {
        self.combatants.sort_by(|a, b| {
            b.initiative
                .cmp(&a.initiative)
                .then_with(|| a.added_seq.cmp(&b.added_seq))
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
