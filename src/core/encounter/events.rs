//! Encounter Events
//!
//! Typed events appended by every mutating state-machine operation. They are
//! queued inside the machine and drained by the registry once the operation
//! has committed, then handed to listeners strictly in emission order.

use serde::Serialize;

use super::combat::{EncounterSnapshot, EncounterStatus};
use super::combatant::{Combatant, HitPoints};
use super::conditions::Condition;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Expired,
    Removed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EncounterEvent {
    EncounterCreated {
        snapshot: EncounterSnapshot,
    },
    EncounterStarted {
        snapshot: EncounterSnapshot,
    },
    /// Non-fatal notice, e.g. starting with no combatants
    EncounterWarning {
        message: String,
    },
    TurnAdvanced {
        turn_index: usize,
        round: u32,
        combatant: Option<Combatant>,
    },
    RoundStarted {
        round: u32,
    },
    DamageApplied {
        combatant_id: String,
        amount: u32,
        hit_points: HitPoints,
        combatant: Combatant,
    },
    HealingApplied {
        combatant_id: String,
        amount: u32,
        hit_points: HitPoints,
        combatant: Combatant,
    },
    HitPointsSet {
        combatant_id: String,
        hit_points: HitPoints,
        combatant: Combatant,
    },
    CombatantDefeated {
        combatant_id: String,
    },
    CombatantRevived {
        combatant_id: String,
    },
    ConditionAdded {
        combatant_id: String,
        condition: Condition,
        conditions: Vec<Condition>,
    },
    ConditionRemoved {
        combatant_id: String,
        name: String,
        reason: RemovalReason,
        conditions: Vec<Condition>,
    },
    /// `turn_index` is the pointer after the change
    CombatantAdded {
        combatant: Combatant,
        position: usize,
        turn_index: usize,
    },
    CombatantRemoved {
        combatant_id: String,
        turn_index: usize,
    },
    StatusChanged {
        status: EncounterStatus,
    },
    EncounterReset {
        snapshot: EncounterSnapshot,
    },
    CombatEnded {
        round: u32,
    },
}

impl EncounterEvent {
    /// Event name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            EncounterEvent::EncounterCreated { .. } => "encounter-created",
            EncounterEvent::EncounterStarted { .. } => "encounter-started",
            EncounterEvent::EncounterWarning { .. } => "encounter-warning",
            EncounterEvent::TurnAdvanced { .. } => "turn-advanced",
            EncounterEvent::RoundStarted { .. } => "round-started",
            EncounterEvent::DamageApplied { .. } => "damage-applied",
            EncounterEvent::HealingApplied { .. } => "healing-applied",
            EncounterEvent::HitPointsSet { .. } => "hit-points-set",
            EncounterEvent::CombatantDefeated { .. } => "combatant-defeated",
            EncounterEvent::CombatantRevived { .. } => "combatant-revived",
            EncounterEvent::ConditionAdded { .. } => "condition-added",
            EncounterEvent::ConditionRemoved { .. } => "condition-removed",
            EncounterEvent::CombatantAdded { .. } => "combatant-added",
            EncounterEvent::CombatantRemoved { .. } => "combatant-removed",
            EncounterEvent::StatusChanged { .. } => "status-changed",
            EncounterEvent::EncounterReset { .. } => "encounter-reset",
            EncounterEvent::CombatEnded { .. } => "combat-ended",
        }
    }
}

/// A committed event with the encounter it belongs to and its position in
/// that encounter's stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventRecord {
    pub encounter_id: String,
    pub session_id: String,
    /// Monotonic per encounter, starting at 1
    pub sequence: u64,
    pub event: EncounterEvent,
}

/// Who caused a batch of events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    /// Connection whose request produced the events. It receives every
    /// resulting message tagged with `request_id`, subscribed or not.
    pub origin: Option<String>,
    pub request_id: Option<String>,
}

impl EventContext {
    pub fn system() -> Self {
        Self::default()
    }

    pub fn from_request(connection_id: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            origin: Some(connection_id.into()),
            request_id,
        }
    }

    pub fn is_origin(&self, connection_id: &str) -> bool {
        self.origin.as_deref() == Some(connection_id)
    }
}

/// Consumer of committed encounter events.
///
/// Called synchronously, in emission order, while the encounter is still
/// held by the registry. Implementations must not block or call back into
/// the registry for the same encounter.
pub trait EncounterListener: Send + Sync {
    fn on_event(&self, record: &EventRecord, context: &EventContext);
}
