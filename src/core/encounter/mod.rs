//! Encounter Module
//!
//! The encounter state machine and everything it owns: combatants,
//! conditions, the typed event stream and the registry of live encounters.

pub mod combat;
pub mod combatant;
pub mod conditions;
pub mod events;
pub mod registry;

// Re-exports for convenience
pub use combat::{EncounterMachine, EncounterSnapshot, EncounterStatus, HealthUpdate};
pub use combatant::{Combatant, CombatantKind, HitPoints, TokenRef};
pub use conditions::{
    Condition, ConditionCatalog, ConditionTracker, StackingRule, StaticConditionCatalog,
};
pub use events::{EncounterEvent, EncounterListener, EventContext, EventRecord, RemovalReason};
pub use registry::{EncounterRegistry, Mutation};
