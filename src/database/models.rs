//! Database Records
//!
//! Row types for sessions, tokens, encounters, combatants and conditions,
//! plus conversions to and from the engine's in-memory types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::core::collaborators::TokenProfile;
use crate::core::encounter::{
    Combatant, CombatantKind, Condition, ConditionTracker, EncounterSnapshot, EncounterStatus,
    HitPoints, TokenRef,
};
use crate::core::persistence::{SessionStatus, StoreError, StoreResult};

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn to_u32(value: i64, field: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", field, value)))
}

// ============================================================================
// Session Record
// ============================================================================

/// Session database record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub status: String, // "PLANNED", "ACTIVE", "PAUSED", "COMPLETED", "ABANDONED"
    pub created_at: String,
    pub updated_at: String,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: id.into(),
            name: name.into(),
            owner_id: owner_id.into(),
            status: SessionStatus::Planned.as_str().to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status.as_str().to_string();
        self
    }

    pub fn session_status(&self) -> StoreResult<SessionStatus> {
        SessionStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("session {} has status {}", self.id, self.status)))
    }
}

// ============================================================================
// Token Record
// ============================================================================

/// Persisted token (character sheet stand-in) owned by a session
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenRecord {
    pub id: String,
    pub session_id: String,
    pub owner_id: Option<String>,
    pub name: String,
    pub kind: String,
    pub hp_current: i64,
    pub hp_max: i64,
    pub hp_temporary: i64,
    pub armor_class: i64,
    pub initiative: i64,
    pub updated_at: String,
}

impl TokenRecord {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        name: impl Into<String>,
        kind: CombatantKind,
        hp_max: u32,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            owner_id: None,
            name: name.into(),
            kind: kind.as_str().to_string(),
            hp_current: i64::from(hp_max),
            hp_max: i64::from(hp_max),
            hp_temporary: 0,
            armor_class: 10,
            initiative: 0,
            updated_at: now(),
        }
    }

    pub fn owned_by(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_initiative(mut self, initiative: i32) -> Self {
        self.initiative = i64::from(initiative);
        self
    }

    pub fn with_armor_class(mut self, armor_class: i32) -> Self {
        self.armor_class = i64::from(armor_class);
        self
    }

    pub fn into_profile(self) -> StoreResult<TokenProfile> {
        let kind = CombatantKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("token {} has kind {}", self.id, self.kind)))?;
        Ok(TokenProfile {
            hit_points: HitPoints::new(
                to_u32(self.hp_current, "hp_current")?,
                to_u32(self.hp_max, "hp_max")?,
                to_u32(self.hp_temporary, "hp_temporary")?,
            ),
            armor_class: self.armor_class as i32,
            initiative: self.initiative as i32,
            token_id: self.id,
            session_id: self.session_id,
            name: self.name,
            kind,
        })
    }
}

// ============================================================================
// Encounter Records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EncounterRecord {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub status: String,
    pub round: i64,
    pub turn_index: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl EncounterRecord {
    pub fn from_snapshot(snapshot: &EncounterSnapshot) -> Self {
        let now = now();
        Self {
            id: snapshot.id.clone(),
            session_id: snapshot.session_id.clone(),
            name: snapshot.name.clone(),
            status: snapshot.status.as_str().to_string(),
            round: i64::from(snapshot.round),
            turn_index: snapshot.turn_index as i64,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Assemble the snapshot; `combatants` must already be in turn order
    pub fn into_snapshot(self, combatants: Vec<Combatant>) -> StoreResult<EncounterSnapshot> {
        let status = EncounterStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("encounter {} has status {}", self.id, self.status)))?;
        let turn_index = usize::try_from(self.turn_index)
            .map_err(|_| StoreError::Corrupt(format!("turn_index out of range: {}", self.turn_index)))?;
        Ok(EncounterSnapshot {
            round: to_u32(self.round, "round")?.max(1),
            turn_index: if combatants.is_empty() { 0 } else { turn_index.min(combatants.len() - 1) },
            id: self.id,
            session_id: self.session_id,
            name: self.name,
            status,
            combatants,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CombatantRecord {
    pub encounter_id: String,
    pub id: String,
    pub position: i64,
    pub added_seq: i64,
    pub name: String,
    pub kind: String,
    pub hp_current: i64,
    pub hp_max: i64,
    pub hp_temporary: i64,
    pub armor_class: i64,
    pub initiative: i64,
    pub defeated: bool,
    pub token_id: Option<String>,
}

impl CombatantRecord {
    pub fn from_combatant(encounter_id: &str, combatant: &Combatant, position: usize) -> Self {
        Self {
            encounter_id: encounter_id.to_string(),
            id: combatant.id.clone(),
            position: position as i64,
            added_seq: combatant.added_seq as i64,
            name: combatant.name.clone(),
            kind: combatant.kind.as_str().to_string(),
            hp_current: i64::from(combatant.hit_points.current),
            hp_max: i64::from(combatant.hit_points.max),
            hp_temporary: i64::from(combatant.hit_points.temporary),
            armor_class: i64::from(combatant.armor_class),
            initiative: i64::from(combatant.initiative),
            defeated: combatant.defeated,
            token_id: combatant.token_id().map(str::to_string),
        }
    }

    pub fn into_combatant(self, conditions: Vec<Condition>) -> StoreResult<Combatant> {
        let kind = CombatantKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("combatant {} has kind {}", self.id, self.kind)))?;
        Ok(Combatant {
            hit_points: HitPoints::new(
                to_u32(self.hp_current, "hp_current")?,
                to_u32(self.hp_max, "hp_max")?,
                to_u32(self.hp_temporary, "hp_temporary")?,
            ),
            armor_class: self.armor_class as i32,
            initiative: self.initiative as i32,
            conditions: ConditionTracker::from_conditions(conditions),
            defeated: self.defeated,
            token: self.token_id.map(|token_id| TokenRef { token_id }),
            added_seq: u64::try_from(self.added_seq).unwrap_or_default(),
            id: self.id,
            name: self.name,
            kind,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConditionRecord {
    pub encounter_id: String,
    pub combatant_id: String,
    pub ordinal: i64,
    pub name: String,
    pub remaining: Option<i64>,
    pub source: Option<String>,
    pub applied_at: String,
}

impl ConditionRecord {
    pub fn from_condition(encounter_id: &str, combatant_id: &str, ordinal: usize, condition: &Condition) -> Self {
        Self {
            encounter_id: encounter_id.to_string(),
            combatant_id: combatant_id.to_string(),
            ordinal: ordinal as i64,
            name: condition.name.clone(),
            remaining: condition.remaining.map(i64::from),
            source: condition.source.clone(),
            applied_at: condition.applied_at.to_rfc3339(),
        }
    }

    pub fn into_condition(self) -> StoreResult<Condition> {
        let applied_at = DateTime::parse_from_rfc3339(&self.applied_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("condition {} applied_at: {}", self.name, e)))?;
        Ok(Condition {
            remaining: self.remaining.map(|r| to_u32(r, "remaining")).transpose()?,
            name: self.name,
            source: self.source,
            applied_at,
        })
    }
}
