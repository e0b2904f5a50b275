//! Storage collaborator contracts.
//!
//! The engine only talks to durable storage through these traits. The SQLite
//! implementation lives in `crate::database`; tests substitute mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::core::encounter::{Combatant, Condition, EncounterSnapshot, EncounterStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persisted lifecycle of a game session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Planned,
    Active,
    Paused,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Planned => "PLANNED",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PLANNED" => Some(SessionStatus::Planned),
            "ACTIVE" => Some(SessionStatus::Active),
            "PAUSED" => Some(SessionStatus::Paused),
            "COMPLETED" => Some(SessionStatus::Completed),
            "ABANDONED" => Some(SessionStatus::Abandoned),
            _ => None,
        }
    }

    /// No connection may stay in a session with a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Abandoned)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted encounters with their nested combatant and condition records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EncounterStore: Send + Sync {
    /// Insert or fully replace an encounter and its combatants
    async fn save_encounter(&self, snapshot: &EncounterSnapshot) -> StoreResult<()>;

    async fn load_encounter(&self, encounter_id: &str) -> StoreResult<Option<EncounterSnapshot>>;

    async fn delete_encounter(&self, encounter_id: &str) -> StoreResult<()>;

    async fn update_progress(&self, encounter_id: &str, round: u32, turn_index: usize) -> StoreResult<()>;

    async fn update_round(&self, encounter_id: &str, round: u32) -> StoreResult<()>;

    async fn update_status(&self, encounter_id: &str, status: EncounterStatus) -> StoreResult<()>;

    /// Write current/max/temporary hit points and the defeated flag of one
    /// combatant, and of its backing token when it has one
    async fn update_hit_points(&self, encounter_id: &str, combatant: &Combatant) -> StoreResult<()>;

    async fn replace_conditions(
        &self,
        encounter_id: &str,
        combatant_id: &str,
        conditions: &[Condition],
    ) -> StoreResult<()>;

    /// Insert at `position`, shifting later combatants, and store the
    /// resulting turn pointer
    async fn insert_combatant(
        &self,
        encounter_id: &str,
        combatant: &Combatant,
        position: usize,
        turn_index: usize,
    ) -> StoreResult<()>;

    async fn delete_combatant(&self, encounter_id: &str, combatant_id: &str, turn_index: usize) -> StoreResult<()>;

    /// False when the schema has no condition storage yet
    fn supports_conditions(&self) -> bool;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionStatusStore: Send + Sync {
    async fn session_status(&self, session_id: &str) -> StoreResult<Option<SessionStatus>>;

    async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()>;
}
