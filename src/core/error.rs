//! Engine Error Types
//!
//! One taxonomy shared by the state machine, the broadcast layer and the
//! request dispatcher. Every variant maps onto a stable reason code that is
//! sent to clients inside `ERROR` messages.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence write failed during {operation}: {reason}")]
    PersistenceWriteFailure { operation: String, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn encounter_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { entity: "Encounter", id: id.into() }
    }

    pub fn combatant_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { entity: "Combatant", id: id.into() }
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { entity: "Session", id: id.into() }
    }

    pub fn ack_not_found(ack_id: u64) -> Self {
        Self::NotFound { entity: "Pending acknowledgement", id: ack_id.to_string() }
    }

    /// Stable machine-checkable reason string
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::PersistenceWriteFailure { .. } => "PERSISTENCE_WRITE_FAILURE",
        }
    }

    /// Persistence failures stay inside the synchronizer and never reach clients
    pub fn is_client_visible(&self) -> bool {
        !matches!(self, EngineError::PersistenceWriteFailure { .. })
    }
}
