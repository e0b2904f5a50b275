//! External collaborator contracts.
//!
//! Authentication, authorization, token lookup and tactical advice are owned
//! by services outside the engine. Each is consumed through a narrow async
//! trait so the engine can run against the SQLite implementations in
//! `crate::database` or against mocks.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::core::encounter::{Combatant, CombatantKind, EncounterSnapshot, HitPoints};
use crate::core::error::{EngineError, Result};
use crate::core::persistence::StoreResult;

pub use crate::core::encounter::{ConditionCatalog, StaticConditionCatalog};

// ============================================================================
// Authorization
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Granted,
    Denied(String),
}

impl Authorization {
    pub fn is_granted(&self) -> bool {
        matches!(self, Authorization::Granted)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Authorization::Granted => Ok(()),
            Authorization::Denied(reason) => Err(EngineError::Unauthorized(reason)),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn can_join_session(&self, user_id: &str, session_id: &str) -> StoreResult<Authorization>;

    /// Owner-level control: create, start, end and edit encounters
    async fn can_manage_session(&self, user_id: &str, session_id: &str) -> StoreResult<Authorization>;

    async fn can_manipulate_token(&self, user_id: &str, token_id: &str) -> StoreResult<Authorization>;
}

// ============================================================================
// Authentication
// ============================================================================

/// Resolves a bearer token to a user id
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<String>;
}

/// Treats the token itself as the user id. Local play only.
#[derive(Debug, Default, Clone)]
pub struct PassthroughAuthenticator;

#[async_trait]
impl Authenticator for PassthroughAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<String> {
        let token = token.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}

/// Fixed token -> user table from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

// ============================================================================
// Token Directory
// ============================================================================

/// Persisted token a combatant can be created from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenProfile {
    pub token_id: String,
    pub session_id: String,
    pub name: String,
    pub kind: CombatantKind,
    pub hit_points: HitPoints,
    pub armor_class: i32,
    pub initiative: i32,
}

impl TokenProfile {
    pub fn into_combatant(self, initiative: Option<i32>) -> Combatant {
        Combatant::new(
            self.token_id.clone(),
            self.name,
            self.kind,
            initiative.unwrap_or(self.initiative),
            self.hit_points,
        )
        .with_armor_class(self.armor_class)
        .with_token(self.token_id)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenDirectory: Send + Sync {
    async fn token(&self, token_id: &str) -> StoreResult<Option<TokenProfile>>;
}

// ============================================================================
// Tactical Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TacticalAction {
    Attack,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TacticalDecision {
    pub actor_id: String,
    pub action: TacticalAction,
    pub target_id: Option<String>,
    pub rationale: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TacticalDecisionProvider: Send + Sync {
    async fn decide(&self, snapshot: &EncounterSnapshot, actor_id: &str) -> Result<TacticalDecision>;
}

/// Attacks the opponent with the fewest effective hit points
#[derive(Debug, Default, Clone)]
pub struct WeakestOpponentAdvisor;

#[async_trait]
impl TacticalDecisionProvider for WeakestOpponentAdvisor {
    async fn decide(&self, snapshot: &EncounterSnapshot, actor_id: &str) -> Result<TacticalDecision> {
        let actor = snapshot
            .combatant(actor_id)
            .ok_or_else(|| EngineError::combatant_not_found(actor_id))?;

        if actor.defeated {
            return Ok(TacticalDecision {
                actor_id: actor_id.to_string(),
                action: TacticalAction::Hold,
                target_id: None,
                rationale: format!("{} is defeated", actor.name),
            });
        }

        let target = snapshot
            .combatants
            .iter()
            .filter(|c| !c.defeated && actor.kind.is_opposed_to(c.kind))
            .min_by_key(|c| (c.hit_points.current + c.hit_points.temporary, c.armor_class));

        let decision = match target {
            Some(target) => TacticalDecision {
                actor_id: actor_id.to_string(),
                action: TacticalAction::Attack,
                target_id: Some(target.id.clone()),
                rationale: format!(
                    "{} has the fewest hit points among opponents ({})",
                    target.name,
                    target.hit_points.current + target.hit_points.temporary
                ),
            },
            None => TacticalDecision {
                actor_id: actor_id.to_string(),
                action: TacticalAction::Hold,
                target_id: None,
                rationale: "No opponents remain standing".to_string(),
            },
        };
        Ok(decision)
    }
}
