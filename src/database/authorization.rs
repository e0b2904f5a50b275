//! Ownership-based authorization backed by the session and token tables.

use async_trait::async_trait;

use super::sessions::SessionOps;
use super::tokens::TokenOps;
use super::Database;
use crate::core::collaborators::{Authorization, AuthorizationService};
use crate::core::persistence::StoreResult;

/// Session owners manage everything in their session; participants may join;
/// a token may be manipulated by its owner or by the owner of its session.
#[derive(Clone)]
pub struct DatabaseAuthorization {
    db: Database,
}

impl DatabaseAuthorization {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn owns_session(&self, user_id: &str, session_id: &str) -> StoreResult<bool> {
        Ok(self
            .db
            .get_session(session_id)
            .await?
            .is_some_and(|session| session.owner_id == user_id))
    }
}

#[async_trait]
impl AuthorizationService for DatabaseAuthorization {
    async fn can_join_session(&self, user_id: &str, session_id: &str) -> StoreResult<Authorization> {
        if self.owns_session(user_id, session_id).await? || self.db.is_participant(session_id, user_id).await? {
            return Ok(Authorization::Granted);
        }
        Ok(Authorization::Denied(format!("{} is not a participant of session {}", user_id, session_id)))
    }

    async fn can_manage_session(&self, user_id: &str, session_id: &str) -> StoreResult<Authorization> {
        if self.owns_session(user_id, session_id).await? {
            return Ok(Authorization::Granted);
        }
        Ok(Authorization::Denied(format!("{} does not own session {}", user_id, session_id)))
    }

    async fn can_manipulate_token(&self, user_id: &str, token_id: &str) -> StoreResult<Authorization> {
        let Some(token) = self.db.get_token(token_id).await? else {
            return Ok(Authorization::Denied(format!("Unknown token {}", token_id)));
        };
        if token.owner_id.as_deref() == Some(user_id) || self.owns_session(user_id, &token.session_id).await? {
            return Ok(Authorization::Granted);
        }
        Ok(Authorization::Denied(format!("{} may not control token {}", user_id, token_id)))
    }
}
