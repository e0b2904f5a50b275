//! Token database operations

use async_trait::async_trait;

use super::models::TokenRecord;
use super::Database;
use crate::core::collaborators::{TokenDirectory, TokenProfile};
use crate::core::persistence::StoreResult;

/// Extension trait for token-related database operations
pub trait TokenOps {
    fn create_token(&self, token: &TokenRecord) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;
    fn get_token(&self, id: &str) -> impl std::future::Future<Output = Result<Option<TokenRecord>, sqlx::Error>> + Send;
    fn list_session_tokens(&self, session_id: &str) -> impl std::future::Future<Output = Result<Vec<TokenRecord>, sqlx::Error>> + Send;
}

impl TokenOps for Database {
    async fn create_token(&self, token: &TokenRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO tokens (id, session_id, owner_id, name, kind, hp_current, hp_max,
                hp_temporary, armor_class, initiative, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&token.id)
        .bind(&token.session_id)
        .bind(&token.owner_id)
        .bind(&token.name)
        .bind(&token.kind)
        .bind(token.hp_current)
        .bind(token.hp_max)
        .bind(token.hp_temporary)
        .bind(token.armor_class)
        .bind(token.initiative)
        .bind(&token.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_token(&self, id: &str) -> Result<Option<TokenRecord>, sqlx::Error> {
        sqlx::query_as::<_, TokenRecord>("SELECT * FROM tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    async fn list_session_tokens(&self, session_id: &str) -> Result<Vec<TokenRecord>, sqlx::Error> {
        sqlx::query_as::<_, TokenRecord>("SELECT * FROM tokens WHERE session_id = ? ORDER BY name")
            .bind(session_id)
            .fetch_all(self.pool())
            .await
    }
}

#[async_trait]
impl TokenDirectory for Database {
    async fn token(&self, token_id: &str) -> StoreResult<Option<TokenProfile>> {
        self.get_token(token_id)
            .await?
            .map(TokenRecord::into_profile)
            .transpose()
    }
}
