//! Session database operations
//!
//! CRUD for sessions and their participants, and the session status store
//! consumed by the supervisor.

use async_trait::async_trait;

use super::models::SessionRecord;
use super::Database;
use crate::core::persistence::{SessionStatus, SessionStatusStore, StoreResult};

/// Extension trait for session-related database operations
pub trait SessionOps {
    fn create_session(&self, session: &SessionRecord) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;
    fn get_session(&self, id: &str) -> impl std::future::Future<Output = Result<Option<SessionRecord>, sqlx::Error>> + Send;
    fn delete_session(&self, id: &str) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;

    // Participants
    fn add_participant(&self, session_id: &str, user_id: &str, role: &str) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;
    fn remove_participant(&self, session_id: &str, user_id: &str) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;
    fn is_participant(&self, session_id: &str, user_id: &str) -> impl std::future::Future<Output = Result<bool, sqlx::Error>> + Send;
}

impl SessionOps for Database {
    async fn create_session(&self, session: &SessionRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, owner_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.owner_id)
        .bind(&session.status)
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, sqlx::Error> {
        sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    async fn delete_session(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn add_participant(&self, session_id: &str, user_id: &str, role: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO session_participants (session_id, user_id, role, joined_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id, user_id) DO UPDATE SET role = excluded.role
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(role)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn remove_participant(&self, session_id: &str, user_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM session_participants WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn is_participant(&self, session_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM session_participants WHERE session_id = ? AND user_id = ?",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl SessionStatusStore for Database {
    async fn session_status(&self, session_id: &str) -> StoreResult<Option<SessionStatus>> {
        match self.get_session(session_id).await? {
            Some(record) => Ok(Some(record.session_status()?)),
            None => Ok(None),
        }
    }

    async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            tracing::warn!(session_id, %status, "Status update for unknown session");
        }
        Ok(())
    }
}
