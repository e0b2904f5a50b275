//! SQLite Database Module
//!
//! Durable storage for sessions, tokens and encounters. Implements the
//! engine's storage and authorization contracts on top of one sqlx pool.

mod authorization;
mod encounters;
mod migrations;
mod models;
mod sessions;
mod tokens;

pub use authorization::DatabaseAuthorization;
pub use migrations::{run_migrations, run_migrations_to, CONDITIONS_VERSION, SCHEMA_VERSION};
pub use models::*;
pub use sessions::SessionOps;
pub use tokens::TokenOps;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DB_FILE: &str = "encounter_sync.db";

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
    conditions_supported: bool,
}

impl Database {
    /// Open (or create) the database in `data_dir` and migrate it to the latest schema
    pub async fn new(data_dir: &Path) -> Result<Self, sqlx::Error> {
        Self::open_with_schema(&data_dir.join(DB_FILE), SCHEMA_VERSION).await
    }

    /// Open the database file at `path`, migrating no further than `target_version`.
    /// Older schemas run in degraded mode where conditions are not persisted.
    pub async fn open_with_schema(path: &Path, target_version: i32) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(options)
            .await?;

        migrations::run_migrations_to(&pool, target_version).await?;
        let version = migrations::current_version(&pool).await?;
        let conditions_supported = version >= CONDITIONS_VERSION;
        if !conditions_supported {
            tracing::warn!(
                schema_version = version,
                "Schema has no condition storage; conditions will not be persisted"
            );
        }

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            conditions_supported,
        })
    }

    /// Get the underlying pool for direct queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn schema_version(&self) -> Result<i32, sqlx::Error> {
        migrations::current_version(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
