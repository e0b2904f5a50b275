//! Migration Tests

use tempfile::TempDir;

use crate::core::persistence::EncounterStore;
use crate::database::{Database, CONDITIONS_VERSION, SCHEMA_VERSION};
use crate::tests::common::create_test_db;

#[tokio::test]
async fn test_fresh_database_is_fully_migrated() {
    let (db, _temp) = create_test_db().await;

    assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);
    assert!(db.supports_conditions());
    assert!(db.path().ends_with("encounter_sync.db"));
}

#[tokio::test]
async fn test_reopening_does_not_reapply_migrations() {
    let temp = TempDir::new().unwrap();
    let first = Database::new(temp.path()).await.unwrap();
    first.close().await;

    let second = Database::new(temp.path()).await.unwrap();
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _migrations")
        .fetch_one(second.pool())
        .await
        .unwrap();
    assert_eq!(applied, i64::from(SCHEMA_VERSION));
}

#[tokio::test]
async fn test_old_schema_runs_without_conditions() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("legacy.db");
    let db = Database::open_with_schema(&path, CONDITIONS_VERSION - 1).await.unwrap();

    assert_eq!(db.schema_version().await.unwrap(), CONDITIONS_VERSION - 1);
    assert!(!db.supports_conditions());
}

#[tokio::test]
async fn test_old_schema_upgrades_on_next_open() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("encounter_sync.db");
    let legacy = Database::open_with_schema(&path, 1).await.unwrap();
    legacy.close().await;

    let upgraded = Database::new(temp.path()).await.unwrap();
    assert_eq!(upgraded.schema_version().await.unwrap(), SCHEMA_VERSION);
    assert!(upgraded.supports_conditions());
}
